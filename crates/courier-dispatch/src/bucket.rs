//! Sliding-window leaky bucket: at most `capacity` admissions in any
//! rolling `window`.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Admission gate used by the dispatcher before every call.
#[derive(Debug)]
pub struct LeakyBucket {
    capacity: usize,
    window: Duration,
    admitted: VecDeque<Instant>,
}

impl LeakyBucket {
    /// A bucket admitting `capacity` calls per `window`. A zero capacity is
    /// treated as one.
    pub fn new(capacity: u32, window: Duration) -> Self {
        let capacity = capacity.max(1) as usize;
        Self {
            capacity,
            window,
            admitted: VecDeque::with_capacity(capacity),
        }
    }

    /// Admit now if there is room, otherwise return how long to wait.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        while let Some(&oldest) = self.admitted.front() {
            if oldest + self.window <= now {
                let _ = self.admitted.pop_front();
            } else {
                break;
            }
        }
        if self.admitted.len() < self.capacity {
            self.admitted.push_back(now);
            return Ok(());
        }
        // Full, so there is an oldest entry.
        let oldest = self.admitted.front().copied().unwrap_or(now);
        Err((oldest + self.window).saturating_duration_since(now))
    }

    /// Wait until the bucket admits one call.
    pub async fn acquire(&mut self) {
        loop {
            match self.try_acquire(Instant::now()) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}
