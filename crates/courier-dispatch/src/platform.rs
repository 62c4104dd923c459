//! Transport boundary and its rate-limited wrapper.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::OutgoingMessage;

use crate::errors::Result;
use crate::limiter::GlobalRateLimiter;

/// A messaging transport that performs the actual network calls.
///
/// Implementations should map throttle responses to
/// [`DispatchError::Throttled`](crate::DispatchError::Throttled), e.g. via
/// [`DispatchError::from_message`](crate::DispatchError::from_message), so
/// the limiter can pause and retry.
#[async_trait]
pub trait MessagingPlatform: Send + Sync + 'static {
    /// Short platform name (`"telegram"`).
    fn name(&self) -> &str;

    /// Send a new message and return its platform message id.
    async fn send_message(&self, message: &OutgoingMessage) -> Result<String>;

    /// Replace the text of an existing message.
    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<()>;
}

/// Dedup key under which edits of one message collapse.
pub fn edit_dedup_key(chat_id: &str, message_id: &str) -> String {
    format!("edit:{chat_id}:{message_id}")
}

/// Routes every call of a [`MessagingPlatform`] through a
/// [`GlobalRateLimiter`].
///
/// Sends are never deduplicated. Edits of the same message collapse to the
/// newest text while queued.
pub struct RateLimitedPlatform<P> {
    inner: Arc<P>,
    limiter: GlobalRateLimiter,
    name: String,
}

impl<P: MessagingPlatform> RateLimitedPlatform<P> {
    /// Wrap `platform`.
    pub fn new(platform: P, limiter: GlobalRateLimiter) -> Self {
        let name = format!("rate_limited_{}", platform.name());
        Self {
            inner: Arc::new(platform),
            limiter,
            name,
        }
    }

    /// The wrapped transport.
    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// The limiter all calls go through.
    pub fn limiter(&self) -> &GlobalRateLimiter {
        &self.limiter
    }

    /// Queue a send. Returns the new message id, or `None` for
    /// fire-and-forget.
    pub async fn queue_send_message(
        &self,
        message: OutgoingMessage,
        fire_and_forget: bool,
    ) -> Result<Option<String>> {
        let inner = Arc::clone(&self.inner);
        let func = move || {
            let inner = Arc::clone(&inner);
            let message = message.clone();
            async move { inner.send_message(&message).await }
        };
        if fire_and_forget {
            self.limiter.fire_and_forget(func, None)?;
            return Ok(None);
        }
        self.limiter.enqueue(func, None).await.map(Some)
    }

    /// Queue an edit, collapsing with other queued edits of the same
    /// message. The newest edit's `parse_mode` wins along with its text.
    pub async fn queue_edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
        parse_mode: Option<&str>,
        fire_and_forget: bool,
    ) -> Result<()> {
        let key = edit_dedup_key(chat_id, message_id);
        let inner = Arc::clone(&self.inner);
        let (chat_id, message_id, text) = (chat_id.to_string(), message_id.to_string(), text.to_string());
        let parse_mode = parse_mode.map(str::to_string);
        let func = move || {
            let inner = Arc::clone(&inner);
            let (chat_id, message_id, text) = (chat_id.clone(), message_id.clone(), text.clone());
            let parse_mode = parse_mode.clone();
            async move {
                inner
                    .edit_message(&chat_id, &message_id, &text, parse_mode.as_deref())
                    .await
            }
        };
        if fire_and_forget {
            return self.limiter.fire_and_forget(func, Some(&key));
        }
        self.limiter.enqueue(func, Some(&key)).await
    }
}

#[async_trait]
impl<P: MessagingPlatform> MessagingPlatform for RateLimitedPlatform<P> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<String> {
        let id = self.queue_send_message(message.clone(), false).await?;
        Ok(id.unwrap_or_default())
    }

    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<()> {
        self.queue_edit_message(chat_id, message_id, text, parse_mode, false)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::limiter::LimiterConfig;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
        edits: Mutex<Vec<(String, String)>>,
        modes: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl MessagingPlatform for Recorder {
        fn name(&self) -> &str {
            "mock"
        }

        async fn send_message(&self, message: &OutgoingMessage) -> Result<String> {
            let mut sent = self.sent.lock();
            sent.push(message.text.clone());
            Ok(format!("msg-{}", sent.len()))
        }

        async fn edit_message(
            &self,
            _chat_id: &str,
            message_id: &str,
            text: &str,
            parse_mode: Option<&str>,
        ) -> Result<()> {
            self.edits.lock().push((message_id.to_string(), text.to_string()));
            self.modes.lock().push(parse_mode.map(str::to_string));
            Ok(())
        }
    }

    fn platform(window: Duration) -> RateLimitedPlatform<Recorder> {
        let limiter = GlobalRateLimiter::start(LimiterConfig {
            rate_limit: 1,
            rate_window: window,
            ..LimiterConfig::default()
        });
        RateLimitedPlatform::new(Recorder::default(), limiter)
    }

    #[tokio::test(start_paused = true)]
    async fn name_is_prefixed() {
        let p = platform(Duration::from_millis(10));
        assert_eq!(p.name(), "rate_limited_mock");
    }

    #[tokio::test(start_paused = true)]
    async fn sends_return_ids_and_are_not_deduplicated() {
        let p = platform(Duration::from_millis(10));
        let a = p.queue_send_message(OutgoingMessage::new("c", "one"), false);
        let b = p.queue_send_message(OutgoingMessage::new("c", "two"), false);
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap().as_deref(), Some("msg-1"));
        assert_eq!(b.unwrap().as_deref(), Some("msg-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_edits_collapse_to_latest_text() {
        let p = platform(Duration::from_secs(1));
        // Occupy the bucket so the edits stay queued together.
        let _ = p.send_message(&OutgoingMessage::new("c", "status")).await.unwrap();

        for text in ["thinking", "running tool", "done"] {
            p.queue_edit_message("c", "msg-1", text, Some("markdown"), true)
                .await
                .unwrap();
        }
        p.queue_edit_message("c", "msg-1", "final", Some("markdown"), false)
            .await
            .unwrap();

        let edits = p.inner().edits.lock().clone();
        assert_eq!(edits, vec![("msg-1".to_string(), "final".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_passes_parse_mode_through() {
        let p = platform(Duration::from_millis(10));
        p.edit_message("c", "msg-1", "<b>hi</b>", Some("html")).await.unwrap();
        p.edit_message("c", "msg-2", "plain", None).await.unwrap();
        assert_eq!(*p.inner().modes.lock(), vec![Some("html".to_string()), None]);
    }

    #[test]
    fn edit_key_format() {
        assert_eq!(edit_dedup_key("42", "7"), "edit:42:7");
    }
}
