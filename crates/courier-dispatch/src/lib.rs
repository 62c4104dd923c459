//! # courier-dispatch
//!
//! The process-wide outgoing call queue.
//!
//! Every send or edit goes through one [`GlobalRateLimiter`], which admits
//! at most R calls per rolling window, collapses queued calls that share a
//! dedup key, and backs off globally when the platform signals flood
//! control. [`RateLimitedPlatform`] applies it to a [`MessagingPlatform`].

#![deny(unsafe_code)]

pub mod bucket;
pub mod errors;
pub mod limiter;
pub mod platform;

pub use bucket::LeakyBucket;
pub use errors::{DispatchError, Result};
pub use limiter::{GlobalRateLimiter, LimiterConfig, MAX_FLOOD_PAUSE};
pub use platform::{MessagingPlatform, RateLimitedPlatform, edit_dedup_key};
