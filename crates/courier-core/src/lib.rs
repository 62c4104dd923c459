//! # courier-core
//!
//! Foundation types shared by every Courier crate:
//!
//! - **Messages**: [`IncomingMessage`] / [`OutgoingMessage`], the
//!   platform-agnostic records a transport adapter produces and consumes
//! - **Payload**: [`NodePayload`], the opaque value carried by every
//!   conversation node
//! - **Errors**: [`ErrorCategory`] and the [`Categorize`] trait implemented
//!   by every crate's `thiserror` enum
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` subscriber
//! - **Metrics**: metric name constants in [`metrics`]

#![deny(unsafe_code)]

pub mod errors;
pub mod logging;
pub mod messages;
pub mod metrics;

pub use errors::{Categorize, ErrorCategory};
pub use logging::LogFormat;
pub use messages::{IncomingMessage, NodePayload, OutgoingMessage};
