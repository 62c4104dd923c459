//! # courier
//!
//! Host side of the chat-to-agent bridge.
//!
//! - [`router`]: maps incoming chat messages onto conversation trees
//! - [`store`]: JSON persistence of the tree manager snapshot
//! - [`app`]: startup restore and service wiring
//!
//! The `courier` binary exposes maintenance commands over the stored
//! snapshot.

#![deny(unsafe_code)]

pub mod app;
pub mod errors;
pub mod router;
pub mod store;

pub use app::{
    Restored, SnapshotSummary, conversation_router, restore_manager, start_limiter, tree_store,
};
pub use errors::{AppError, Result, StoreError};
pub use router::{ConversationRouter, Intake, Routed, STOPPED_TEXT, stop_all, stop_reply};
pub use store::JsonTreeStore;
