//! # courier-tree
//!
//! Conversation trees and the per-tree ordered task queue.
//!
//! A [`MessageTree`] is one conversation: a root message plus the replies
//! branching from it, stored as an id-keyed arena. The [`TreeQueueManager`]
//! owns every tree and guarantees that nodes of one tree are processed one
//! at a time, in enqueue order, while different trees run concurrently.
//!
//! - [`node`]: [`MessageNode`] and the [`MessageState`] machine
//! - [`tree`]: [`MessageTree`] and its snapshot form
//! - [`manager`]: [`TreeQueueManager`], aliases, cancellation, restore
//! - [`worker`]: the per-tree worker and the [`Processor`] callback type

#![deny(unsafe_code)]

pub mod errors;
pub mod manager;
pub mod node;
pub mod tree;
pub mod worker;

pub use errors::{Result, TreeError};
pub use manager::{LOST_ON_RESTART, ManagerSnapshot, TreeQueueManager};
pub use node::{MessageNode, MessageState};
pub use tree::{MessageTree, TreeSnapshot};
pub use worker::{Processor, ProcessorFuture, processor};
