//! Client library for the uverbs daemon.
//!
//! A [`Context`] is one control connection bound to one device. Resources created through it
//! live until they are destroyed or the context goes away, whichever comes first. Work requests
//! and completions never touch the socket: they go through rings shared with the daemon.
pub use uverbs_api as api;
pub use ipc::proto::RingTarget;

pub mod error;
pub mod verbs;

pub use error::Error;
pub use verbs::{
    CompletionQueue, Context, MemoryRegion, ProtectionDomain, QpInitAttr, QueuePair,
};
