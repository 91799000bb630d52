//! Inter-process plumbing between the uverbs daemon and its clients.
//!
//! The data plane is a set of single-producer single-consumer rings living in memfd-backed
//! shared regions. The control plane is a Unix stream socket carrying fixed-size frames, with
//! region descriptors passed alongside as `SCM_RIGHTS` ancillary data.
use std::io;

use thiserror::Error;

pub mod locking;
pub mod proto;
pub mod ring;
pub mod shm;
pub mod unix;

pub use locking::LockingRing;
pub use ring::SpscRing;
pub use shm::SharedRegion;

/// Maximum number of descriptors carried by one control-plane response.
pub const MAX_SEND_FDS: usize = 2;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Memfd: {0}.")]
    Memfd(#[from] memfd::Error),
    #[error("IO: {0}.")]
    Io(#[from] io::Error),
    #[error("Syscall: {0}.")]
    Nix(#[from] nix::Error),
    #[error("Region of {size} bytes is smaller than the required {required} bytes.")]
    BufTooSmall { size: usize, required: usize },
    #[error("Word at offset {offset} is outside the region of {size} bytes.")]
    OutOfBounds { offset: usize, size: usize },
    #[error("Invalid ring layout: {0}.")]
    RingLayout(String),
    #[error("Bad magic: {0:#010x}.")]
    BadMagic(u32),
    #[error("Unknown command: {0}.")]
    UnknownCommand(u32),
    #[error("Payload does not fit in the frame.")]
    PayloadTooLarge,
    #[error("Expected {expected} descriptors, received {received}.")]
    FdCount { expected: usize, received: usize },
    #[error("Peer disconnected.")]
    Disconnected,
}
