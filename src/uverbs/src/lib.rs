//! Core of the uverbs daemon: resource graph, memory region index, data-plane workers and the
//! control channel that clients talk to.
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use thiserror::Error;
use zerocopy::FromBytes;

use ipc::proto::RingDescriptor;
use ipc::SpscRing;
use uverbs_api::{Handle, Status};

pub use tracing as log;

pub mod config;
pub mod context;
pub mod control;
pub mod cq;
pub mod daemon;
pub mod device;
pub mod driver;
pub mod mr;
pub mod pd;
pub mod qp;
pub mod resource;

pub use config::Config;
pub use context::Context;
pub use control::ControlChannel;
pub use daemon::Daemon;
pub use device::Device;

/// A ring shared between the control thread, which creates and destroys it, and the worker that
/// serves it. The lock makes the daemon a single logical endpoint even when several QPs on
/// different workers complete into the same CQ.
pub type SharedRing<T> = Arc<spin::Mutex<SpscRing<T>>>;

pub(crate) fn describe<T: Copy + FromBytes>(
    ring: &SharedRing<T>,
) -> Result<(RingDescriptor, RawFd), ipc::Error> {
    let ring = ring.lock();
    let region = ring.region();
    let desc = RingDescriptor::new(region.name(), region.size(), ring.depth(), ring.capacity())?;
    Ok((desc, region.fd()))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Resource: {0}")]
    Resource(#[from] resource::Error),
    #[error("IPC: {0}")]
    Ipc(#[from] ipc::Error),
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    #[error("No such device: {0}")]
    NoDevice(String),
    #[error("A context is already bound to this connection")]
    AlreadyOpen,
    #[error("No context is bound to this connection")]
    NoContext,
    #[error("Invalid argument: {0}")]
    Invalid(String),
    #[error("CQ {0} is still attached to a QP")]
    CqBusy(Handle),
}

impl Error {
    /// System and protocol failures end the connection; everything else is reported in the
    /// response status.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Ipc(_) | Error::Io(_))
    }
}

impl From<&Error> for Status {
    fn from(e: &Error) -> Status {
        match e {
            Error::Resource(resource::Error::NotFound) => Status::NotFound,
            Error::Resource(resource::Error::Exhausted) => Status::Exhausted,
            Error::NoDevice(_) => Status::NoDevice,
            Error::AlreadyOpen => Status::Exists,
            Error::NoContext => Status::NoContext,
            Error::Invalid(_) => Status::Invalid,
            Error::CqBusy(_) => Status::Busy,
            Error::Ipc(_) | Error::Io(_) => Status::Internal,
        }
    }
}
