use std::io;

use thiserror::Error;

use ipc::proto::Command;
use uverbs_api::Status;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IPC: {0}")]
    Ipc(#[from] ipc::Error),
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    #[error("Daemon returned {0:?}: {0}")]
    Status(Status),
    #[error("Expected a {expected:?} response, got {got:?}")]
    UnexpectedResponse { expected: Command, got: Command },
    #[error("Queue full, {posted} work requests posted")]
    QueueFull { posted: usize },
}

impl Error {
    /// The status the daemon answered with, if the error came from the daemon.
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::Status(s) => Some(*s),
            _ => None,
        }
    }
}
