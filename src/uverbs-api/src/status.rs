use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status carried in the `status` field of every control-plane response header.
///
/// Non-zero values are negated errno codes so that C clients can print them with `strerror`.
#[repr(i32)]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[error("Success")]
    Success = 0,
    #[error("Resource not found")]
    NotFound = -2,
    #[error("I/O or internal failure")]
    Internal = -5,
    #[error("Capacity exhausted")]
    Exhausted = -12,
    #[error("Resource busy")]
    Busy = -16,
    #[error("Resource already exists")]
    Exists = -17,
    #[error("No such device")]
    NoDevice = -19,
    #[error("Invalid argument")]
    Invalid = -22,
    #[error("No device context bound to this connection")]
    NoContext = -107,
}

impl Status {
    #[inline]
    pub fn is_success(&self) -> bool {
        *self == Status::Success
    }

    /// Decodes a raw header status. Codes this build does not know about map to `Internal`.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Status::Success,
            -2 => Status::NotFound,
            -5 => Status::Internal,
            -12 => Status::Exhausted,
            -16 => Status::Busy,
            -17 => Status::Exists,
            -19 => Status::NoDevice,
            -22 => Status::Invalid,
            -107 => Status::NoContext,
            _ => Status::Internal,
        }
    }
}

impl From<Status> for i32 {
    fn from(s: Status) -> i32 {
        s as i32
    }
}
