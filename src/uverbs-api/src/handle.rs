use serde::{Deserialize, Serialize};

/// A caller-visible resource handle. Handles are allocated from 1 upwards by each table and are
/// never reused while that table exists.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Handle(pub u32);

impl Handle {
    pub const INVALID: Handle = Handle(0);

    #[inline]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl From<u32> for Handle {
    fn from(x: u32) -> Self {
        Handle(x)
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub trait AsHandle {
    #[must_use]
    fn as_handle(&self) -> Handle;
}

impl AsHandle for Handle {
    #[inline]
    fn as_handle(&self) -> Handle {
        *self
    }
}
