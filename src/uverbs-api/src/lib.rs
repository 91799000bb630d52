//! Vocabulary shared by the uverbs daemon and its clients: handles, status codes and the
//! records that cross the shared-memory rings.
pub mod handle;
pub mod status;
pub mod verbs;

pub use handle::{AsHandle, Handle};
pub use status::Status;
pub use verbs::*;

/// Maximum length of a device name on the wire, including the trailing NUL.
pub const MAX_DEV_NAME_LEN: usize = 64;

/// Maximum length of a shared ring name on the wire, including the trailing NUL.
pub const MAX_RING_NAME_LEN: usize = 128;

/// Default control socket file name, joined onto the configured prefix.
pub const DEFAULT_SOCKET_NAME: &str = "uverbsd.sock";
