//! Binary wire protocol: fixed 12-byte header plus length-prefixed body.

mod error;
mod header;
mod message;
mod types;

pub use error::{ProtocolError, Result};
pub use header::Header;
pub use message::Message;
pub use types::{CompressType, MessageStatus, MessageType, SerializeType};

/// Magic constant carried in header byte 0.
pub const MAGIC_NUMBER: u8 = 0x08;

/// Current protocol version.
pub const VERSION: u8 = 0;

/// Default maximum accepted body length (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Reserved metadata key carrying the remote error string of an
/// error-status response.
pub const SERVICE_ERROR_KEY: &str = "__rpc_error__";
