//! Wire protocol error types.

use thiserror::Error;

/// Errors raised while framing or parsing messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The first header byte did not match the magic constant.
    #[error("invalid magic number: expected {:#04x}, got {found:#04x}", super::MAGIC_NUMBER)]
    InvalidMagic {
        /// Byte found on the wire.
        found: u8,
    },

    /// Declared body length exceeds the configured maximum.
    #[error("message too long: {size} bytes (max {max})")]
    MessageTooLong {
        /// Declared body size.
        size: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// The metadata region did not split into complete key/value pairs.
    #[error("malformed metadata: some keys or values are missing")]
    MetaKVMissing,

    /// A section length points past the end of the body.
    #[error("truncated message body: {section} length {len} exceeds remaining {remaining} bytes")]
    Truncated {
        /// Section being read when the overrun was detected.
        section: &'static str,
        /// Declared section length.
        len: usize,
        /// Bytes actually remaining.
        remaining: usize,
    },

    /// The compression tag has no registered implementation.
    #[error("unsupported compressor tag: {tag:#x}")]
    UnsupportedCompressor {
        /// Raw compression bits from the header.
        tag: u8,
    },

    /// A string section was not valid UTF-8.
    #[error("invalid UTF-8 in {section}")]
    InvalidUtf8 {
        /// Section that failed to decode.
        section: &'static str,
    },

    /// IO error while reading or writing a frame.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
