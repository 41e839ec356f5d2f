//! Wire-level type tags carried in the message header.

use std::fmt;

/// Direction of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client-to-server request.
    Request = 0,
    /// Server-to-client response.
    Response = 1,
}

impl MessageType {
    /// Convert from the header bit.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        if value == 0 {
            Self::Request
        } else {
            Self::Response
        }
    }

    /// Convert to the header bit.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Status of a message.
///
/// An [`MessageStatus::Error`] response carries the remote error string
/// under the [`SERVICE_ERROR_KEY`](super::SERVICE_ERROR_KEY) metadata key
/// instead of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageStatus {
    /// Normal request or response.
    Normal = 0,
    /// The remote handler failed.
    Error = 1,
}

impl MessageStatus {
    /// Convert from the two status bits.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        if value == 0 {
            Self::Normal
        } else {
            Self::Error
        }
    }

    /// Convert to the status bits.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Payload compression algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressType {
    /// No compression.
    #[default]
    None = 0,
    /// Gzip compression.
    Gzip = 1,
}

impl CompressType {
    /// Convert from the three compression bits.
    ///
    /// Returns `None` for tags with no known algorithm; callers surface
    /// those as an unsupported-compressor error when they try to touch
    /// the payload.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Gzip),
            _ => None,
        }
    }

    /// Convert to the compression bits.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for CompressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Gzip => write!(f, "gzip"),
        }
    }
}

/// Payload serialization format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SerializeType {
    /// Raw bytes, passed through untouched.
    Raw = 0,
    /// JSON via serde_json.
    Json = 1,
    /// Protocol Buffers. No codec is registered by default.
    Protobuf = 2,
    /// MessagePack via rmp-serde. The default for new clients.
    #[default]
    MsgPack = 3,
    /// Thrift. No codec is registered by default.
    Thrift = 4,
}

impl SerializeType {
    /// Convert from the four serialize bits.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Raw),
            1 => Some(Self::Json),
            2 => Some(Self::Protobuf),
            3 => Some(Self::MsgPack),
            4 => Some(Self::Thrift),
            _ => None,
        }
    }

    /// Convert to the serialize bits.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for SerializeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Raw => "raw",
            Self::Json => "json",
            Self::Protobuf => "protobuf",
            Self::MsgPack => "msgpack",
            Self::Thrift => "thrift",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_type_roundtrip() {
        for st in [
            SerializeType::Raw,
            SerializeType::Json,
            SerializeType::Protobuf,
            SerializeType::MsgPack,
            SerializeType::Thrift,
        ] {
            assert_eq!(SerializeType::from_u8(st.as_u8()), Some(st));
        }
        assert_eq!(SerializeType::from_u8(9), None);
    }

    #[test]
    fn test_compress_type_roundtrip() {
        assert_eq!(CompressType::from_u8(0), Some(CompressType::None));
        assert_eq!(CompressType::from_u8(1), Some(CompressType::Gzip));
        assert_eq!(CompressType::from_u8(5), None);
    }
}
