//! Fixed 12-byte message header.

use super::{CompressType, MAGIC_NUMBER, MessageStatus, MessageType, SerializeType};

/// Message header (12 bytes, big-endian multi-byte fields).
///
/// # Wire Format
///
/// ```text
/// byte 0      magic constant (0x08)
/// byte 1      protocol version
/// byte 2      bit 7    message type (0=request, 1=response)
///             bit 6    heartbeat flag
///             bit 5    oneway flag
///             bits 4-2 compress type
///             bits 1-0 message status
/// byte 3      bits 7-4 serialize type, bits 3-0 reserved
/// bytes 4-11  sequence number (u64, big-endian)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header([u8; Header::SIZE]);

impl Header {
    /// Header size in bytes.
    pub const SIZE: usize = 12;

    /// Create a request header with the current protocol version.
    #[must_use]
    pub fn new() -> Self {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = MAGIC_NUMBER;
        bytes[1] = super::VERSION;
        Self(bytes)
    }

    /// Reconstruct a header from raw bytes without validation.
    ///
    /// Use [`Header::check_magic`] before trusting the contents.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw header bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }

    /// Whether byte 0 carries the magic constant.
    #[must_use]
    pub const fn check_magic(&self) -> bool {
        self.0[0] == MAGIC_NUMBER
    }

    /// Protocol version.
    #[must_use]
    pub const fn version(&self) -> u8 {
        self.0[1]
    }

    /// Set the protocol version.
    pub const fn set_version(&mut self, version: u8) {
        self.0[1] = version;
    }

    /// Message direction.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        MessageType::from_u8(self.0[2] >> 7)
    }

    /// Set the message direction.
    pub const fn set_message_type(&mut self, mt: MessageType) {
        self.0[2] = (self.0[2] & !0x80) | (mt.as_u8() << 7);
    }

    /// Heartbeat flag.
    #[must_use]
    pub const fn is_heartbeat(&self) -> bool {
        self.0[2] & 0x40 == 0x40
    }

    /// Set the heartbeat flag.
    pub const fn set_heartbeat(&mut self, heartbeat: bool) {
        if heartbeat {
            self.0[2] |= 0x40;
        } else {
            self.0[2] &= !0x40;
        }
    }

    /// Oneway flag: no response is expected for this request.
    #[must_use]
    pub const fn is_oneway(&self) -> bool {
        self.0[2] & 0x20 == 0x20
    }

    /// Set the oneway flag.
    pub const fn set_oneway(&mut self, oneway: bool) {
        if oneway {
            self.0[2] |= 0x20;
        } else {
            self.0[2] &= !0x20;
        }
    }

    /// Raw compression bits (may name an unregistered algorithm).
    #[must_use]
    pub const fn compress_tag(&self) -> u8 {
        (self.0[2] & 0x1C) >> 2
    }

    /// Compression type, if the tag names a known algorithm.
    #[must_use]
    pub const fn compress_type(&self) -> Option<CompressType> {
        CompressType::from_u8(self.compress_tag())
    }

    /// Set the compression type.
    pub const fn set_compress_type(&mut self, ct: CompressType) {
        self.0[2] = (self.0[2] & !0x1C) | (ct.as_u8() << 2);
    }

    /// Message status.
    #[must_use]
    pub const fn message_status(&self) -> MessageStatus {
        MessageStatus::from_u8(self.0[2] & 0x03)
    }

    /// Set the message status.
    pub const fn set_message_status(&mut self, status: MessageStatus) {
        self.0[2] = (self.0[2] & !0x03) | status.as_u8();
    }

    /// Payload serialization format, if the tag is known.
    #[must_use]
    pub const fn serialize_type(&self) -> Option<SerializeType> {
        SerializeType::from_u8((self.0[3] & 0xF0) >> 4)
    }

    /// Raw serialize bits.
    #[must_use]
    pub const fn serialize_tag(&self) -> u8 {
        (self.0[3] & 0xF0) >> 4
    }

    /// Set the payload serialization format.
    pub const fn set_serialize_type(&mut self, st: SerializeType) {
        self.0[3] = (self.0[3] & !0xF0) | (st.as_u8() << 4);
    }

    /// Sequence number.
    #[must_use]
    pub fn seq(&self) -> u64 {
        u64::from_be_bytes(self.0[4..12].try_into().unwrap())
    }

    /// Set the sequence number.
    pub fn set_seq(&mut self, seq: u64) {
        self.0[4..12].copy_from_slice(&seq.to_be_bytes());
    }

    /// Reset to a fresh request header, keeping magic and version.
    pub fn reset(&mut self) {
        let version = self.0[1];
        self.0 = [0u8; Self::SIZE];
        self.0[0] = MAGIC_NUMBER;
        self.0[1] = version;
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}
