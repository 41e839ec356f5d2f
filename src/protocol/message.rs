//! Message envelope: header plus length-prefixed body sections.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Header, MessageStatus, ProtocolError, Result, SERVICE_ERROR_KEY};

/// A request or response envelope.
///
/// # Wire Format
///
/// ```text
/// [HEADER (12 bytes)]
/// [totalBodyLen: u32]
/// [spLen: u32][servicePath]
/// [smLen: u32][serviceMethod]
/// [metaLen: u32][ keyLen: u32, key, valLen: u32, val ... ]
/// [payloadLen: u32][payload]
/// ```
///
/// All multi-byte integers are big-endian. The payload bytes are stored
/// compressed when the header's compress tag is not `None`; compression
/// itself is applied by the caller through a
/// [`CompressorRegistry`](crate::compress::CompressorRegistry) so the
/// header bits always describe the bytes actually on the wire.
///
/// Messages are reusable: [`Message::reset`] clears all fields but keeps
/// backing buffers, so one instance can decode an entire stream.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Fixed-size bit-packed header.
    pub header: Header,
    /// Logical service address, e.g. `"Arith"`.
    pub service_path: String,
    /// Method within the service, e.g. `"Mul"`.
    pub service_method: String,
    /// Free-form key/value metadata. Keys are unique; order is irrelevant.
    pub metadata: HashMap<String, String>,
    /// Encoded (and possibly compressed) payload bytes.
    pub payload: Vec<u8>,
}

impl Message {
    /// Create an empty request message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number shorthand.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.header.seq()
    }

    /// The remote error string of an error-status response, if any.
    #[must_use]
    pub fn service_error(&self) -> Option<&str> {
        if self.header.message_status() == MessageStatus::Error {
            self.metadata.get(SERVICE_ERROR_KEY).map(String::as_str)
        } else {
            None
        }
    }

    /// Store an error string and flip the status to [`MessageStatus::Error`].
    pub fn set_service_error(&mut self, error: impl Into<String>) {
        self.header.set_message_status(MessageStatus::Error);
        self.metadata
            .insert(SERVICE_ERROR_KEY.to_owned(), error.into());
    }

    /// Clear all fields but retain backing buffers for reuse.
    pub fn reset(&mut self) {
        self.header.reset();
        self.service_path.clear();
        self.service_method.clear();
        self.metadata.clear();
        self.payload.clear();
    }

    /// Encode into a single wire frame.
    ///
    /// Fails with [`ProtocolError::MessageTooLong`] when the body would
    /// not fit the `u32` length prefixes.
    pub fn encode(&self) -> Result<Bytes> {
        let meta_len = self
            .metadata
            .iter()
            .map(|(k, v)| 8 + k.len() + v.len())
            .sum::<usize>();

        // spLen + sp + smLen + sm + metaLen + meta + payloadLen + payload
        let body_len =
            4 + self.service_path.len() + 4 + self.service_method.len() + 4 + meta_len + 4
                + self.payload.len();
        let Ok(body_len_u32) = u32::try_from(body_len) else {
            return Err(ProtocolError::MessageTooLong {
                size: body_len,
                max: u32::MAX as usize,
            });
        };

        let mut buf = BytesMut::with_capacity(Header::SIZE + 4 + body_len);
        buf.put_slice(self.header.as_bytes());
        buf.put_u32(body_len_u32);

        buf.put_u32(self.service_path.len() as u32);
        buf.put_slice(self.service_path.as_bytes());
        buf.put_u32(self.service_method.len() as u32);
        buf.put_slice(self.service_method.as_bytes());

        buf.put_u32(meta_len as u32);
        for (k, v) in &self.metadata {
            buf.put_u32(k.len() as u32);
            buf.put_slice(k.as_bytes());
            buf.put_u32(v.len() as u32);
            buf.put_slice(v.as_bytes());
        }

        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Decode a complete frame from a byte slice.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut msg = Self::new();

        if bytes.len() < Header::SIZE + 4 {
            return Err(ProtocolError::Truncated {
                section: "header",
                len: Header::SIZE + 4,
                remaining: bytes.len(),
            });
        }
        if bytes[0] != super::MAGIC_NUMBER {
            return Err(ProtocolError::InvalidMagic { found: bytes[0] });
        }

        let mut header = [0u8; Header::SIZE];
        header.copy_from_slice(&bytes[..Header::SIZE]);
        msg.header = Header::from_bytes(header);

        let body_len = read_u32(&bytes[Header::SIZE..Header::SIZE + 4]) as usize;
        let body = &bytes[Header::SIZE + 4..];
        if body.len() < body_len {
            return Err(ProtocolError::Truncated {
                section: "body",
                len: body_len,
                remaining: body.len(),
            });
        }

        msg.parse_body(&body[..body_len])?;
        Ok(msg)
    }

    /// Decode the next frame from an async byte stream into `self`.
    ///
    /// Fails with [`ProtocolError::InvalidMagic`] on a bad first byte and
    /// [`ProtocolError::MessageTooLong`] when the declared body length
    /// exceeds `max_len`. IO errors (including clean EOF) pass through as
    /// [`ProtocolError::Io`].
    pub async fn read_from<R>(&mut self, reader: &mut R, max_len: usize) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        self.reset();

        let mut header = [0u8; Header::SIZE];
        reader.read_exact(&mut header).await?;
        if header[0] != super::MAGIC_NUMBER {
            return Err(ProtocolError::InvalidMagic { found: header[0] });
        }
        self.header = Header::from_bytes(header);

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes).await?;
        let body_len = u32::from_be_bytes(len_bytes) as usize;
        if body_len > max_len {
            return Err(ProtocolError::MessageTooLong {
                size: body_len,
                max: max_len,
            });
        }

        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body).await?;
        self.parse_body(&body)
    }

    fn parse_body(&mut self, body: &[u8]) -> Result<()> {
        let mut rest = body;

        let sp = take_section(&mut rest, "service path")?;
        self.service_path = str_section(sp, "service path")?.to_owned();

        let sm = take_section(&mut rest, "service method")?;
        self.service_method = str_section(sm, "service method")?.to_owned();

        let mut meta = take_section(&mut rest, "metadata")?;
        while !meta.is_empty() {
            let key = take_meta_field(&mut meta)?;
            let val = take_meta_field(&mut meta)?;
            self.metadata.insert(
                str_section(key, "metadata key")?.to_owned(),
                str_section(val, "metadata value")?.to_owned(),
            );
        }

        let payload = take_section(&mut rest, "payload")?;
        self.payload.clear();
        self.payload.extend_from_slice(payload);
        Ok(())
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes(bytes[..4].try_into().unwrap())
}

/// Split one `len: u32`-prefixed section off the front of `rest`.
fn take_section<'a>(rest: &mut &'a [u8], section: &'static str) -> Result<&'a [u8]> {
    if rest.len() < 4 {
        return Err(ProtocolError::Truncated {
            section,
            len: 4,
            remaining: rest.len(),
        });
    }
    let len = read_u32(rest) as usize;
    let after = &rest[4..];
    if after.len() < len {
        return Err(ProtocolError::Truncated {
            section,
            len,
            remaining: after.len(),
        });
    }
    let (taken, remaining) = after.split_at(len);
    *rest = remaining;
    Ok(taken)
}

/// Like [`take_section`] but malformed lengths are a metadata error.
fn take_meta_field<'a>(meta: &mut &'a [u8]) -> Result<&'a [u8]> {
    if meta.len() < 4 {
        return Err(ProtocolError::MetaKVMissing);
    }
    let len = read_u32(meta) as usize;
    let after = &meta[4..];
    if after.len() < len {
        return Err(ProtocolError::MetaKVMissing);
    }
    let (taken, remaining) = after.split_at(len);
    *meta = remaining;
    Ok(taken)
}

fn str_section<'a>(bytes: &'a [u8], section: &'static str) -> Result<&'a str> {
    std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8 { section })
}

#[cfg(test)]
mod tests {
    use super::super::{CompressType, MessageType, SerializeType};
    use super::*;

    fn sample() -> Message {
        let mut msg = Message::new();
        msg.header.set_message_type(MessageType::Request);
        msg.header.set_serialize_type(SerializeType::Json);
        msg.header.set_seq(42);
        msg.service_path = "Arith".to_owned();
        msg.service_method = "Mul".to_owned();
        msg.metadata
            .insert("trace-id".to_owned(), "abc123".to_owned());
        msg.metadata.insert("tenant".to_owned(), "blue".to_owned());
        msg.payload = br#"{"a":7,"b":8}"#.to_vec();
        msg
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let original = sample();
        let encoded = original.encode().unwrap();
        let decoded = Message::decode(&encoded).unwrap();

        assert_eq!(decoded.service_path, original.service_path);
        assert_eq!(decoded.service_method, original.service_method);
        assert_eq!(decoded.metadata, original.metadata);
        assert_eq!(decoded.payload, original.payload);
        assert_eq!(decoded.seq(), 42);
        assert_eq!(decoded.header.serialize_type(), Some(SerializeType::Json));
    }

    #[test]
    fn test_empty_message_roundtrip() {
        let msg = Message::new();
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert!(decoded.service_path.is_empty());
        assert!(decoded.metadata.is_empty());
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_invalid_magic() {
        let mut encoded = sample().encode().unwrap().to_vec();
        encoded[0] = 0x99;
        assert!(matches!(
            Message::decode(&encoded),
            Err(ProtocolError::InvalidMagic { found: 0x99 })
        ));
    }

    #[test]
    fn test_malformed_metadata() {
        let mut msg = sample();
        msg.metadata.clear();
        let mut encoded = msg.encode().unwrap().to_vec();
        // Grow the declared metadata length so it swallows the payload
        // length prefix and leaves a dangling half-pair.
        let meta_len_at = Header::SIZE + 4 + 4 + 5 + 4 + 3;
        encoded[meta_len_at..meta_len_at + 4].copy_from_slice(&4u32.to_be_bytes());
        assert!(matches!(
            Message::decode(&encoded),
            Err(ProtocolError::MetaKVMissing) | Err(ProtocolError::Truncated { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_from_stream() {
        let a = sample();
        let mut b = sample();
        b.header.set_seq(43);
        b.header.set_compress_type(CompressType::Gzip);

        let mut stream: Vec<u8> = Vec::new();
        stream.extend_from_slice(&a.encode().unwrap());
        stream.extend_from_slice(&b.encode().unwrap());

        let mut reader = std::io::Cursor::new(stream);
        let mut msg = Message::new();

        msg.read_from(&mut reader, 1 << 20).await.unwrap();
        assert_eq!(msg.seq(), 42);
        assert_eq!(msg.metadata, a.metadata);

        msg.read_from(&mut reader, 1 << 20).await.unwrap();
        assert_eq!(msg.seq(), 43);
        assert_eq!(msg.header.compress_type(), Some(CompressType::Gzip));

        // Clean EOF surfaces as an IO error.
        assert!(matches!(
            msg.read_from(&mut reader, 1 << 20).await,
            Err(ProtocolError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_read_from_rejects_oversize() {
        let encoded = sample().encode().unwrap();
        let mut reader = std::io::Cursor::new(encoded.to_vec());
        let mut msg = Message::new();
        assert!(matches!(
            msg.read_from(&mut reader, 8).await,
            Err(ProtocolError::MessageTooLong { size: _, max: 8 })
        ));
    }

    #[test]
    fn test_reset_retains_nothing_visible() {
        let mut msg = sample();
        msg.set_service_error("boom");
        msg.reset();
        assert!(msg.service_path.is_empty());
        assert!(msg.metadata.is_empty());
        assert!(msg.payload.is_empty());
        assert_eq!(msg.header.message_status(), MessageStatus::Normal);
        assert_eq!(msg.seq(), 0);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_encode_rejects_body_over_u32() {
        // Lazily zeroed, so the allocation stays virtual: the guard must
        // fire before any of it is copied into a frame.
        let mut msg = Message::new();
        msg.payload = vec![0u8; u32::MAX as usize + 1];
        assert!(matches!(
            msg.encode(),
            Err(ProtocolError::MessageTooLong { .. })
        ));
    }

    #[test]
    fn test_service_error_helpers() {
        let mut msg = Message::new();
        assert!(msg.service_error().is_none());
        msg.set_service_error("remote handler failed");
        assert_eq!(msg.service_error(), Some("remote handler failed"));
        assert_eq!(msg.header.message_status(), MessageStatus::Error);
    }

    // Property-based tests
    #[cfg(test)]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        use crate::protocol::{CompressType, SerializeType};

        fn serialize_type_strategy() -> impl Strategy<Value = SerializeType> {
            prop_oneof![
                Just(SerializeType::Raw),
                Just(SerializeType::Json),
                Just(SerializeType::Protobuf),
                Just(SerializeType::MsgPack),
                Just(SerializeType::Thrift),
            ]
        }

        fn compress_type_strategy() -> impl Strategy<Value = CompressType> {
            prop_oneof![Just(CompressType::None), Just(CompressType::Gzip)]
        }

        fn meta_strategy() -> impl Strategy<Value = Vec<(String, String)>> {
            prop::collection::vec(("[a-z]{1,12}", "[ -~]{0,32}".prop_map(String::from)), 0..4)
        }

        proptest! {
            /// Any frame must roundtrip through encode/decode untouched,
            /// whatever the header flag combination.
            #[test]
            fn prop_roundtrip_preserves_frame(
                st in serialize_type_strategy(),
                ct in compress_type_strategy(),
                seq in any::<u64>(),
                oneway in any::<bool>(),
                heartbeat in any::<bool>(),
                service_path in "[A-Za-z][A-Za-z0-9]{0,24}",
                service_method in "[A-Za-z][A-Za-z0-9]{0,24}",
                meta in meta_strategy(),
                payload in prop::collection::vec(any::<u8>(), 0..=4096),
            ) {
                let mut msg = Message::new();
                msg.header.set_message_type(MessageType::Request);
                msg.header.set_serialize_type(st);
                msg.header.set_compress_type(ct);
                msg.header.set_seq(seq);
                msg.header.set_oneway(oneway);
                msg.header.set_heartbeat(heartbeat);
                msg.service_path = service_path;
                msg.service_method = service_method;
                msg.metadata = meta.into_iter().collect();
                msg.payload = payload;

                let decoded = Message::decode(&msg.encode().unwrap()).unwrap();

                prop_assert_eq!(decoded.header, msg.header);
                prop_assert_eq!(decoded.service_path, msg.service_path);
                prop_assert_eq!(decoded.service_method, msg.service_method);
                prop_assert_eq!(decoded.metadata, msg.metadata);
                prop_assert_eq!(decoded.payload, msg.payload);
            }

            /// Truncating an encoded frame anywhere inside the body must
            /// error, never panic or succeed.
            #[test]
            fn prop_truncation_is_rejected(
                payload in prop::collection::vec(any::<u8>(), 0..=256),
                cut in any::<prop::sample::Index>(),
            ) {
                let mut msg = Message::new();
                msg.service_path = "Arith".to_owned();
                msg.service_method = "Mul".to_owned();
                msg.payload = payload;
                let encoded = msg.encode().unwrap();

                let cut = cut.index(encoded.len().saturating_sub(1).max(1));
                prop_assert!(Message::decode(&encoded[..cut]).is_err());
            }
        }
    }
}
