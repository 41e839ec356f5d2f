//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::codec::CodecRegistry;
use crate::compress::CompressorRegistry;
use crate::protocol::{CompressType, DEFAULT_MAX_MESSAGE_SIZE, SerializeType};

/// Payloads below this size are never compressed.
pub const COMPRESS_THRESHOLD: usize = 1024;

/// Configuration for [`Client`](super::Client) and
/// [`XClient`](super::XClient) instances.
#[derive(Clone)]
pub struct ClientOptions {
    /// Timeout for dialing a server. Default 10 s.
    pub connect_timeout: Duration,

    /// Per-call retry count for the Failover and Failtry modes. Default 3.
    pub retries: usize,

    /// Serialization format for request payloads. Default MessagePack.
    pub serialize_type: SerializeType,

    /// Compression applied to request payloads above
    /// [`COMPRESS_THRESHOLD`]. Default none.
    pub compress_type: CompressType,

    /// How long Failbackup waits for the primary before racing a
    /// secondary request. Default 10 ms.
    pub backup_latency: Duration,

    /// Largest accepted message body. Default 16 MiB.
    pub max_message_size: usize,

    /// Candidate group filter; when set, only servers advertising
    /// `group=<this>` in their metadata are selected. Default unset.
    pub group: Option<String>,

    /// Consecutive-failure threshold of the per-server breaker. Default 5.
    pub breaker_threshold: u64,

    /// Sliding failure window of the per-server breaker. Default 30 s.
    pub breaker_window: Duration,

    /// Send a heartbeat frame at this interval. Default off.
    pub heartbeat_interval: Option<Duration>,

    /// Payload codec table.
    pub codecs: Arc<CodecRegistry>,

    /// Payload compressor table.
    pub compressors: Arc<CompressorRegistry>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            retries: 3,
            serialize_type: SerializeType::MsgPack,
            compress_type: CompressType::None,
            backup_latency: Duration::from_millis(10),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            group: None,
            breaker_threshold: 5,
            breaker_window: Duration::from_secs(30),
            heartbeat_interval: None,
            codecs: Arc::new(CodecRegistry::new()),
            compressors: Arc::new(CompressorRegistry::new()),
        }
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("connect_timeout", &self.connect_timeout)
            .field("retries", &self.retries)
            .field("serialize_type", &self.serialize_type)
            .field("compress_type", &self.compress_type)
            .field("backup_latency", &self.backup_latency)
            .field("max_message_size", &self.max_message_size)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}
