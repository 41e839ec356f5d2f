//! Client-side error taxonomy.
//!
//! Four families: protocol errors (fatal to the message, usually to the
//! connection), transport errors (terminal for every pending call on the
//! connection), application errors (the remote handler failed; a normal
//! completion as far as the connection is concerned) and policy errors
//! (returned synchronously without any network IO).

use thiserror::Error;

use crate::codec::CodecError;
use crate::protocol::ProtocolError;

/// Errors surfaced by [`Client`](super::Client) and
/// [`XClient`](super::XClient) calls.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The connection is shut down; user-initiated.
    #[error("connection is shut down")]
    Shutdown,

    /// The connection dropped with requests still in flight.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// Wire protocol failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Payload codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Transport failure while dialing, reading or writing.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote handler returned an error string.
    #[error("service error: {0}")]
    Service(String),

    /// The per-server circuit breaker is open.
    #[error("breaker open")]
    BreakerOpen,

    /// The breaker-wrapped call exceeded its timeout.
    #[error("breaker time out")]
    BreakerTimeout,

    /// The selector has no candidate servers.
    #[error("no available service")]
    NoAvailableService,

    /// The XClient was closed.
    #[error("xclient is shut down")]
    XClientShutdown,

    /// Dialing the server exceeded the connect timeout.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),
}

impl ClientError {
    /// Whether this error came from the remote handler rather than the
    /// connection. Service errors are never retried and never poison the
    /// cached client or its breaker.
    #[must_use]
    pub fn is_service_error(&self) -> bool {
        matches!(self, Self::Service(_))
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
