//! meshcall - binary RPC protocol and clustered client
//!
//! This library speaks a compact binary RPC framing (12-byte header,
//! length-prefixed body) and layers a full client stack on top of it:
//! sequence-correlated concurrent calls over one connection, pluggable
//! payload codecs and compressors, circuit breaking, server selection
//! strategies and discovery-driven failover.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshcall::{ClientOptions, FailMode, PeerDiscovery, SelectMode, XClient};
//!
//! # async fn run() -> meshcall::client::Result<()> {
//! let discovery = Arc::new(PeerDiscovery::new("tcp@127.0.0.1:8972", ""));
//! let xclient = XClient::new(
//!     "Arith",
//!     FailMode::Failover,
//!     SelectMode::RoundRobin,
//!     discovery,
//!     ClientOptions::default(),
//! );
//!
//! let product: u64 = xclient.call("Mul", &[7u64, 6u64]).await?;
//! assert_eq!(product, 42);
//! # Ok(())
//! # }
//! ```
//!
//! # Layers
//!
//! - [`protocol`] - wire framing: header bit layout, message encode/decode
//! - [`codec`] - payload serialization (raw, JSON, MessagePack)
//! - [`compress`] - payload compression (gzip)
//! - [`client`] - call engine, selectors, breakers, discovery, [`XClient`]

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod client;
pub mod codec;
pub mod compress;
pub mod protocol;

pub use client::{
    CallFuture, Client, ClientError, ClientOptions, FailMode, KVPair, PeerDiscovery, Reply,
    SelectMode, ServiceDiscovery, StaticDiscovery, XClient,
};
pub use codec::{Codec, CodecRegistry};
pub use compress::{Compressor, CompressorRegistry, GzipCompressor};
pub use protocol::{
    CompressType, Header, MAGIC_NUMBER, Message, MessageStatus, MessageType, ProtocolError,
    SerializeType,
};
