//! Client-side call engine and cluster layer.
//!
//! [`Client`] owns one connection and correlates concurrent calls by
//! sequence number; [`XClient`] runs a discovery-fed cluster of clients
//! behind a selection strategy, circuit breakers and failure modes.

mod breaker;
mod call;
#[allow(clippy::module_inception)]
mod client;
mod discovery;
mod error;
mod options;
mod selector;
mod xclient;

pub use breaker::ConsecCircuitBreaker;
pub use call::{CallFuture, Reply};
pub use client::Client;
pub use discovery::{
    DiscoveryFilter, KVPair, PeerDiscovery, ServiceDiscovery, StaticDiscovery,
};
pub use error::{ClientError, Result};
pub use options::{COMPRESS_THRESHOLD, ClientOptions};
pub use selector::{
    ConsistentHashSelector, GeoSelector, RandomSelector, RoundRobinSelector, SelectContext,
    SelectMode, Selector, Weighted, WeightedRoundRobinSelector, new_selector,
};
pub use xclient::{FailMode, XClient};

/// Lock a mutex, recovering the guard when a panicking holder poisoned
/// it. All guarded state here stays consistent across any single
/// operation, so the data is usable either way.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
