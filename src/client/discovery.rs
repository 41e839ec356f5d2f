//! Service discovery boundary.
//!
//! Discovery sources publish `address -> metadata` snapshots. The concrete
//! sources here are the in-process ones: a runtime-updatable static list
//! and a single-peer wrapper. Registry-backed sources plug in through the
//! same [`ServiceDiscovery`] trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::trace;

/// One discovered server: `key` is a `network@address` locator, `value`
/// is a query-string of metadata (`weight=4&group=prod`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KVPair {
    /// Server locator, e.g. `tcp@127.0.0.1:8972`.
    pub key: String,
    /// Metadata query string. May be empty.
    pub value: String,
}

impl KVPair {
    /// Build a pair from locator and metadata.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Predicate applied to every pair before it enters a snapshot.
pub type DiscoveryFilter = Arc<dyn Fn(&KVPair) -> bool + Send + Sync>;

/// Capacity of each watcher channel. A slow watcher loses notifications
/// instead of blocking the publisher; every snapshot is full, so the next
/// delivered one supersedes anything dropped.
const WATCH_BUFFER: usize = 10;

/// Source of server snapshots for an XClient.
pub trait ServiceDiscovery: Send + Sync {
    /// Current snapshot, with the configured filter applied.
    fn get_services(&self) -> Vec<KVPair>;

    /// Subscribe to full-snapshot updates.
    fn watch(&self) -> mpsc::Receiver<Vec<KVPair>>;

    /// Install a predicate applied to every pair in every snapshot.
    fn set_filter(&self, filter: DiscoveryFilter);

    /// Derive a discovery handle scoped to another service path. Sources
    /// without per-service state hand back a clone.
    fn clone_for(&self, service_path: &str) -> Arc<dyn ServiceDiscovery>;

    /// Stop publishing; live watchers see their channel close.
    fn close(&self);
}

struct StaticInner {
    pairs: Vec<KVPair>,
    filter: Option<DiscoveryFilter>,
    watchers: Vec<mpsc::Sender<Vec<KVPair>>>,
    closed: bool,
}

/// Fixed or runtime-updatable server list.
///
/// [`StaticDiscovery::update`] replaces the list and fans the new snapshot
/// out to every live watcher. Clones share state, so an update through one
/// handle is visible through all of them.
#[derive(Clone)]
pub struct StaticDiscovery {
    inner: Arc<Mutex<StaticInner>>,
}

impl StaticDiscovery {
    /// Build from an initial server list.
    #[must_use]
    pub fn new(pairs: Vec<KVPair>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StaticInner {
                pairs,
                filter: None,
                watchers: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Replace the server list and notify every live watcher.
    pub fn update(&self, pairs: Vec<KVPair>) {
        let mut inner = super::lock(&self.inner);
        if inner.closed {
            return;
        }
        inner.pairs = pairs;
        let snapshot = filtered(&inner.pairs, inner.filter.as_ref());
        inner.watchers.retain(|tx| match tx.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Snapshots are full replacements; a later one makes up
                // for this drop.
                trace!("discovery watcher lagging, dropping snapshot");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

fn filtered(pairs: &[KVPair], filter: Option<&DiscoveryFilter>) -> Vec<KVPair> {
    match filter {
        Some(f) => pairs.iter().filter(|p| f(p)).cloned().collect(),
        None => pairs.to_vec(),
    }
}

impl ServiceDiscovery for StaticDiscovery {
    fn get_services(&self) -> Vec<KVPair> {
        let inner = super::lock(&self.inner);
        filtered(&inner.pairs, inner.filter.as_ref())
    }

    fn watch(&self) -> mpsc::Receiver<Vec<KVPair>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let mut inner = super::lock(&self.inner);
        if !inner.closed {
            inner.watchers.push(tx);
        }
        rx
    }

    fn set_filter(&self, filter: DiscoveryFilter) {
        let mut inner = super::lock(&self.inner);
        inner.filter = Some(filter);
    }

    fn clone_for(&self, _service_path: &str) -> Arc<dyn ServiceDiscovery> {
        Arc::new(self.clone())
    }

    fn close(&self) {
        let mut inner = super::lock(&self.inner);
        inner.closed = true;
        inner.watchers.clear();
    }
}

/// Single-server discovery for direct peer-to-peer clients.
pub struct PeerDiscovery {
    inner: StaticDiscovery,
}

impl PeerDiscovery {
    /// Build a discovery that only ever yields `addr` with `meta`.
    #[must_use]
    pub fn new(addr: impl Into<String>, meta: impl Into<String>) -> Self {
        Self {
            inner: StaticDiscovery::new(vec![KVPair::new(addr, meta)]),
        }
    }
}

impl ServiceDiscovery for PeerDiscovery {
    fn get_services(&self) -> Vec<KVPair> {
        self.inner.get_services()
    }

    fn watch(&self) -> mpsc::Receiver<Vec<KVPair>> {
        self.inner.watch()
    }

    fn set_filter(&self, filter: DiscoveryFilter) {
        self.inner.set_filter(filter);
    }

    fn clone_for(&self, _service_path: &str) -> Arc<dyn ServiceDiscovery> {
        Arc::new(Self {
            inner: self.inner.clone(),
        })
    }

    fn close(&self) {
        self.inner.close();
    }
}

/// Look up one key in a `k1=v1&k2=v2` metadata string.
pub(crate) fn query_value(meta: &str, key: &str) -> Option<String> {
    meta.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_owned())
    })
}

/// Turn a snapshot into the candidate map selectors run over, dropping
/// servers marked `state=inactive` and, if `group` is set, servers outside
/// that group.
pub(crate) fn filter_by_state_and_group(
    pairs: &[KVPair],
    group: Option<&str>,
) -> HashMap<String, String> {
    pairs
        .iter()
        .filter(|p| query_value(&p.value, "state").as_deref() != Some("inactive"))
        .filter(|p| match group {
            Some(g) => query_value(&p.value, "group").as_deref() == Some(g),
            None => true,
        })
        .map(|p| (p.key.clone(), p.value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_discovery_snapshot_and_update() {
        let d = StaticDiscovery::new(vec![KVPair::new("tcp@a:1", "")]);
        assert_eq!(d.get_services().len(), 1);

        let mut rx = d.watch();
        d.update(vec![KVPair::new("tcp@a:1", ""), KVPair::new("tcp@b:2", "")]);
        let snapshot = rx.try_recv().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(d.get_services(), snapshot);
    }

    #[test]
    fn test_full_watcher_does_not_block_publisher() {
        let d = StaticDiscovery::new(vec![]);
        let mut rx = d.watch();
        for i in 0..WATCH_BUFFER + 5 {
            d.update(vec![KVPair::new(format!("tcp@s:{i}"), "")]);
        }
        // The watcher kept the first WATCH_BUFFER snapshots and lost the
        // rest; nothing deadlocked.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, WATCH_BUFFER);
    }

    #[test]
    fn test_filter_applies_to_snapshots() {
        let d = StaticDiscovery::new(vec![
            KVPair::new("tcp@a:1", "weight=1"),
            KVPair::new("tcp@b:2", "weight=9"),
        ]);
        d.set_filter(Arc::new(|p: &KVPair| {
            query_value(&p.value, "weight").as_deref() == Some("9")
        }));
        let services = d.get_services();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].key, "tcp@b:2");
    }

    #[test]
    fn test_closed_discovery_stops_publishing() {
        let d = StaticDiscovery::new(vec![]);
        let mut rx = d.watch();
        d.close();
        d.update(vec![KVPair::new("tcp@a:1", "")]);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_peer_discovery_yields_single_server() {
        let d = PeerDiscovery::new("tcp@127.0.0.1:8972", "group=prod");
        let services = d.get_services();
        assert_eq!(services, vec![KVPair::new("tcp@127.0.0.1:8972", "group=prod")]);
    }

    #[test]
    fn test_state_and_group_filtering() {
        let pairs = vec![
            KVPair::new("tcp@a:1", "group=prod"),
            KVPair::new("tcp@b:2", "group=prod&state=inactive"),
            KVPair::new("tcp@c:3", "group=staging"),
            KVPair::new("tcp@d:4", ""),
        ];

        let all = filter_by_state_and_group(&pairs, None);
        assert_eq!(all.len(), 3);
        assert!(!all.contains_key("tcp@b:2"));

        let prod = filter_by_state_and_group(&pairs, Some("prod"));
        assert_eq!(prod.len(), 1);
        assert!(prod.contains_key("tcp@a:1"));
    }

    #[test]
    fn test_query_value_parsing() {
        assert_eq!(query_value("a=1&b=2", "b").as_deref(), Some("2"));
        assert_eq!(query_value("a=1&b=2", "c"), None);
        assert_eq!(query_value("", "a"), None);
        assert_eq!(query_value("flag", "flag"), None);
    }
}
