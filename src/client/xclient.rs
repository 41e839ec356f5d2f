//! Clustered client: discovery-driven server set, pluggable selection,
//! per-address circuit breakers and failure-mode policies on top of the
//! single-connection [`Client`].

use std::collections::HashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::breaker::ConsecCircuitBreaker;
use super::call::CallFuture;
use super::client::Client;
use super::discovery::{KVPair, ServiceDiscovery, filter_by_state_and_group};
use super::error::{ClientError, Result};
use super::options::ClientOptions;
use super::selector::{SelectContext, SelectMode, Selector, new_selector};

/// What to do when a call against one server fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    /// Reselect and retry on a different pick, up to the retry budget.
    Failover,
    /// One attempt; the first error is the caller's problem.
    Failfast,
    /// Retry the same server, up to the retry budget.
    Failtry,
    /// Race the primary against a delayed backup request; first response
    /// wins and the loser is dropped.
    Failbackup,
}

struct Shared {
    service_path: String,
    opt: ClientOptions,
    servers: Mutex<HashMap<String, String>>,
    selector: Mutex<Box<dyn Selector>>,
    cached: tokio::sync::Mutex<HashMap<String, Arc<Client>>>,
    breakers: Mutex<HashMap<String, Arc<ConsecCircuitBreaker>>>,
}

/// A service-scoped client over a dynamic set of servers.
///
/// Connections are dialed lazily per address and cached; a background
/// task follows discovery snapshots, evicting clients whose address has
/// vanished while leaving surviving connections untouched.
pub struct XClient {
    shared: Arc<Shared>,
    discovery: Arc<dyn ServiceDiscovery>,
    fail_mode: FailMode,
    select_mode: SelectMode,
    shutdown: AtomicBool,
    watch: JoinHandle<()>,
}

impl XClient {
    /// Build a clustered client for `service_path`.
    ///
    /// Must be called from within a tokio runtime: the discovery watch
    /// task is spawned here.
    #[must_use]
    pub fn new(
        service_path: impl Into<String>,
        fail_mode: FailMode,
        select_mode: SelectMode,
        discovery: Arc<dyn ServiceDiscovery>,
        opt: ClientOptions,
    ) -> Self {
        let service_path = service_path.into();
        let pairs = discovery.get_services();
        let servers = filter_by_state_and_group(&pairs, opt.group.as_deref());
        let selector = new_selector(select_mode, &servers);

        let shared = Arc::new(Shared {
            service_path,
            opt,
            servers: Mutex::new(servers),
            selector: Mutex::new(selector),
            cached: tokio::sync::Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
        });

        let watch = tokio::spawn(watch_loop(discovery.watch(), Arc::clone(&shared)));

        Self {
            shared,
            discovery,
            fail_mode,
            select_mode,
            shutdown: AtomicBool::new(false),
            watch,
        }
    }

    /// Call `service_method` under the configured [`FailMode`].
    ///
    /// Service-level errors are terminal regardless of mode: the server
    /// answered, retrying elsewhere would re-run application logic.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.check_shutdown()?;
        let args_repr = self.args_repr(args);

        match self.fail_mode {
            FailMode::Failfast => {
                let addr = self.select(service_method, args_repr.as_deref())?;
                self.try_call(&addr, service_method, args).await
            }
            FailMode::Failover => {
                let mut last_err = ClientError::NoAvailableService;
                for _ in 0..self.shared.opt.retries.max(1) {
                    let addr = self.select(service_method, args_repr.as_deref())?;
                    match self.try_call(&addr, service_method, args).await {
                        Ok(reply) => return Ok(reply),
                        Err(err) if err.is_service_error() => return Err(err),
                        Err(err) => {
                            trace!(%addr, %err, "failover attempt failed");
                            last_err = err;
                        }
                    }
                }
                Err(last_err)
            }
            FailMode::Failtry => {
                let addr = self.select(service_method, args_repr.as_deref())?;
                let mut last_err = ClientError::NoAvailableService;
                for _ in 0..self.shared.opt.retries.max(1) {
                    match self.try_call(&addr, service_method, args).await {
                        Ok(reply) => return Ok(reply),
                        Err(err) if err.is_service_error() => return Err(err),
                        Err(err) => {
                            trace!(%addr, %err, "failtry attempt failed");
                            last_err = err;
                        }
                    }
                }
                Err(last_err)
            }
            FailMode::Failbackup => {
                self.call_backup(service_method, args, args_repr.as_deref())
                    .await
            }
        }
    }

    /// Select a server and issue asynchronously; no failure policy is
    /// applied to the returned in-flight call.
    pub async fn go<A, R>(&self, service_method: &str, args: &A) -> Result<CallFuture<R>>
    where
        A: Serialize + ?Sized,
    {
        self.check_shutdown()?;
        let args_repr = self.args_repr(args);
        let addr = self.select(service_method, args_repr.as_deref())?;
        self.issue_at(&addr, service_method, args).await
    }

    /// Send to every live server and succeed only if all of them do.
    /// The first server's reply is returned.
    pub async fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.check_shutdown()?;
        let mut futures = Vec::new();
        for addr in self.server_addrs()? {
            futures.push(self.issue_at::<A, R>(&addr, service_method, args).await?);
        }

        let mut first = None;
        for fut in futures {
            let reply = fut.recv().await?;
            first.get_or_insert(reply);
        }
        match first {
            Some(reply) => Ok(reply),
            None => Err(ClientError::NoAvailableService),
        }
    }

    /// Send to every live server and return the first success; fail only
    /// when every server fails.
    pub async fn fork<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.check_shutdown()?;
        let addrs = self.server_addrs()?;
        let (tx, mut rx) = mpsc::channel(addrs.len().max(1));
        for addr in addrs {
            let fut = self.issue_at::<A, R>(&addr, service_method, args).await?;
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(fut.recv().await).await;
            });
        }
        drop(tx);

        let mut last_err = ClientError::NoAvailableService;
        while let Some(result) = rx.recv().await {
            match result {
                Ok(reply) => return Ok(reply),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    /// Mark shut down and close every cached connection. Later calls
    /// return [`ClientError::XClientShutdown`].
    pub async fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.watch.abort();
        self.discovery.close();
        let mut cached = self.shared.cached.lock().await;
        for (addr, client) in cached.drain() {
            if let Err(err) = client.close().await {
                trace!(%addr, %err, "close on shutdown");
            }
        }
        debug!("xclient closed");
    }

    /// Addresses currently eligible for selection.
    #[must_use]
    pub fn servers(&self) -> Vec<String> {
        let mut addrs: Vec<String> = super::lock(&self.shared.servers).keys().cloned().collect();
        addrs.sort_unstable();
        addrs
    }

    fn check_shutdown(&self) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(ClientError::XClientShutdown);
        }
        Ok(())
    }

    /// Stringify args for hash-based selection. Only the consistent-hash
    /// strategy looks at them, so other modes skip the serialization.
    fn args_repr<A>(&self, args: &A) -> Option<String>
    where
        A: Serialize + ?Sized,
    {
        if self.select_mode == SelectMode::ConsistentHash {
            serde_json::to_string(args).ok()
        } else {
            None
        }
    }

    fn select(&self, service_method: &str, args_repr: Option<&str>) -> Result<String> {
        let ctx = SelectContext {
            service_path: &self.shared.service_path,
            service_method,
            args_repr,
        };
        super::lock(&self.shared.selector).select(&ctx)
    }

    fn server_addrs(&self) -> Result<Vec<String>> {
        let addrs = self.servers();
        if addrs.is_empty() {
            return Err(ClientError::NoAvailableService);
        }
        Ok(addrs)
    }

    fn breaker_for(&self, addr: &str) -> Arc<ConsecCircuitBreaker> {
        let mut breakers = super::lock(&self.shared.breakers);
        Arc::clone(breakers.entry(addr.to_owned()).or_insert_with(|| {
            Arc::new(ConsecCircuitBreaker::new(
                self.shared.opt.breaker_threshold,
                self.shared.opt.breaker_window,
            ))
        }))
    }

    /// One attempt against one address, with breaker accounting.
    async fn try_call<A, R>(&self, addr: &str, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let breaker = self.breaker_for(addr);
        if !breaker.ready() {
            return Err(ClientError::BreakerOpen);
        }
        let client = self.get_cached_client(addr, &breaker).await?;
        match client
            .call(&self.shared.service_path, service_method, args, HashMap::new())
            .await
        {
            Ok(reply) => {
                breaker.success();
                Ok(reply)
            }
            Err(err) => {
                if !err.is_service_error() {
                    breaker.fail();
                    self.evict_client(addr).await;
                }
                Err(err)
            }
        }
    }

    async fn issue_at<A, R>(&self, addr: &str, service_method: &str, args: &A) -> Result<CallFuture<R>>
    where
        A: Serialize + ?Sized,
    {
        let breaker = self.breaker_for(addr);
        if !breaker.ready() {
            return Err(ClientError::BreakerOpen);
        }
        let client = self.get_cached_client(addr, &breaker).await?;
        client
            .go(&self.shared.service_path, service_method, args, HashMap::new())
            .await
    }

    /// Race a primary call against a backup issued after `backup_latency`.
    /// Whichever response loses is dropped, which removes its pending
    /// entry through the call handle's drop hook.
    async fn call_backup<A, R>(
        &self,
        service_method: &str,
        args: &A,
        args_repr: Option<&str>,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let addr = self.select(service_method, args_repr)?;
        let primary = self.issue_at::<A, R>(&addr, service_method, args).await?;
        let mut primary_recv = pin!(primary.recv());

        tokio::select! {
            result = &mut primary_recv => result,
            () = tokio::time::sleep(self.shared.opt.backup_latency) => {
                let backup_addr = self
                    .select(service_method, args_repr)
                    .unwrap_or_else(|_| addr.clone());
                match self.issue_at::<A, R>(&backup_addr, service_method, args).await {
                    Ok(backup) => {
                        let backup_recv = pin!(backup.recv());
                        tokio::select! {
                            result = &mut primary_recv => result,
                            result = backup_recv => result,
                        }
                    }
                    Err(err) => {
                        trace!(%backup_addr, %err, "backup issue failed");
                        primary_recv.await
                    }
                }
            }
        }
    }

    /// Fetch or dial the connection for `addr`. Dial failures feed the
    /// address's breaker.
    async fn get_cached_client(
        &self,
        addr: &str,
        breaker: &ConsecCircuitBreaker,
    ) -> Result<Arc<Client>> {
        {
            let cached = self.shared.cached.lock().await;
            if let Some(client) = cached.get(addr) {
                if !client.is_shutdown() {
                    return Ok(Arc::clone(client));
                }
            }
        }

        match Client::connect(dial_target(addr), self.shared.opt.clone()).await {
            Ok(client) => {
                let client = Arc::new(client);
                let mut cached = self.shared.cached.lock().await;
                // A snapshot may have dropped this address while the dial
                // was in flight. Snapshots update `servers` before they
                // evict from the cache, so checking membership under the
                // cache lock catches every ordering.
                if !super::lock(&self.shared.servers).contains_key(addr) {
                    drop(cached);
                    if let Err(err) = client.close().await {
                        trace!(%addr, %err, "close after vanish during dial");
                    }
                    return Err(ClientError::NoAvailableService);
                }
                // A concurrent dial may have won; keep whichever live
                // connection is already cached.
                let entry = cached
                    .entry(addr.to_owned())
                    .or_insert_with(|| Arc::clone(&client));
                if entry.is_shutdown() {
                    *entry = Arc::clone(&client);
                }
                Ok(Arc::clone(entry))
            }
            Err(err) => {
                warn!(%addr, %err, "dial failed");
                breaker.fail();
                Err(err)
            }
        }
    }

    async fn evict_client(&self, addr: &str) {
        let removed = self.shared.cached.lock().await.remove(addr);
        if let Some(client) = removed {
            if let Err(err) = client.close().await {
                trace!(%addr, %err, "close on evict");
            }
        }
    }
}

impl Drop for XClient {
    fn drop(&mut self) {
        self.watch.abort();
    }
}

/// Strip the `network@` prefix from a server locator. Only TCP servers
/// are dialable here, and bare `host:port` keys default to TCP.
fn dial_target(key: &str) -> &str {
    key.split_once('@').map_or(key, |(_, addr)| addr)
}

async fn watch_loop(mut rx: mpsc::Receiver<Vec<KVPair>>, shared: Arc<Shared>) {
    while let Some(pairs) = rx.recv().await {
        apply_snapshot(&shared, &pairs).await;
    }
    trace!("discovery watch ended");
}

/// Apply one discovery snapshot: replace the candidate map, refresh the
/// selector and drop connections to servers that vanished. Surviving
/// addresses keep their existing client instance.
async fn apply_snapshot(shared: &Shared, pairs: &[KVPair]) {
    let servers = filter_by_state_and_group(pairs, shared.opt.group.as_deref());
    debug!(servers = servers.len(), "discovery snapshot");

    super::lock(&shared.selector).update_server(&servers);
    *super::lock(&shared.servers) = servers.clone();

    let vanished: Vec<(String, Arc<Client>)> = {
        let mut cached = shared.cached.lock().await;
        let gone: Vec<String> = cached
            .keys()
            .filter(|addr| !servers.contains_key(*addr))
            .cloned()
            .collect();
        gone.into_iter()
            .filter_map(|addr| cached.remove(&addr).map(|c| (addr, c)))
            .collect()
    };
    for (addr, client) in vanished {
        debug!(%addr, "server vanished, closing client");
        if let Err(err) = client.close().await {
            trace!(%addr, %err, "close on vanish");
        }
    }
}
