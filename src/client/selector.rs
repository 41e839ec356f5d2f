//! Server selection strategies.
//!
//! Every strategy is polymorphic over one capability: map a candidate
//! snapshot plus call context to exactly one address. An empty candidate
//! set always fails fast with [`ClientError::NoAvailableService`].

use std::collections::HashMap;
use std::hash::Hasher;

use fnv::FnvHasher;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::discovery::query_value;
use super::error::{ClientError, Result};

/// Load-balancing strategy for clustered calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SelectMode {
    /// Uniform random pick.
    Random,
    /// Cycle through candidates in address order.
    RoundRobin,
    /// Smooth weighted round robin over `weight=N` metadata.
    WeightedRoundRobin,
    /// Jump consistent hash over the call identity.
    ConsistentHash,
    /// Pick the geographically closest candidate to this position.
    Closest {
        /// Caller latitude in degrees.
        latitude: f64,
        /// Caller longitude in degrees.
        longitude: f64,
    },
}

/// Call identity handed to a selector.
#[derive(Debug, Clone, Copy)]
pub struct SelectContext<'a> {
    /// Logical service address.
    pub service_path: &'a str,
    /// Method within the service.
    pub service_method: &'a str,
    /// Stringified args, filled only when the active mode hashes on them.
    pub args_repr: Option<&'a str>,
}

/// Maps `(candidate set, call context)` to one server address.
pub trait Selector: Send {
    /// Pick one candidate address.
    fn select(&mut self, ctx: &SelectContext<'_>) -> Result<String>;

    /// Replace the candidate snapshot (`address -> metadata`).
    fn update_server(&mut self, servers: &HashMap<String, String>);
}

/// Build the selector for a [`SelectMode`].
#[must_use]
pub fn new_selector(mode: SelectMode, servers: &HashMap<String, String>) -> Box<dyn Selector> {
    match mode {
        SelectMode::Random => Box::new(RandomSelector::new(servers)),
        SelectMode::RoundRobin => Box::new(RoundRobinSelector::new(servers)),
        SelectMode::WeightedRoundRobin => Box::new(WeightedRoundRobinSelector::new(servers)),
        SelectMode::ConsistentHash => Box::new(ConsistentHashSelector::new(servers)),
        SelectMode::Closest {
            latitude,
            longitude,
        } => Box::new(GeoSelector::new(servers, latitude, longitude)),
    }
}

fn sorted_addrs(servers: &HashMap<String, String>) -> Vec<String> {
    let mut addrs: Vec<String> = servers.keys().cloned().collect();
    addrs.sort_unstable();
    addrs
}

/// Uniform random selection, reseeded from OS entropy per construction.
pub struct RandomSelector {
    servers: Vec<String>,
    rng: StdRng,
}

impl RandomSelector {
    /// Build from a candidate snapshot.
    #[must_use]
    pub fn new(servers: &HashMap<String, String>) -> Self {
        Self {
            servers: sorted_addrs(servers),
            rng: StdRng::from_os_rng(),
        }
    }
}

impl Selector for RandomSelector {
    fn select(&mut self, _ctx: &SelectContext<'_>) -> Result<String> {
        if self.servers.is_empty() {
            return Err(ClientError::NoAvailableService);
        }
        let i = self.rng.random_range(0..self.servers.len());
        Ok(self.servers[i].clone())
    }

    fn update_server(&mut self, servers: &HashMap<String, String>) {
        self.servers = sorted_addrs(servers);
    }
}

/// `(i + 1) mod n` selection. Best-effort ordering is fine: callers
/// serialize access through the XClient's selector lock anyway.
pub struct RoundRobinSelector {
    servers: Vec<String>,
    i: usize,
}

impl RoundRobinSelector {
    /// Build from a candidate snapshot.
    #[must_use]
    pub fn new(servers: &HashMap<String, String>) -> Self {
        Self {
            servers: sorted_addrs(servers),
            i: 0,
        }
    }
}

impl Selector for RoundRobinSelector {
    fn select(&mut self, _ctx: &SelectContext<'_>) -> Result<String> {
        if self.servers.is_empty() {
            return Err(ClientError::NoAvailableService);
        }
        let i = self.i % self.servers.len();
        self.i = i + 1;
        Ok(self.servers[i].clone())
    }

    fn update_server(&mut self, servers: &HashMap<String, String>) {
        self.servers = sorted_addrs(servers);
    }
}

/// Per-candidate weighting state for the smooth algorithm.
#[derive(Debug, Clone)]
pub struct Weighted {
    /// Candidate address.
    pub server: String,
    /// Configured weight (`weight=N` metadata, default 1).
    pub weight: i64,
    /// Accumulator the winner is picked from each round.
    pub current_weight: i64,
    /// Decays on failure, recovers by one per round up to `weight`.
    pub effective_weight: i64,
}

impl Weighted {
    fn new(server: String, weight: i64) -> Self {
        Self {
            server,
            weight,
            current_weight: 0,
            effective_weight: weight,
        }
    }

    /// Decay the effective weight toward zero after a failure.
    pub fn fail(&mut self) {
        self.effective_weight = (self.effective_weight - self.weight).max(0);
    }
}

/// Nginx-style smooth weighted round robin: proportional distribution
/// without bursty batches of the same server.
pub struct WeightedRoundRobinSelector {
    servers: Vec<Weighted>,
}

impl WeightedRoundRobinSelector {
    /// Build from a candidate snapshot, reading `weight=N` metadata.
    #[must_use]
    pub fn new(servers: &HashMap<String, String>) -> Self {
        Self {
            servers: create_weighted(servers),
        }
    }

    /// Mark one candidate as failed, decaying its effective weight.
    pub fn mark_failed(&mut self, addr: &str) {
        if let Some(w) = self.servers.iter_mut().find(|w| w.server == addr) {
            w.fail();
        }
    }

    fn next(&mut self) -> Option<usize> {
        if self.servers.is_empty() {
            return None;
        }
        let mut total = 0;
        let mut best = 0;
        let mut best_weight = i64::MIN;
        for i in 0..self.servers.len() {
            let w = &mut self.servers[i];
            w.current_weight += w.effective_weight;
            total += w.effective_weight;
            if w.effective_weight < w.weight {
                w.effective_weight += 1;
            }
            if w.current_weight > best_weight {
                best_weight = w.current_weight;
                best = i;
            }
        }
        self.servers[best].current_weight -= total;
        Some(best)
    }
}

impl Selector for WeightedRoundRobinSelector {
    fn select(&mut self, _ctx: &SelectContext<'_>) -> Result<String> {
        match self.next() {
            Some(i) => Ok(self.servers[i].server.clone()),
            None => Err(ClientError::NoAvailableService),
        }
    }

    fn update_server(&mut self, servers: &HashMap<String, String>) {
        self.servers = create_weighted(servers);
    }
}

fn create_weighted(servers: &HashMap<String, String>) -> Vec<Weighted> {
    let mut weighted: Vec<Weighted> = servers
        .iter()
        .map(|(addr, meta)| {
            let weight = query_value(meta, "weight")
                .and_then(|w| w.parse::<i64>().ok())
                .filter(|w| *w > 0)
                .unwrap_or(1);
            Weighted::new(addr.clone(), weight)
        })
        .collect();
    weighted.sort_unstable_by(|a, b| a.server.cmp(&b.server));
    weighted
}

/// Jump consistent hash over FNV-1a of the call identity: the same key
/// against the same candidate count always lands on the same server, and
/// the mapping moves minimally when the count changes by one.
pub struct ConsistentHashSelector {
    servers: Vec<String>,
}

impl ConsistentHashSelector {
    /// Build from a candidate snapshot.
    #[must_use]
    pub fn new(servers: &HashMap<String, String>) -> Self {
        Self {
            servers: sorted_addrs(servers),
        }
    }
}

impl Selector for ConsistentHashSelector {
    fn select(&mut self, ctx: &SelectContext<'_>) -> Result<String> {
        if self.servers.is_empty() {
            return Err(ClientError::NoAvailableService);
        }
        let key = hash_call(ctx.service_path, ctx.service_method, ctx.args_repr);
        let i = jump_consistent_hash(key, self.servers.len());
        Ok(self.servers[i].clone())
    }

    fn update_server(&mut self, servers: &HashMap<String, String>) {
        self.servers = sorted_addrs(servers);
    }
}

/// FNV-1a of the `/path/method/args` call identity.
fn hash_call(service_path: &str, service_method: &str, args_repr: Option<&str>) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(b"/");
    hasher.write(service_path.as_bytes());
    hasher.write(b"/");
    hasher.write(service_method.as_bytes());
    hasher.write(b"/");
    if let Some(args) = args_repr {
        hasher.write(args.as_bytes());
    }
    hasher.finish()
}

/// Lamping-Veach jump consistent hash into `[0, buckets)`.
fn jump_consistent_hash(mut key: u64, buckets: usize) -> usize {
    let buckets = buckets.max(1) as i64;
    let mut b: i64 = 0;
    let mut j: i64 = 0;
    while j < buckets {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1i64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b as usize
}

struct GeoServer {
    server: String,
    latitude: f64,
    longitude: f64,
}

/// Closest-server selection by haversine distance to the caller's
/// configured position; ties are broken uniformly at random.
pub struct GeoSelector {
    servers: Vec<GeoServer>,
    latitude: f64,
    longitude: f64,
    rng: StdRng,
}

impl GeoSelector {
    /// Build from a candidate snapshot; candidates without
    /// `latitude`/`longitude` metadata are skipped.
    #[must_use]
    pub fn new(servers: &HashMap<String, String>, latitude: f64, longitude: f64) -> Self {
        Self {
            servers: create_geo_servers(servers),
            latitude,
            longitude,
            rng: StdRng::from_os_rng(),
        }
    }
}

impl Selector for GeoSelector {
    fn select(&mut self, _ctx: &SelectContext<'_>) -> Result<String> {
        if self.servers.is_empty() {
            return Err(ClientError::NoAvailableService);
        }

        let mut closest: Vec<&GeoServer> = Vec::new();
        let mut min_distance = f64::MAX;
        for gs in &self.servers {
            let d = haversine(self.latitude, self.longitude, gs.latitude, gs.longitude);
            if d < min_distance {
                min_distance = d;
                closest.clear();
                closest.push(gs);
            } else if d == min_distance {
                closest.push(gs);
            }
        }

        let i = if closest.len() == 1 {
            0
        } else {
            self.rng.random_range(0..closest.len())
        };
        Ok(closest[i].server.clone())
    }

    fn update_server(&mut self, servers: &HashMap<String, String>) {
        self.servers = create_geo_servers(servers);
    }
}

fn create_geo_servers(servers: &HashMap<String, String>) -> Vec<GeoServer> {
    let mut geo: Vec<GeoServer> = servers
        .iter()
        .filter_map(|(addr, meta)| {
            let latitude = query_value(meta, "latitude")?.parse::<f64>().ok()?;
            let longitude = query_value(meta, "longitude")?.parse::<f64>().ok()?;
            Some(GeoServer {
                server: addr.clone(),
                latitude,
                longitude,
            })
        })
        .collect();
    geo.sort_unstable_by(|a, b| a.server.cmp(&b.server));
    geo
}

/// Great-circle distance in kilometers.
fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6_371.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>() -> SelectContext<'a> {
        SelectContext {
            service_path: "Arith",
            service_method: "Mul",
            args_repr: None,
        }
    }

    fn servers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_all_selectors_fail_on_empty_set() {
        let empty = HashMap::new();
        for mode in [
            SelectMode::Random,
            SelectMode::RoundRobin,
            SelectMode::WeightedRoundRobin,
            SelectMode::ConsistentHash,
            SelectMode::Closest {
                latitude: 0.0,
                longitude: 0.0,
            },
        ] {
            let mut s = new_selector(mode, &empty);
            assert!(
                matches!(s.select(&ctx()), Err(ClientError::NoAvailableService)),
                "{mode:?} must fail fast on an empty candidate set"
            );
        }
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let mut s = RoundRobinSelector::new(&servers(&[("b", ""), ("a", ""), ("c", "")]));
        let picks: Vec<String> = (0..6).map(|_| s.select(&ctx()).unwrap()).collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_smooth_weighted_round_robin_distribution() {
        let mut s = WeightedRoundRobinSelector::new(&servers(&[
            ("server-a", "weight=4"),
            ("server-b", "weight=2"),
            ("server-c", "weight=1"),
        ]));

        let picks: Vec<String> = (0..7).map(|_| s.select(&ctx()).unwrap()).collect();

        // Smooth interleaving, not bursts.
        assert_eq!(
            picks,
            [
                "server-a", "server-b", "server-a", "server-c", "server-a", "server-b", "server-a"
            ]
        );

        let count = |addr: &str| picks.iter().filter(|p| *p == addr).count();
        assert_eq!(count("server-a"), 4);
        assert_eq!(count("server-b"), 2);
        assert_eq!(count("server-c"), 1);
    }

    #[test]
    fn test_weighted_failure_decays_effective_weight() {
        let mut s = WeightedRoundRobinSelector::new(&servers(&[
            ("server-a", "weight=4"),
            ("server-b", "weight=2"),
        ]));
        s.mark_failed("server-a");
        assert_eq!(s.servers[0].effective_weight, 0);

        // server-a recovers one effective weight per round.
        let first = s.select(&ctx()).unwrap();
        assert_eq!(first, "server-b");
        for _ in 0..8 {
            let _ = s.select(&ctx()).unwrap();
        }
        assert_eq!(s.servers[0].effective_weight, 4);
    }

    #[test]
    fn test_consistent_hash_is_stable() {
        let set = servers(&[("tcp@192.168.1.16:9392", ""), ("tcp@192.168.1.16:9393", "")]);
        let mut s = ConsistentHashSelector::new(&set);

        let first = s.select(&ctx()).unwrap();
        for _ in 0..10_000 {
            assert_eq!(s.select(&ctx()).unwrap(), first);
        }
    }

    #[test]
    fn test_consistent_hash_spreads_across_keys() {
        let set = servers(&[("a", ""), ("b", ""), ("c", ""), ("d", "")]);
        let mut s = ConsistentHashSelector::new(&set);

        let mut seen = std::collections::HashSet::new();
        for i in 0..64 {
            let args = format!("key-{i}");
            let c = SelectContext {
                service_path: "Arith",
                service_method: "Mul",
                args_repr: Some(&args),
            };
            seen.insert(s.select(&c).unwrap());
        }
        assert!(seen.len() > 1, "all keys mapped to one server");
    }

    #[test]
    fn test_jump_hash_moves_minimally() {
        // Adding one bucket may only move keys into the new bucket.
        for key in [3u64, 999, 0xABCD_EF01, u64::MAX / 7] {
            let before = jump_consistent_hash(key, 7);
            let after = jump_consistent_hash(key, 8);
            assert!(after == before || after == 7);
        }
    }

    #[test]
    fn test_geo_selector_picks_closest() {
        let set = servers(&[
            ("tokyo", "latitude=35.68&longitude=139.69"),
            ("berlin", "latitude=52.52&longitude=13.40"),
            ("no-coords", "weight=3"),
        ]);
        // Caller sits in Paris; Berlin is much closer than Tokyo.
        let mut s = GeoSelector::new(&set, 48.85, 2.35);
        assert_eq!(s.select(&ctx()).unwrap(), "berlin");
    }

    #[test]
    fn test_update_server_replaces_candidates() {
        let mut s = RoundRobinSelector::new(&servers(&[("a", "")]));
        s.update_server(&servers(&[("x", ""), ("y", "")]));
        let picks: Vec<String> = (0..2).map(|_| s.select(&ctx()).unwrap()).collect();
        assert_eq!(picks, ["x", "y"]);
    }
}
