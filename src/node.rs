//! Forward destinations and their health state.
//!
//! A [`Node`] owns one [`PhiFailureDetector`] and an `available` flag guarded
//! by a single mutex. The flag flips to false when the detector trips, when a
//! hard timeout passes, or when the delivery path vetoes the node after an I/O
//! failure. Every transition bumps a shared epoch so the selector knows to
//! rebuild its weight table.

use std::{
    fmt,
    io,
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use log::{info, warn};
use parking_lot::Mutex;

use crate::{
    config::ServerConfig,
    detector::{DetectorConfig, PhiFailureDetector},
    handshake::ClientCredentials,
    protocol::Compression,
};

/// How a detached node returns to rotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    /// After enough heartbeats have been observed since detaching.
    Heartbeats(usize),
    /// After a fixed wait, used when no heartbeats are sent.
    AfterWait(Duration),
}

/// Health rules shared by every node of one output.
#[derive(Clone, Debug)]
pub struct HealthPolicy {
    /// Consult phi and the hard timeout on each tick.
    pub phi_enabled: bool,
    pub hard_timeout: Duration,
    pub recovery: Recovery,
    pub detector: DetectorConfig,
}

/// Per-output settings applied to every node built from configuration.
#[derive(Clone, Debug)]
pub struct NodeDefaults {
    pub compress: Compression,
    pub self_hostname: String,
    /// Shared key from the security section; enables authentication.
    pub shared_key: Option<String>,
    pub expire_dns_cache: Option<Duration>,
    pub policy: Arc<HealthPolicy>,
}

/// Read-only snapshot of a node's state.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeStatus {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub standby: bool,
    pub available: bool,
    pub phi: f64,
    pub sample_size: usize,
}

#[derive(Debug)]
struct Health {
    available: bool,
    detector: PhiFailureDetector,
    detached_at: Option<Instant>,
}

#[derive(Debug)]
struct AddressCache {
    addr: SocketAddr,
    resolved_at: Instant,
    /// Set on detach; the next lookup re-resolves.
    stale: bool,
}

/// One configured forward destination.
#[derive(Debug)]
pub struct Node {
    name: String,
    host: String,
    port: u16,
    weight: u32,
    standby: bool,
    compress: Compression,
    credentials: Option<ClientCredentials>,
    policy: Arc<HealthPolicy>,
    /// Set for nodes expanded from DNS round robin.
    fixed_addr: Option<SocketAddr>,
    expire_dns_cache: Option<Duration>,
    address: Mutex<Option<AddressCache>>,
    health: Mutex<Health>,
    epoch: Arc<AtomicU64>,
}

impl Node {
    /// Build a node from a server entry.
    ///
    /// `fixed_addr` pins the node to one resolved address.
    pub fn new(
        server: &ServerConfig,
        fixed_addr: Option<SocketAddr>,
        defaults: &NodeDefaults,
        epoch: Arc<AtomicU64>,
        now: Instant,
    ) -> Self {
        let name = match (&server.name, fixed_addr) {
            (Some(name), _) => name.clone(),
            (None, Some(addr)) => addr.to_string(),
            (None, None) => format!("{}:{}", server.host, server.port),
        };
        let shared_key = server.shared_key.clone().or_else(|| defaults.shared_key.clone());
        let credentials = shared_key.map(|shared_key| ClientCredentials {
            self_hostname: defaults.self_hostname.clone(),
            shared_key,
            username: server.username.clone(),
            password: server.password.clone(),
        });
        let detector = PhiFailureDetector::new(defaults.policy.detector.clone(), now);
        Self {
            name,
            host: server.host.clone(),
            port: server.port,
            weight: server.weight,
            standby: server.standby,
            compress: server.compress.unwrap_or(defaults.compress),
            credentials,
            policy: Arc::clone(&defaults.policy),
            fixed_addr,
            expire_dns_cache: defaults.expire_dns_cache,
            address: Mutex::new(None),
            health: Mutex::new(Health {
                available: true,
                detector,
                detached_at: None,
            }),
            epoch,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn standby(&self) -> bool {
        self.standby
    }

    pub fn compress(&self) -> Compression {
        self.compress
    }

    /// Handshake credentials, present when a shared key applies to this node.
    pub fn credentials(&self) -> Option<&ClientCredentials> {
        self.credentials.as_ref()
    }

    /// Whether the node may currently be selected.
    pub fn available(&self) -> bool {
        self.available_at(Instant::now())
    }

    /// Like [`available`](Self::available), evaluated at `now`.
    ///
    /// Nodes recovering by wait return to rotation here once the wait expires.
    pub fn available_at(&self, now: Instant) -> bool {
        let mut health = self.health.lock();
        if health.available {
            return true;
        }
        if let (Recovery::AfterWait(wait), Some(since)) =
            (self.policy.recovery, health.detached_at)
        {
            if now.saturating_duration_since(since) >= wait {
                health.available = true;
                health.detached_at = None;
                health.detector.clear(now);
                drop(health);
                self.bump_epoch();
                info!(
                    "recovered forwarding server '{}' host={} port={} after {wait:?}",
                    self.name, self.host, self.port
                );
                return true;
            }
        }
        false
    }

    /// Snapshot of the node's health for introspection.
    pub fn status(&self) -> NodeStatus {
        let now = Instant::now();
        let available = self.available_at(now);
        let health = self.health.lock();
        NodeStatus {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            weight: self.weight,
            standby: self.standby,
            available,
            phi: health.detector.phi(now),
            sample_size: health.detector.sample_size(),
        }
    }

    /// Current phi value.
    pub fn phi(&self, now: Instant) -> f64 {
        self.health.lock().detector.phi(now)
    }

    /// Re-evaluate silence. Returns true when this call detached the node.
    pub fn tick(&self, now: Instant) -> bool {
        if !self.policy.phi_enabled {
            return false;
        }
        let mut health = self.health.lock();
        let silence = health.detector.silence(now);
        if !health.available {
            if silence > self.policy.hard_timeout {
                health.detector.clear(now);
            }
            return false;
        }
        let phi = health.detector.phi(now);
        let reason = if silence > self.policy.hard_timeout {
            format!("hard_timeout={:?}", self.policy.hard_timeout)
        } else if phi >= health.detector.threshold() {
            format!("phi={phi:.3} phi_threshold={}", health.detector.threshold())
        } else {
            return false;
        };
        Self::detach(&mut health, now);
        drop(health);
        self.expire_address();
        self.bump_epoch();
        warn!(
            "detached forwarding server '{}' host={} port={} {reason}",
            self.name, self.host, self.port
        );
        true
    }

    /// Record a heartbeat. Returns true when this call recovered the node.
    pub fn heartbeat(&self, now: Instant) -> bool {
        let mut health = self.health.lock();
        health.detector.record(now);
        if health.available {
            return false;
        }
        let Recovery::Heartbeats(needed) = self.policy.recovery else {
            return false;
        };
        if health.detector.sample_size() < needed {
            return false;
        }
        health.available = true;
        health.detached_at = None;
        drop(health);
        self.bump_epoch();
        warn!(
            "recovered forwarding server '{}' host={} port={}",
            self.name, self.host, self.port
        );
        true
    }

    /// Veto the node after a delivery failure.
    pub fn disable(&self, reason: &str) {
        let now = Instant::now();
        let mut health = self.health.lock();
        let was_available = health.available;
        Self::detach(&mut health, now);
        drop(health);
        self.expire_address();
        if was_available {
            self.bump_epoch();
            warn!(
                "disabled forwarding server '{}' host={} port={}: {reason}",
                self.name, self.host, self.port
            );
        }
    }

    /// Note a successful delivery; without heartbeats this is the only
    /// positive liveness signal.
    pub fn record_success(&self, now: Instant) {
        if let Recovery::AfterWait(_) = self.policy.recovery {
            let mut health = self.health.lock();
            health.detector.record(now);
        }
    }

    fn detach(health: &mut Health, now: Instant) {
        health.available = false;
        health.detached_at = Some(now);
        health.detector.clear(now);
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Resolve the node's address, honouring the DNS cache expiry.
    ///
    /// `expire_dns_cache` of `None` caches forever; zero never caches.
    pub fn socket_addr(&self, now: Instant) -> io::Result<SocketAddr> {
        if let Some(addr) = self.fixed_addr {
            return Ok(addr);
        }
        let mut cache = self.address.lock();
        if let Some(entry) = cache.as_ref().filter(|entry| !entry.stale) {
            let fresh = match self.expire_dns_cache {
                None => true,
                Some(ttl) => now.saturating_duration_since(entry.resolved_at) < ttl,
            };
            if fresh {
                return Ok(entry.addr);
            }
        }
        let addr = resolve(&self.host, self.port)?;
        *cache = Some(AddressCache {
            addr,
            resolved_at: now,
            stale: false,
        });
        Ok(addr)
    }

    /// Most recently resolved address without triggering a lookup.
    ///
    /// Survives a detach, so replies to probes sent before the detach still
    /// match this node.
    pub fn cached_addr(&self) -> Option<SocketAddr> {
        self.fixed_addr
            .or_else(|| self.address.lock().as_ref().map(|entry| entry.addr))
    }

    #[cfg(test)]
    fn resolved_at(&self) -> Option<Instant> {
        self.address.lock().as_ref().map(|entry| entry.resolved_at)
    }

    fn expire_address(&self) {
        if let Some(entry) = self.address.lock().as_mut() {
            entry.stale = true;
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.host, self.port)
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{host}:{port} did not resolve to any address"),
        )
    })
}

/// Every address `host` resolves to, deduplicated, in resolver order.
pub fn resolve_all(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let mut addrs: Vec<SocketAddr> = Vec::new();
    for addr in (host, port).to_socket_addrs()? {
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    const INTERVAL: Duration = Duration::from_secs(1);

    fn policy(phi_enabled: bool, recovery: Recovery) -> Arc<HealthPolicy> {
        Arc::new(HealthPolicy {
            phi_enabled,
            hard_timeout: Duration::from_secs(60),
            recovery,
            detector: DetectorConfig::default().with_first_heartbeat_estimate(INTERVAL),
        })
    }

    fn node_with(policy: Arc<HealthPolicy>, now: Instant) -> Node {
        caching_node(policy, None, now)
    }

    fn caching_node(
        policy: Arc<HealthPolicy>,
        expire_dns_cache: Option<Duration>,
        now: Instant,
    ) -> Node {
        let server = ServerConfig::new("127.0.0.1");
        let defaults = NodeDefaults {
            compress: Compression::Text,
            self_hostname: "localhost".into(),
            shared_key: None,
            expire_dns_cache,
            policy,
        };
        Node::new(&server, None, &defaults, Arc::new(AtomicU64::new(0)), now)
    }

    #[fixture]
    fn start() -> Instant {
        Instant::now()
    }

    #[rstest]
    fn display_name_defaults_to_host_port(start: Instant) {
        let node = node_with(policy(true, Recovery::Heartbeats(10)), start);
        assert_eq!(node.name(), "127.0.0.1:24224");
        assert_eq!(node.weight(), 60);
        assert!(node.credentials().is_none());
    }

    #[rstest]
    fn disabled_detector_never_detaches(start: Instant) {
        let node = node_with(policy(false, Recovery::Heartbeats(10)), start);
        assert!(!node.tick(start + Duration::from_secs(3600)));
        assert!(node.available_at(start + Duration::from_secs(3600)));
    }

    #[rstest]
    fn silence_detaches_and_heartbeats_recover(start: Instant) {
        let node = node_with(policy(true, Recovery::Heartbeats(3)), start);
        assert!(!node.tick(start + INTERVAL));
        assert!(node.tick(start + Duration::from_secs(20)));
        assert!(!node.available_at(start + Duration::from_secs(20)));
        assert_eq!(node.status().sample_size, 0);

        let mut now = start + Duration::from_secs(20);
        let mut recovered = false;
        for _ in 0..3 {
            now += INTERVAL;
            recovered = node.heartbeat(now);
        }
        assert!(recovered);
        assert!(node.available_at(now));
    }

    #[rstest]
    fn hard_timeout_detaches_regardless_of_phi(start: Instant) {
        let policy = Arc::new(HealthPolicy {
            phi_enabled: true,
            hard_timeout: Duration::from_secs(2),
            recovery: Recovery::Heartbeats(1),
            detector: DetectorConfig::default().with_threshold(f64::INFINITY),
        });
        let node = node_with(policy, start);
        assert!(node.tick(start + Duration::from_secs(3)));
    }

    #[rstest]
    fn veto_recovers_after_wait(start: Instant) {
        let node = node_with(policy(false, Recovery::AfterWait(Duration::from_millis(50))), start);
        node.disable("connection refused");
        assert!(!node.available());
        std::thread::sleep(Duration::from_millis(80));
        assert!(node.available());
    }

    #[rstest]
    fn transitions_bump_the_epoch(start: Instant) {
        let epoch = Arc::new(AtomicU64::new(0));
        let server = ServerConfig::new("127.0.0.1");
        let defaults = NodeDefaults {
            compress: Compression::Gzip,
            self_hostname: "localhost".into(),
            shared_key: Some("secret".into()),
            expire_dns_cache: None,
            policy: policy(true, Recovery::Heartbeats(1)),
        };
        let node = Node::new(&server, None, &defaults, Arc::clone(&epoch), start);
        assert_eq!(node.compress(), Compression::Gzip);
        assert_eq!(
            node.credentials().map(|c| c.shared_key.as_str()),
            Some("secret")
        );
        node.disable("write failed");
        node.disable("write failed again");
        assert_eq!(epoch.load(Ordering::Acquire), 1);
        node.heartbeat(start + INTERVAL);
        assert_eq!(epoch.load(Ordering::Acquire), 2);
    }

    #[rstest]
    fn address_is_cached_until_detached(start: Instant) {
        let node = node_with(policy(true, Recovery::Heartbeats(1)), start);
        assert!(node.cached_addr().is_none());
        let addr = node.socket_addr(start).expect("resolve loopback");
        assert_eq!(addr.port(), 24224);
        assert_eq!(node.cached_addr(), Some(addr));

        let later = start + Duration::from_secs(3600);
        node.socket_addr(later).expect("cached");
        assert_eq!(node.resolved_at(), Some(start));

        node.disable("gone");
        assert_eq!(node.cached_addr(), Some(addr));
        node.socket_addr(later).expect("re-resolve");
        assert_eq!(node.resolved_at(), Some(later));
    }

    #[rstest]
    fn cached_address_expires_after_its_ttl(start: Instant) {
        let ttl = Duration::from_secs(10);
        let node = caching_node(policy(true, Recovery::Heartbeats(1)), Some(ttl), start);
        node.socket_addr(start).expect("resolve loopback");
        assert_eq!(node.resolved_at(), Some(start));

        node.socket_addr(start + ttl / 2).expect("cached");
        assert_eq!(node.resolved_at(), Some(start));

        node.socket_addr(start + ttl).expect("re-resolve");
        assert_eq!(node.resolved_at(), Some(start + ttl));
    }

    #[rstest]
    fn zero_ttl_never_serves_from_cache(start: Instant) {
        let node = caching_node(
            policy(true, Recovery::Heartbeats(1)),
            Some(Duration::ZERO),
            start,
        );
        node.socket_addr(start).expect("resolve loopback");
        let again = start + Duration::from_millis(1);
        node.socket_addr(again).expect("re-resolve");
        assert_eq!(node.resolved_at(), Some(again));
        node.socket_addr(again).expect("re-resolve");
        assert_eq!(node.resolved_at(), Some(again));
    }
}
