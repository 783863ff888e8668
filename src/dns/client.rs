//! Clients and the tiered resolution pipeline
//!
//! A client answers a query from, in order:
//!
//! 1. its own cache, when the entry is fresh
//! 2. the cache of the first peer in its group holding a fresh entry
//! 3. its upstream resolver
//!
//! Each step short-circuits the rest. Only an upstream failure makes the whole
//! resolution fail, and failures are never cached.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use derive_more::{Display, Error, From};

use crate::dns::cache::{normalize_name, CacheEntry, SynchronizedCacheStore};
use crate::dns::group::GroupId;
use crate::dns::upstream::{UpstreamError, UpstreamResolver};

#[derive(Debug, Display, From, Error)]
pub enum ResolveError {
    Upstream(UpstreamError),
    #[display(fmt = "invalid domain name: {:?}", domain)]
    #[from(ignore)]
    InvalidDomain { domain: String },
    #[display(fmt = "unknown client: {}", client_id)]
    #[from(ignore)]
    UnknownClient { client_id: String },
}

type Result<T> = std::result::Result<T, ResolveError>;

/// Where an answer came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolutionSource {
    Local,
    Peer(String),
    Upstream,
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ResolutionSource::Local => write!(f, "local cache"),
            ResolutionSource::Peer(ref id) => write!(f, "peer {}", id),
            ResolutionSource::Upstream => write!(f, "upstream"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub address: IpAddr,
    pub source: ResolutionSource,
}

/// Lower-cases and fully qualifies `domain`. Names without any label are rejected.
pub fn normalize_domain(domain: &str) -> Result<String> {
    normalize_name(domain).ok_or_else(|| ResolveError::InvalidDomain {
        domain: domain.to_string(),
    })
}

/// Snapshot file name for a client id
pub fn cache_file_name(id: &str) -> String {
    format!("{}_cache.json", id)
}

pub struct Client {
    id: String,
    upstream: SocketAddr,
    cache: SynchronizedCacheStore,
    resolver: Arc<dyn UpstreamResolver + Send + Sync>,

    /// Set once when the client joins a group; peers are found through it
    group: OnceLock<GroupId>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("upstream", &self.upstream)
            .field("group", &self.group.get())
            .finish()
    }
}

impl Client {
    /// Creates a client whose cache lives in memory only
    pub fn new(
        id: &str,
        upstream: SocketAddr,
        resolver: Arc<dyn UpstreamResolver + Send + Sync>,
    ) -> Client {
        Client::with_cache(id, upstream, SynchronizedCacheStore::new(), resolver)
    }

    /// Creates a client and loads its snapshot from `cache_dir`, if one exists
    pub fn with_cache_dir<P: Into<PathBuf>>(
        id: &str,
        upstream: SocketAddr,
        cache_dir: P,
        resolver: Arc<dyn UpstreamResolver + Send + Sync>,
    ) -> Client {
        let path = cache_dir.into().join(cache_file_name(id));
        Client::with_cache(id, upstream, SynchronizedCacheStore::load(path), resolver)
    }

    pub fn with_cache(
        id: &str,
        upstream: SocketAddr,
        cache: SynchronizedCacheStore,
        resolver: Arc<dyn UpstreamResolver + Send + Sync>,
    ) -> Client {
        log::info!("Adding new client {} (upstream {})", id, upstream);

        Client {
            id: id.to_string(),
            upstream,
            cache,
            resolver,
            group: OnceLock::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    pub fn cache(&self) -> &SynchronizedCacheStore {
        &self.cache
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.group.get().copied()
    }

    /// Binds the client to a group. Returns false if it already belongs to one.
    pub(crate) fn join_group(&self, group: GroupId) -> bool {
        self.group.set(group).is_ok()
    }

    /// Resolves `domain` and returns the address only
    pub(crate) fn resolve(&self, domain: &str, peers: &[Arc<Client>]) -> Result<IpAddr> {
        self.resolve_with_source(domain, peers)
            .map(|resolution| resolution.address)
    }

    /// Runs the tiered lookup: local cache, then `peers` in order, then upstream.
    ///
    /// `peers` is the member list of this client's group; the client itself is
    /// skipped if present. No cache lock is held across the peer sweep or the
    /// upstream call, and at most one lock is held at any time.
    pub(crate) fn resolve_with_source(&self, domain: &str, peers: &[Arc<Client>]) -> Result<Resolution> {
        let domain = normalize_domain(domain)?;
        let now = Utc::now();

        if let Some(entry) = self.cache.lookup(&domain).filter(|e| e.is_fresh(now)) {
            log::info!("{}: {} found in local cache", self.id, domain);
            return Ok(Resolution {
                address: entry.address,
                source: ResolutionSource::Local,
            });
        }

        if let Some((peer_id, entry)) = self.sweep_peers(&domain, peers) {
            log::info!("{}: {} found in cache of peer {}", self.id, domain, peer_id);

            // The copy keeps the peer's timestamp, and with it the peer's freshness
            // window. An answer observed later in the meantime is kept instead.
            if !self
                .cache
                .store_if_newer(&domain, entry.address, entry.observed_at)
            {
                log::debug!("{}: kept newer cached answer for {}", self.id, domain);
            }

            return Ok(Resolution {
                address: entry.address,
                source: ResolutionSource::Peer(peer_id),
            });
        }

        log::info!("{}: {} not cached in group, asking upstream", self.id, domain);
        let address = self.resolver.resolve(&domain, self.upstream).map_err(|e| {
            log::warn!(
                "{}: upstream {} could not resolve {}: {}",
                self.id,
                self.upstream,
                domain,
                e
            );
            e
        })?;

        self.cache.store(&domain, address, Utc::now());

        Ok(Resolution {
            address,
            source: ResolutionSource::Upstream,
        })
    }

    /// First fresh entry in member order wins; later peers are not consulted.
    fn sweep_peers(&self, domain: &str, peers: &[Arc<Client>]) -> Option<(String, CacheEntry)> {
        for peer in peers {
            if std::ptr::eq(Arc::as_ptr(peer), self) {
                continue;
            }

            log::debug!("{}: checking {} in cache of {}", self.id, domain, peer.id);

            // Freshness is judged at the moment each peer is read
            if let Some(entry) = peer.cache.lookup(domain).filter(|e| e.is_fresh(Utc::now())) {
                return Some((peer.id.clone(), entry));
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use std::sync::mpsc::channel;
    use std::thread;
    use std::time::Duration as StdDuration;

    use chrono::Duration;

    use crate::dns::upstream::tests::StubUpstream;
    use crate::dns::upstream::parse_endpoint;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn client(id: &str, upstream: Arc<StubUpstream>) -> Arc<Client> {
        Arc::new(Client::new(id, parse_endpoint("127.0.0.1").unwrap(), upstream))
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!("example.com.", normalize_domain("Example.COM").unwrap());
        assert_eq!("example.com.", normalize_domain(" example.com. ").unwrap());

        assert!(normalize_domain("").is_err());
        assert!(normalize_domain(".").is_err());
        assert!(normalize_domain("  ").is_err());
    }

    #[test]
    fn test_local_hit_short_circuits() {
        let upstream = Arc::new(StubUpstream::answering("9.9.9.9"));
        let c = client("c", upstream.clone());
        let p = client("p", upstream.clone());
        let peers = vec![c.clone(), p.clone()];

        c.cache().store("a.com.", addr("1.2.3.4"), Utc::now());

        // Hold the peer's lock for the duration; a local hit must not need it
        let guard = p.cache().inner.lock();

        let (tx, rx) = channel();
        let c2 = c.clone();
        let peers2 = peers.clone();
        thread::spawn(move || {
            let _ = tx.send(c2.resolve_with_source("A.com", &peers2));
        });

        let resolution = rx
            .recv_timeout(StdDuration::from_secs(5))
            .expect("local hit blocked on a peer lock")
            .unwrap();
        drop(guard);

        assert_eq!(addr("1.2.3.4"), resolution.address);
        assert_eq!(ResolutionSource::Local, resolution.source);
        assert_eq!(0, upstream.call_count());
    }

    #[test]
    fn test_peer_propagation_keeps_peer_timestamp() {
        let upstream = Arc::new(StubUpstream::answering("9.9.9.9"));
        let c = client("c", upstream.clone());
        let p1 = client("p1", upstream.clone());
        let p2 = client("p2", upstream.clone());
        let peers = vec![c.clone(), p1.clone(), p2.clone()];

        let observed = Utc::now() - Duration::minutes(20);
        p2.cache().store("a.com.", addr("5.6.7.8"), observed);

        let resolution = c.resolve_with_source("a.com", &peers).unwrap();
        assert_eq!(addr("5.6.7.8"), resolution.address);
        assert_eq!(ResolutionSource::Peer("p2".to_string()), resolution.source);
        assert_eq!(0, upstream.call_count());

        let copied = c.cache().lookup("a.com.").unwrap();
        assert_eq!(observed, copied.observed_at);
        assert_eq!(addr("5.6.7.8"), copied.address);
    }

    #[test]
    fn test_peer_sweep_takes_first_fresh_in_member_order() {
        let upstream = Arc::new(StubUpstream::answering("9.9.9.9"));
        let c = client("c", upstream.clone());
        let p1 = client("p1", upstream.clone());
        let p2 = client("p2", upstream.clone());
        let p3 = client("p3", upstream.clone());
        let peers = vec![p1.clone(), c.clone(), p2.clone(), p3.clone()];

        // p1 is stale, p2 older than p3 but still fresh: p2 wins
        p1.cache().store("a.com.", addr("1.1.1.1"), Utc::now() - Duration::hours(2));
        p2.cache().store("a.com.", addr("2.2.2.2"), Utc::now() - Duration::minutes(50));
        p3.cache().store("a.com.", addr("3.3.3.3"), Utc::now());

        let resolution = c.resolve_with_source("a.com.", &peers).unwrap();
        assert_eq!(addr("2.2.2.2"), resolution.address);
        assert_eq!(ResolutionSource::Peer("p2".to_string()), resolution.source);
    }

    #[test]
    fn test_stale_local_entry_is_refreshed_from_upstream() {
        let upstream = Arc::new(StubUpstream::answering("9.9.9.9"));
        let c = client("c", upstream.clone());

        c.cache().store("a.com.", addr("1.2.3.4"), Utc::now() - Duration::hours(1));

        let before = Utc::now();
        let resolution = c.resolve_with_source("a.com.", &[c.clone()]).unwrap();
        assert_eq!(ResolutionSource::Upstream, resolution.source);
        assert_eq!(addr("9.9.9.9"), resolution.address);
        assert_eq!(1, upstream.call_count());

        let entry = c.cache().lookup("a.com.").unwrap();
        assert_eq!(addr("9.9.9.9"), entry.address);
        assert!(entry.observed_at >= before);
        assert!(entry.is_fresh(Utc::now()));
    }

    #[test]
    fn test_upstream_fallback_caches_answer() {
        let upstream = Arc::new(StubUpstream::new(Box::new(|domain, server| {
            assert_eq!("b.com.", domain);
            assert_eq!(parse_endpoint("127.0.0.1").unwrap(), server);
            Ok("5.6.7.8".parse().unwrap())
        })));
        let c = client("c", upstream.clone());
        let p = client("p", upstream.clone());
        let peers = vec![c.clone(), p.clone()];

        assert_eq!(addr("5.6.7.8"), c.resolve("B.com", &peers).unwrap());
        assert_eq!(1, upstream.call_count());
        assert!(p.cache().lookup("b.com.").is_none());

        // Second query is a local hit
        assert_eq!(addr("5.6.7.8"), c.resolve("b.com", &peers).unwrap());
        assert_eq!(1, upstream.call_count());

        // And the peer now finds it in c's cache
        let resolution = p.resolve_with_source("b.com", &peers).unwrap();
        assert_eq!(ResolutionSource::Peer("c".to_string()), resolution.source);
        assert_eq!(1, upstream.call_count());
    }

    #[test]
    fn test_upstream_failure_is_not_cached() {
        let upstream = Arc::new(StubUpstream::failing());
        let c = client("c", upstream.clone());
        let peers = vec![c.clone()];

        match c.resolve("nowhere.test", &peers) {
            Err(ResolveError::Upstream(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(c.cache().lookup("nowhere.test.").is_none());

        assert!(c.resolve("nowhere.test", &peers).is_err());
        assert_eq!(2, upstream.call_count());
    }

    #[test]
    fn test_invalid_domain_touches_nothing() {
        let upstream = Arc::new(StubUpstream::answering("9.9.9.9"));
        let c = client("c", upstream.clone());

        match c.resolve("", &[c.clone()]) {
            Err(ResolveError::InvalidDomain { .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(0, upstream.call_count());
        assert!(c.cache().is_empty());
    }

    #[test]
    fn test_cross_peer_resolution_does_not_deadlock() {
        let upstream = Arc::new(StubUpstream::new(Box::new(|_, _| {
            thread::sleep(StdDuration::from_millis(1));
            Ok("10.0.0.1".parse().unwrap())
        })));
        let a = client("a", upstream.clone());
        let b = client("b", upstream.clone());
        let peers = vec![a.clone(), b.clone()];

        let (tx, rx) = channel();
        for (me, prefix) in vec![(a.clone(), "a"), (b.clone(), "b")] {
            let peers = peers.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    // Each side resolves names the other one is also resolving
                    let own = format!("{}{}.test", prefix, i);
                    let other = format!("{}{}.test", if prefix == "a" { "b" } else { "a" }, i);
                    me.resolve(&own, &peers).unwrap();
                    me.resolve(&other, &peers).unwrap();
                }
                tx.send(()).unwrap();
            });
        }

        for _ in 0..2 {
            rx.recv_timeout(StdDuration::from_secs(30))
                .expect("concurrent peer sweeps deadlocked");
        }
    }

    #[test]
    fn test_peer_copy_does_not_back_date_newer_answer() {
        let upstream = Arc::new(StubUpstream::answering("9.9.9.9"));
        let c = client("c", upstream.clone());
        let p = client("p", upstream.clone());
        let peers = vec![c.clone(), p.clone()];

        let newer = Utc::now();
        let older = newer - Duration::minutes(50);

        // c misses locally and then waits on p's lock in the peer sweep
        let mut guard = p.cache().inner.lock();
        guard.put("a.com.", addr("5.6.7.8"), older);

        let (tx, rx) = channel();
        let c2 = c.clone();
        thread::spawn(move || {
            let _ = tx.send(c2.resolve_with_source("a.com.", &peers));
        });
        thread::sleep(StdDuration::from_millis(200));

        // A later answer lands in c while the sweep is blocked
        c.cache().store("a.com.", addr("1.2.3.4"), newer);
        drop(guard);

        rx.recv_timeout(StdDuration::from_secs(5))
            .expect("resolution did not finish")
            .unwrap();

        let entry = c.cache().lookup("a.com.").unwrap();
        assert_eq!(newer, entry.observed_at);
        assert_eq!(addr("1.2.3.4"), entry.address);
        assert_eq!(0, upstream.call_count());
    }
}
