//! Upstream resolution for cache misses that no peer could answer

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use derive_more::{Display, Error, From};
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Runtime};

/// Port used when an upstream endpoint does not name one
pub const DEFAULT_DNS_PORT: u16 = 53;

/// Default time allowed for a single upstream query
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Display, From, Error)]
pub enum UpstreamError {
    Lookup(hickory_resolver::error::ResolveError),
    Io(std::io::Error),
    #[display(fmt = "no address record for {} from {}", domain, server)]
    #[from(ignore)]
    NoAddress { domain: String, server: SocketAddr },
    #[display(fmt = "invalid upstream endpoint: {}", endpoint)]
    #[from(ignore)]
    InvalidEndpoint { endpoint: String },
}

type Result<T> = std::result::Result<T, UpstreamError>;

/// Parses `ip` or `ip:port` (`[v6]:port` for IPv6) into a socket address.
pub fn parse_endpoint(endpoint: &str) -> Result<SocketAddr> {
    let endpoint = endpoint.trim();

    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = endpoint.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_DNS_PORT));
    }

    Err(UpstreamError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
    })
}

/// The query a client makes once its own cache and every peer missed.
///
/// Implementations ask exactly once and report the outcome; retry policy
/// belongs to whoever wraps them.
pub trait UpstreamResolver {
    fn resolve(&self, domain: &str, server: SocketAddr) -> Result<IpAddr>;
}

/// Upstream resolver backed by the hickory async resolver.
///
/// All lookups run on one shared multi-threaded runtime. The calling thread
/// blocks on its own lookup only, so queries from different clients proceed
/// in parallel even when they share a name server. A resolver is built lazily
/// for each distinct server and then reused; the hickory cache is disabled
/// since the client caches are the cache.
pub struct HickoryUpstream {
    timeout: Duration,
    runtime: Runtime,
    resolvers: Mutex<HashMap<SocketAddr, TokioAsyncResolver>>,
}

impl HickoryUpstream {
    pub fn new(timeout: Duration) -> Result<HickoryUpstream> {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("peerdns-upstream")
            .build()?;

        Ok(HickoryUpstream {
            timeout,
            runtime,
            resolvers: Mutex::new(HashMap::new()),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The map lock covers the lookup-or-insert only, never a query
    fn resolver_for(&self, server: SocketAddr) -> TokioAsyncResolver {
        let mut resolvers = self.resolvers.lock();
        if let Some(resolver) = resolvers.get(&server) {
            return resolver.clone();
        }

        // One UDP name server and one attempt: a query is asked exactly once
        let name_server = NameServerConfig::new(server, Protocol::Udp);
        let config = ResolverConfig::from_parts(None, vec![], vec![name_server]);

        let mut opts = ResolverOpts::default();
        opts.timeout = self.timeout;
        opts.attempts = 1;
        opts.cache_size = 0;
        opts.use_hosts_file = false;

        let resolver = {
            let _guard = self.runtime.enter();
            TokioAsyncResolver::tokio(config, opts)
        };
        log::debug!("Created upstream resolver for {}", server);
        resolvers.insert(server, resolver.clone());

        resolver
    }
}

impl UpstreamResolver for HickoryUpstream {
    fn resolve(&self, domain: &str, server: SocketAddr) -> Result<IpAddr> {
        log::info!("Sending query for {} to upstream {}", domain, server);

        let resolver = self.resolver_for(server);
        let lookup = match self.runtime.block_on(resolver.ipv4_lookup(domain)) {
            Ok(lookup) => lookup,
            Err(e) => {
                log::info!("Upstream {} failed for {}: {}", server, domain, e);
                if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                    return Err(UpstreamError::NoAddress {
                        domain: domain.to_string(),
                        server,
                    });
                }

                return Err(UpstreamError::Lookup(e));
            }
        };

        match lookup.iter().next() {
            Some(a) => Ok(IpAddr::V4(a.0)),
            None => Err(UpstreamError::NoAddress {
                domain: domain.to_string(),
                server,
            }),
        }
    }
}
