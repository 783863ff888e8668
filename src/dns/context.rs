//! The `ServerContext` holds the state shared by every request handler

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use derive_more::{Display, Error, From};

use crate::config::{Config, ConfigError};
use crate::dns::client::{Client, Resolution, ResolveError};
use crate::dns::group::{GroupError, GroupManager};
use crate::dns::upstream::{
    HickoryUpstream, UpstreamError, UpstreamResolver, DEFAULT_UPSTREAM_TIMEOUT,
};

#[derive(Debug, Display, From, Error)]
pub enum ContextError {
    Config(ConfigError),
    Group(GroupError),
    Upstream(UpstreamError),
}

type Result<T> = std::result::Result<T, ContextError>;

#[derive(Default)]
pub struct ServerStatistics {
    pub udp_query_count: AtomicUsize,
    pub local_hits: AtomicUsize,
    pub peer_hits: AtomicUsize,
    pub upstream_answers: AtomicUsize,
    pub failures: AtomicUsize,
}

impl ServerStatistics {
    pub fn get_udp_query_count(&self) -> usize {
        self.udp_query_count.load(Ordering::Acquire)
    }

    pub fn get_local_hits(&self) -> usize {
        self.local_hits.load(Ordering::Acquire)
    }

    pub fn get_peer_hits(&self) -> usize {
        self.peer_hits.load(Ordering::Acquire)
    }

    pub fn get_upstream_answers(&self) -> usize {
        self.upstream_answers.load(Ordering::Acquire)
    }

    pub fn get_failures(&self) -> usize {
        self.failures.load(Ordering::Acquire)
    }

    fn record(&self, outcome: &std::result::Result<Resolution, ResolveError>) {
        use crate::dns::client::ResolutionSource;

        let counter = match outcome {
            Ok(Resolution {
                source: ResolutionSource::Local,
                ..
            }) => &self.local_hits,
            Ok(Resolution {
                source: ResolutionSource::Peer(_),
                ..
            }) => &self.peer_hits,
            Ok(Resolution {
                source: ResolutionSource::Upstream,
                ..
            }) => &self.upstream_answers,
            Err(_) => &self.failures,
        };

        counter.fetch_add(1, Ordering::Release);
    }
}

/// Topology and settings built once at startup
pub struct ServerContext {
    pub groups: GroupManager,
    pub entry_client: String,
    pub listen: SocketAddr,
    pub threads: usize,
    pub cache_dir: PathBuf,
    pub statistics: ServerStatistics,
}

impl ServerContext {
    /// Builds the topology from `config` with hickory as the upstream resolver
    pub fn new(config: &Config) -> Result<ServerContext> {
        let upstream = HickoryUpstream::new(DEFAULT_UPSTREAM_TIMEOUT)?;
        ServerContext::with_upstream(config, Arc::new(upstream))
    }

    /// Builds the topology from `config`, resolving misses through `upstream`.
    ///
    /// Every client loads its cache snapshot here and is then assigned to a
    /// group in configuration order.
    pub fn with_upstream(
        config: &Config,
        upstream: Arc<dyn UpstreamResolver + Send + Sync>,
    ) -> Result<ServerContext> {
        config.validate()?;

        let listen = config.server.listen_addr()?;
        let entry_client = config
            .entry_client_id()
            .map(str::to_string)
            .ok_or(ConfigError::NoClients)?;

        let groups = GroupManager::with_group_size(config.group_size);
        for client_config in &config.clients {
            let client = Client::with_cache_dir(
                &client_config.id,
                client_config.upstream_addr()?,
                &config.cache_dir,
                upstream.clone(),
            );

            groups.assign(Arc::new(client))?;
        }

        log::info!(
            "All {} clients added in {} groups",
            groups.client_count(),
            groups.groups().len()
        );

        Ok(ServerContext {
            groups,
            entry_client,
            listen,
            threads: config.server.threads,
            cache_dir: config.cache_dir.clone(),
            statistics: ServerStatistics::default(),
        })
    }

    /// Resolves `domain` through the entry client
    pub fn resolve(&self, domain: &str) -> std::result::Result<Resolution, ResolveError> {
        self.resolve_for(&self.entry_client, domain)
    }

    /// Resolves `domain` through the client registered as `client_id`
    pub fn resolve_for(
        &self,
        client_id: &str,
        domain: &str,
    ) -> std::result::Result<Resolution, ResolveError> {
        let outcome = self.groups.resolve(client_id, domain);
        self.statistics.record(&outcome);

        outcome
    }
}
