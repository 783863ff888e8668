//! Startup configuration
//!
//! Read once from a TOML file before anything else is constructed. Any
//! problem here is fatal: the server refuses to start rather than running with
//! a partial topology.
//!
//! ```toml
//! cache_dir = "cache"
//! group_size = 15
//! entry_client = "client-1"
//!
//! [server]
//! listen = "0.0.0.0:8053"
//! threads = 20
//!
//! [[clients]]
//! id = "client-1"
//! server = "8.8.8.8:53"
//! ```

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};
use serde::Deserialize;

use crate::dns::group::GROUP_SIZE;
use crate::dns::upstream::parse_endpoint;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8053";
pub const DEFAULT_THREADS: usize = 20;

#[derive(Debug, Display, From, Error)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    #[display(fmt = "no clients configured")]
    NoClients,
    #[display(fmt = "invalid client id {:?}", id)]
    #[from(ignore)]
    InvalidClientId { id: String },
    #[display(fmt = "client id {} is configured more than once", id)]
    #[from(ignore)]
    DuplicateClientId { id: String },
    #[display(fmt = "client {} has an invalid upstream server {:?}", id, server)]
    #[from(ignore)]
    InvalidUpstream { id: String, server: String },
    #[display(fmt = "group_size must be at least 1")]
    InvalidGroupSize,
    #[display(fmt = "entry_client {} is not a configured client", id)]
    #[from(ignore)]
    UnknownEntryClient { id: String },
    #[display(fmt = "invalid listen address {:?}", listen)]
    #[from(ignore)]
    InvalidListen { listen: String },
    #[display(fmt = "server threads must be at least 1")]
    InvalidThreads,
}

type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub id: String,

    /// Upstream resolver, `ip` or `ip:port`
    #[serde(alias = "upstream")]
    pub server: String,
}

impl ClientConfig {
    pub fn upstream_addr(&self) -> Result<SocketAddr> {
        parse_endpoint(&self.server).map_err(|_| ConfigError::InvalidUpstream {
            id: self.id.clone(),
            server: self.server.clone(),
        })
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: DEFAULT_LISTEN.to_string(),
            threads: DEFAULT_THREADS,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen {
                listen: self.listen.clone(),
            })
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_group_size() -> usize {
    GROUP_SIZE
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub clients: Vec<ClientConfig>,

    /// Directory holding the per-client cache snapshots
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_group_size")]
    pub group_size: usize,

    /// Client answering queries that arrive without a client id
    #[serde(default)]
    pub entry_client: Option<String>,

    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Reads and validates the configuration file at `path`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let data = fs::read_to_string(path.as_ref())?;
        Config::parse(&data)
    }

    /// Parses and validates a TOML document
    pub fn parse(data: &str) -> Result<Config> {
        let config: Config = toml::from_str(data)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.clients.is_empty() {
            return Err(ConfigError::NoClients);
        }

        if self.group_size == 0 {
            return Err(ConfigError::InvalidGroupSize);
        }

        if self.server.threads == 0 {
            return Err(ConfigError::InvalidThreads);
        }

        let mut seen = HashSet::new();
        for client in &self.clients {
            if client.id.trim().is_empty() || client.id.contains(|c: char| c == '/' || c == '\\') {
                return Err(ConfigError::InvalidClientId {
                    id: client.id.clone(),
                });
            }

            if !seen.insert(client.id.as_str()) {
                return Err(ConfigError::DuplicateClientId {
                    id: client.id.clone(),
                });
            }

            client.upstream_addr()?;
        }

        if let Some(ref id) = self.entry_client {
            if !seen.contains(id.as_str()) {
                return Err(ConfigError::UnknownEntryClient { id: id.clone() });
            }
        }

        self.server.listen_addr()?;

        Ok(())
    }

    /// The configured entry client, or the first client
    pub fn entry_client_id(&self) -> Option<&str> {
        self.entry_client
            .as_deref()
            .or_else(|| self.clients.first().map(|c| c.id.as_str()))
    }
}
