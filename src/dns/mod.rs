//! Peer-sharing DNS resolution
//!
//! Clients are partitioned into fixed-size groups. Each client keeps its own
//! time-bounded cache; on a miss it asks the members of its group before it
//! falls back to its upstream resolver.
//!
//! # Module Structure
//!
//! * `cache` - per-client answer cache with snapshot persistence
//! * `client` - clients and the tiered resolution pipeline
//! * `group` - groups and first-fit group assignment
//! * `upstream` - upstream resolver interface and the hickory implementation
//! * `context` - topology and settings shared by the request handlers
//! * `server` - UDP server answering A queries
//! * `logging` - log output setup

/// Per-client answer cache with TTL and snapshot persistence
pub mod cache;

/// Clients and the tiered resolution pipeline
pub mod client;

/// Client groups and the group manager
pub mod group;

/// Upstream resolution for misses no peer can answer
pub mod upstream;

/// Server configuration and shared context
pub mod context;

/// UDP DNS server
pub mod server;

/// Log output setup
pub mod logging;
