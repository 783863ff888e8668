//! peerdns
//!
//! A peer-sharing DNS resolution cache. A pool of clients is split into
//! groups of fifteen; every client caches its answers for an hour, and a miss
//! is first offered to the other members of its group before the client asks
//! its upstream resolver.
//!
//! # Architecture
//!
//! * `config` - startup configuration file
//! * `dns` - caches, clients, groups, upstream resolution and the UDP server

/// Startup configuration
pub mod config;

/// Peer cache, resolution pipeline and DNS server
pub mod dns;
