//! Per-client DNS answer cache
//!
//! Every client owns exactly one cache mapping a normalized domain name to the
//! address it resolved to and the moment that answer was observed. Entries are
//! fresh for one hour after they were observed and stale afterwards.
//!
//! # Persistence
//!
//! The whole mapping is written to a JSON snapshot file after every accepted
//! mutation and read back once when the owning client is constructed. There is
//! no append log: a save always replaces the previous snapshot. A missing or
//! corrupt snapshot loads as an empty cache, and a failed save only degrades
//! durability; the in-memory state stays authoritative.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use peerdns::dns::cache::SynchronizedCacheStore;
//! # use chrono::Utc;
//! let cache = SynchronizedCacheStore::load("client-1_cache.json");
//!
//! cache.store("example.com.", "93.184.216.34".parse().unwrap(), Utc::now());
//!
//! if let Some(entry) = cache.lookup("example.com.") {
//!     assert!(entry.is_fresh(Utc::now()));
//! }
//! ```

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use derive_more::{Display, Error, From};
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};

/// Lifetime of a cache entry, in seconds.
pub const CACHE_TTL_SECS: i64 = 3600;

#[derive(Debug, Display, From, Error)]
pub enum CacheError {
    Io(std::io::Error),
    Json(serde_json::Error),
}

type Result<T> = std::result::Result<T, CacheError>;

/// The freshness window shared by every cache
pub fn ttl() -> Duration {
    Duration::seconds(CACHE_TTL_SECS)
}

/// Cache key for `domain`: trimmed, lower-cased and fully qualified. `None`
/// for names without any label.
pub fn normalize_name(domain: &str) -> Option<String> {
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return None;
    }

    Some(format!("{}.", trimmed.to_ascii_lowercase()))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub domain: String,
    pub address: IpAddr,
    pub observed_at: DateTime<Utc>,
}

impl CacheEntry {
    /// An entry is fresh strictly before its TTL elapses; at the boundary it is stale.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.observed_at) < ttl()
    }
}

/// On-disk shape of a single entry. The domain is the key of the snapshot map.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    address: IpAddr,
    observed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct CacheStore {
    entries: HashMap<String, CacheEntry>,
}

impl CacheStore {
    pub fn new() -> CacheStore {
        CacheStore {
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, domain: &str) -> Option<&CacheEntry> {
        self.entries.get(domain)
    }

    /// Inserts or overwrites the entry for `domain`. Empty keys are never stored.
    pub fn put(&mut self, domain: &str, address: IpAddr, observed_at: DateTime<Utc>) -> bool {
        if domain.is_empty() {
            return false;
        }

        self.entries.insert(
            domain.to_string(),
            CacheEntry {
                domain: domain.to_string(),
                address,
                observed_at,
            },
        );

        true
    }

    /// Like `put`, but keeps an existing entry observed later than `observed_at`.
    pub fn put_if_newer(
        &mut self,
        domain: &str,
        address: IpAddr,
        observed_at: DateTime<Utc>,
    ) -> bool {
        match self.entries.get(domain) {
            Some(existing) if existing.observed_at > observed_at => false,
            _ => self.put(domain, address, observed_at),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn to_json(&self) -> Result<String> {
        let snapshot: HashMap<&str, SnapshotRecord> = self
            .entries
            .iter()
            .map(|(domain, entry)| {
                (
                    domain.as_str(),
                    SnapshotRecord {
                        address: entry.address,
                        observed_at: entry.observed_at,
                    },
                )
            })
            .collect();

        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    pub fn from_json(json: &str) -> Result<CacheStore> {
        let snapshot: HashMap<String, SnapshotRecord> = serde_json::from_str(json)?;

        let mut store = CacheStore::new();
        for (key, record) in snapshot {
            let domain = match normalize_name(&key) {
                Some(domain) => domain,
                None => continue,
            };

            // Only A answers are ever served
            if !record.address.is_ipv4() {
                log::warn!("Dropping non-IPv4 snapshot entry {} -> {}", key, record.address);
                continue;
            }

            store.put_if_newer(&domain, record.address, record.observed_at);
        }

        Ok(store)
    }

    /// Reads a snapshot file
    pub fn read_snapshot(path: &Path) -> Result<CacheStore> {
        let json = fs::read_to_string(path)?;
        CacheStore::from_json(&json)
    }

    /// Replaces the snapshot at `path` with the current mapping.
    ///
    /// The data goes to a sibling temporary file first and is then renamed over
    /// the snapshot, so a torn write never clobbers the previous snapshot.
    pub fn write_snapshot(&self, path: &Path) -> Result<()> {
        write_snapshot_json(path, &self.to_json()?)
    }
}

fn write_snapshot_json(path: &Path, json: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;

    Ok(())
}

/// A cache store behind its own lock, bound to a snapshot file.
///
/// The lock is only ever held for a single map access. Snapshot writes are
/// serialized by a second lock so that a slower writer can never replace a
/// newer snapshot with an older one.
#[derive(Default)]
pub struct SynchronizedCacheStore {
    pub(crate) inner: Mutex<CacheStore>,
    persist: Mutex<()>,
    path: Option<PathBuf>,
}

impl SynchronizedCacheStore {
    /// A cache that lives in memory only
    pub fn new() -> SynchronizedCacheStore {
        SynchronizedCacheStore {
            inner: Mutex::new(CacheStore::new()),
            persist: Mutex::new(()),
            path: None,
        }
    }

    /// Loads the snapshot at `path`, falling back to an empty cache when the
    /// file is missing or unreadable. Later mutations are persisted there.
    pub fn load<P: Into<PathBuf>>(path: P) -> SynchronizedCacheStore {
        let path = path.into();

        let store = if path.exists() {
            match CacheStore::read_snapshot(&path) {
                Ok(store) => {
                    log::info!(
                        "Loaded {} cache entries from {}",
                        store.len(),
                        path.display()
                    );
                    store
                }
                Err(e) => {
                    log::warn!(
                        "Ignoring unreadable cache snapshot {}: {}",
                        path.display(),
                        e
                    );
                    CacheStore::new()
                }
            }
        } else {
            log::debug!("No cache snapshot at {}, starting empty", path.display());
            CacheStore::new()
        };

        SynchronizedCacheStore {
            inner: Mutex::new(store),
            persist: Mutex::new(()),
            path: Some(path),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn lookup(&self, domain: &str) -> Option<CacheEntry> {
        self.inner.lock().get(domain).cloned()
    }

    /// Records an answer and persists the snapshot. Persistence failures are
    /// logged and swallowed.
    pub fn store(&self, domain: &str, address: IpAddr, observed_at: DateTime<Utc>) {
        let accepted = self.inner.lock().put(domain, address, observed_at);

        if accepted {
            self.save();
        }
    }

    /// Records an answer copied from elsewhere unless a later observation is
    /// already cached. Returns whether the entry was taken.
    pub fn store_if_newer(&self, domain: &str, address: IpAddr, observed_at: DateTime<Utc>) -> bool {
        let accepted = self.inner.lock().put_if_newer(domain, address, observed_at);

        if accepted {
            self.save();
        }

        accepted
    }

    /// Writes the full mapping to the snapshot file, if there is one.
    pub fn save(&self) {
        if let Err(e) = self.try_save() {
            log::warn!("Failed to persist cache snapshot: {}", e);
        }
    }

    pub fn try_save(&self) -> Result<()> {
        let path = match self.path {
            Some(ref path) => path,
            None => return Ok(()),
        };

        let _persist = self.persist.lock();
        let json = self.inner.lock().to_json()?;

        write_snapshot_json(path, &json)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn list(&self) -> Vec<CacheEntry> {
        self.inner.lock().entries().cloned().collect()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use chrono::TimeZone;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_freshness_boundary() {
        let observed = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        let entry = CacheEntry {
            domain: "example.com.".to_string(),
            address: addr("1.2.3.4"),
            observed_at: observed,
        };

        assert!(entry.is_fresh(observed));
        assert!(entry.is_fresh(observed + Duration::seconds(CACHE_TTL_SECS - 1)));

        // Exactly at the TTL the entry is already stale
        assert!(!entry.is_fresh(observed + ttl()));
        assert!(!entry.is_fresh(observed + Duration::hours(2)));
    }

    proptest! {
        #[test]
        fn test_freshness_matches_age(age in -10_000i64..20_000i64) {
            let observed = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
            let entry = CacheEntry {
                domain: "example.com.".to_string(),
                address: addr("1.2.3.4"),
                observed_at: observed,
            };
            let now = observed + Duration::seconds(age);

            prop_assert_eq!(entry.is_fresh(now), age < CACHE_TTL_SECS);
        }
    }

    #[test]
    fn test_put_overwrites_and_rejects_empty() {
        let mut store = CacheStore::new();
        let t1 = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        let t2 = t1 + Duration::minutes(5);

        assert!(store.get("a.com.").is_none());

        assert!(store.put("a.com.", addr("1.2.3.4"), t1));
        assert!(store.put("a.com.", addr("5.6.7.8"), t2));
        assert!(!store.put("", addr("9.9.9.9"), t2));

        assert_eq!(1, store.len());
        let entry = store.get("a.com.").unwrap();
        assert_eq!(addr("5.6.7.8"), entry.address);
        assert_eq!(t2, entry.observed_at);
        assert_eq!("a.com.", entry.domain);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("client-1_cache.json");

        let t1 = Utc.timestamp_opt(1_600_000_000, 123_456_789).unwrap();
        let t2 = Utc::now();

        let cache = SynchronizedCacheStore::load(&path);
        assert!(cache.is_empty());
        cache.store("a.com.", addr("1.2.3.4"), t1);
        cache.store("b.com.", addr("5.6.7.8"), t2);

        let reloaded = SynchronizedCacheStore::load(&path);
        assert_eq!(2, reloaded.len());

        let a = reloaded.lookup("a.com.").unwrap();
        assert_eq!(addr("1.2.3.4"), a.address);
        assert_eq!(t1, a.observed_at);

        let b = reloaded.lookup("b.com.").unwrap();
        assert_eq!(addr("5.6.7.8"), b.address);
        assert_eq!(t2, b.observed_at);

        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_missing_snapshot_loads_empty() {
        let dir = TempDir::new().unwrap();
        let cache = SynchronizedCacheStore::load(dir.path().join("nobody_cache.json"));

        assert!(cache.is_empty());
    }

    #[test]
    fn test_corrupt_snapshot_loads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken_cache.json");
        fs::write(&path, "{\"a.com.\": {\"address\": ").unwrap();

        let cache = SynchronizedCacheStore::load(&path);
        assert!(cache.is_empty());

        // The next mutation replaces the corrupt file with a valid snapshot
        cache.store("a.com.", addr("1.2.3.4"), Utc::now());
        assert_eq!(1, CacheStore::read_snapshot(&path).unwrap().len());
    }

    #[test]
    fn test_put_if_newer_never_back_dates() {
        let mut store = CacheStore::new();
        let older = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        let newer = older + Duration::minutes(50);

        assert!(store.put_if_newer("a.com.", addr("1.2.3.4"), newer));
        assert!(!store.put_if_newer("a.com.", addr("5.6.7.8"), older));

        let entry = store.get("a.com.").unwrap();
        assert_eq!(addr("1.2.3.4"), entry.address);
        assert_eq!(newer, entry.observed_at);

        // Equal or later observations replace the entry
        assert!(store.put_if_newer("a.com.", addr("9.9.9.9"), newer));
        assert_eq!(addr("9.9.9.9"), store.get("a.com.").unwrap().address);
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(Some("example.com.".to_string()), normalize_name(" Example.COM"));
        assert_eq!(Some("example.com.".to_string()), normalize_name("example.com."));
        assert_eq!(None, normalize_name("."));
        assert_eq!(None, normalize_name(""));
    }

    #[test]
    fn test_snapshot_keys_are_normalized() {
        let json = r#"{
            "A.COM": {"address": "1.2.3.4", "observed_at": "2020-09-13T12:26:40Z"},
            "a.com.": {"address": "5.6.7.8", "observed_at": "2020-09-13T12:20:00Z"},
            "B.com.": {"address": "9.9.9.9", "observed_at": "2020-09-13T12:26:40Z"}
        }"#;

        let store = CacheStore::from_json(json).unwrap();
        assert_eq!(2, store.len());

        // Of two spellings of one name the later observation wins
        assert_eq!(addr("1.2.3.4"), store.get("a.com.").unwrap().address);
        assert_eq!(addr("9.9.9.9"), store.get("b.com.").unwrap().address);
        assert!(store.get("A.COM").is_none());
    }

    #[test]
    fn test_snapshot_drops_ipv6_entries() {
        let json = r#"{
            "v6.com.": {"address": "2001:db8::1", "observed_at": "2020-09-13T12:26:40Z"},
            "v4.com.": {"address": "1.2.3.4", "observed_at": "2020-09-13T12:26:40Z"}
        }"#;

        let store = CacheStore::from_json(json).unwrap();
        assert_eq!(1, store.len());
        assert!(store.get("v6.com.").is_none());
    }

    #[test]
    fn test_snapshot_drops_empty_domains() {
        let json = r#"{
            "": {"address": "1.1.1.1", "observed_at": "2020-09-13T12:26:40Z"},
            "a.com.": {"address": "1.2.3.4", "observed_at": "2020-09-13T12:26:40Z"}
        }"#;

        let store = CacheStore::from_json(json).unwrap();
        assert_eq!(1, store.len());
        assert!(store.get("").is_none());
    }

    #[test]
    fn test_failed_save_keeps_memory_state() {
        let dir = TempDir::new().unwrap();
        // A directory where the snapshot file should be makes every write fail
        let path = dir.path().join("blocked_cache.json");
        fs::create_dir_all(&path).unwrap();

        let cache = SynchronizedCacheStore::load(&path);
        cache.store("a.com.", addr("1.2.3.4"), Utc::now());

        assert!(cache.try_save().is_err());
        assert_eq!(Some(addr("1.2.3.4")), cache.lookup("a.com.").map(|e| e.address));
    }

    #[test]
    fn test_memory_only_cache() {
        let cache = SynchronizedCacheStore::new();
        cache.store("a.com.", addr("1.2.3.4"), Utc::now());

        assert!(cache.path().is_none());
        assert!(cache.try_save().is_ok());
        assert_eq!(1, cache.list().len());
    }
}
