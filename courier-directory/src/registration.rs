//! The in-memory registration index.
//!
//! Maps (category, key, subkey) registrations to sets of producers. The
//! three categories in use: `"client"` (the producer itself, empty key and
//! subkey), `"topic"` (key = topic name), and `"channel"` (key = topic
//! name, subkey = channel name).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use courier_core::{names, PeerAnnounce};
use parking_lot::RwLock;

/// A (category, key, subkey) tuple under which producers are indexed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Registration {
    /// `"client"`, `"topic"`, or `"channel"`.
    pub category: String,
    /// Topic name for topic/channel registrations.
    pub key: String,
    /// Channel name for channel registrations.
    pub sub_key: String,
}

impl Registration {
    /// Build a registration.
    pub fn new(
        category: impl Into<String>,
        key: impl Into<String>,
        sub_key: impl Into<String>,
    ) -> Self {
        Self { category: category.into(), key: key.into(), sub_key: sub_key.into() }
    }

    /// Whether this registers an ephemeral channel, which vanishes once its
    /// last producer is removed.
    pub fn is_ephemeral_channel(&self) -> bool {
        self.category == "channel" && names::is_ephemeral(&self.sub_key)
    }
}

impl fmt::Display for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.category, self.key, self.sub_key)
    }
}

/// A connected broker's identity and liveness record.
///
/// Created on `IDENTIFY`, shared between every registration the producer
/// holds, refreshed by `PING`, destroyed on disconnect.
#[derive(Debug)]
pub struct PeerInfo {
    /// Stable producer key: the remote address of the identifying
    /// connection.
    pub id: String,
    /// TCP port the broker serves clients on.
    pub tcp_port: u16,
    /// HTTP port the broker serves stats on.
    pub http_port: u16,
    /// Broker software version.
    pub version: String,
    /// Address consumers should use to reach the broker.
    pub broadcast_address: String,
    /// Broker hostname.
    pub hostname: String,
    last_update: AtomicI64,
}

impl PeerInfo {
    /// Record a newly-identified producer.
    pub fn new(id: impl Into<String>, announce: PeerAnnounce) -> Self {
        let info = Self {
            id: id.into(),
            tcp_port: announce.tcp_port,
            http_port: announce.http_port,
            version: announce.version,
            broadcast_address: announce.broadcast_address,
            hostname: announce.hostname,
            last_update: AtomicI64::new(0),
        };
        info.touch();
        info
    }

    /// Refresh the last-seen timestamp.
    pub fn touch(&self) {
        self.last_update.store(unix_nanos(), Ordering::SeqCst);
    }

    /// Nanoseconds since the epoch of the last `IDENTIFY`/`PING`.
    pub fn last_update(&self) -> i64 {
        self.last_update.load(Ordering::SeqCst)
    }

    /// Whether the producer was seen within `window`.
    pub fn is_active(&self, window: Duration) -> bool {
        let age = unix_nanos().saturating_sub(self.last_update());
        age <= window.as_nanos() as i64
    }
}

/// Shared handle to a producer record.
pub type Producer = Arc<PeerInfo>;

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Pattern match for find queries: `"*"` matches any whole field,
/// anything else matches exactly. No globbing.
fn matches(pattern: &str, value: &str) -> bool {
    pattern == "*" || pattern == value
}

/// The concurrent registration index.
///
/// A reader/writer lock protects the top-level map; lookups copy results
/// under the read lock and return snapshots.
#[derive(Default)]
pub struct RegistrationDb {
    map: RwLock<HashMap<Registration, HashMap<String, Producer>>>,
}

impl RegistrationDb {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a producer under a registration. Returns `false` if it was
    /// already present (idempotent).
    pub fn add_producer(&self, reg: Registration, producer: Producer) -> bool {
        let mut map = self.map.write();
        let producers = map.entry(reg).or_default();
        if producers.contains_key(&producer.id) {
            return false;
        }
        producers.insert(producer.id.clone(), producer);
        true
    }

    /// Remove a producer from a registration. Returns whether it was
    /// present and how many producers remain. The registration itself is
    /// retained even when empty; use [`remove_registration`] to drop it.
    ///
    /// [`remove_registration`]: Self::remove_registration
    pub fn remove_producer(&self, reg: &Registration, producer_id: &str) -> (bool, usize) {
        let mut map = self.map.write();
        match map.get_mut(reg) {
            None => (false, 0),
            Some(producers) => {
                let removed = producers.remove(producer_id).is_some();
                (removed, producers.len())
            }
        }
    }

    /// Drop a registration and any producers still under it.
    pub fn remove_registration(&self, reg: &Registration) {
        self.map.write().remove(reg);
    }

    /// Registrations matching the given patterns.
    pub fn find_registrations(&self, category: &str, key: &str, sub_key: &str) -> Vec<Registration> {
        self.map
            .read()
            .keys()
            .filter(|r| {
                matches(category, &r.category) && matches(key, &r.key) && matches(sub_key, &r.sub_key)
            })
            .cloned()
            .collect()
    }

    /// Producers under registrations matching the given patterns,
    /// de-duplicated by producer key.
    pub fn find_producers(&self, category: &str, key: &str, sub_key: &str) -> Vec<Producer> {
        let map = self.map.read();
        let mut seen: HashMap<String, Producer> = HashMap::new();
        for (reg, producers) in map.iter() {
            if matches(category, &reg.category)
                && matches(key, &reg.key)
                && matches(sub_key, &reg.sub_key)
            {
                for (id, producer) in producers {
                    seen.entry(id.clone()).or_insert_with(|| Arc::clone(producer));
                }
            }
        }
        seen.into_values().collect()
    }

    /// Reverse index: every registration a producer holds.
    pub fn lookup_registrations(&self, producer_id: &str) -> Vec<Registration> {
        self.map
            .read()
            .iter()
            .filter(|(_, producers)| producers.contains_key(producer_id))
            .map(|(reg, _)| reg.clone())
            .collect()
    }
}
