use std::time::{Duration, Instant};

use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::CACHE_TTL_SECS;
use crate::model::{Appointment, Slot};
use crate::observability as obs;

/// Listings the read cache holds. Stored unfiltered; per-caller filtering
/// happens after the cache so one entry serves every requester.
#[derive(Debug, Clone)]
pub enum CachedListing {
    Slots(Vec<Slot>),
    Appointments(Vec<Appointment>),
}

pub fn provider_availability_key(provider_id: &Ulid) -> String {
    format!("provider_availability:{provider_id}")
}

pub fn provider_appointments_key(provider_id: &Ulid) -> String {
    format!("provider_appointments:{provider_id}")
}

pub fn requester_appointments_key(requester_id: &Ulid) -> String {
    format!("requester_appointments:{requester_id}")
}

/// Short-TTL read-through cache for availability and appointment listings.
///
/// Not authoritative: reads tolerate a stale entry for up to one TTL window,
/// writes never consult it. Mutating workflows invalidate by deletion only —
/// never by writing through — so a concurrent retry can't re-cache a result
/// that is about to change.
pub struct TtlCache {
    entries: DashMap<String, (Instant, CachedListing)>,
    ttl: Duration,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(CACHE_TTL_SECS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedListing> {
        if let Some(entry) = self.entries.get(key) {
            let (expires, value) = entry.value();
            if *expires > Instant::now() {
                metrics::counter!(obs::CACHE_HITS_TOTAL).increment(1);
                return Some(value.clone());
            }
        }
        // Expired entries are dropped lazily on the read that finds them.
        self.entries
            .remove_if(key, |_, (expires, _)| *expires <= Instant::now());
        metrics::counter!(obs::CACHE_MISSES_TOTAL).increment(1);
        None
    }

    pub fn put(&self, key: String, value: CachedListing) {
        self.entries.insert(key, (Instant::now() + self.ttl, value));
    }

    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots_entry() -> CachedListing {
        CachedListing::Slots(vec![Slot::new(Ulid::new(), Ulid::new(), 0, 1000, 2000)])
    }

    #[test]
    fn put_get_roundtrip() {
        let cache = TtlCache::new();
        cache.put("k".into(), slots_entry());
        assert!(matches!(cache.get("k"), Some(CachedListing::Slots(_))));
    }

    #[test]
    fn miss_on_absent_key() {
        let cache = TtlCache::new();
        assert!(cache.get("nope").is_none());
    }

    #[test]
    fn delete_removes_entry() {
        let cache = TtlCache::new();
        cache.put("k".into(), slots_entry());
        cache.delete("k");
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn expired_entry_is_dropped() {
        let cache = TtlCache::with_ttl(Duration::from_millis(0));
        cache.put("k".into(), slots_entry());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn key_builders_are_distinct() {
        let id = Ulid::new();
        let a = provider_availability_key(&id);
        let b = provider_appointments_key(&id);
        let c = requester_appointments_key(&id);
        assert_ne!(a, b);
        assert_ne!(b, c);
    }
}
