use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::counter;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Hex sha256 of a generated package.
pub fn checksum_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[derive(Debug, Clone)]
struct CachedChecksum {
    checksum: String,
    stored_at: Instant,
}

#[derive(Debug, Default)]
struct Entries {
    by_config: HashMap<Uuid, CachedChecksum>,
    /// Bumped by every invalidation.
    generation: u64,
}

/// Cache generation observed before computing a checksum. A `put` made
/// with a ticket older than the latest invalidation is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTicket(u64);

/// Per-config checksum cache. Entries expire after the TTL and are
/// dropped explicitly whenever something feeding the package changes.
#[derive(Debug, Clone)]
pub struct ChecksumCache {
    ttl: Duration,
    entries: Arc<RwLock<Entries>>,
}

impl ChecksumCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(RwLock::new(Entries::default())),
        }
    }

    /// Cached checksum, if fresh. Expired entries are evicted.
    pub async fn get(&self, config_id: Uuid) -> Option<String> {
        let (hit, expired) = {
            let entries = self.entries.read().await;
            match entries.by_config.get(&config_id) {
                Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                    (Some(entry.checksum.clone()), false)
                }
                Some(_) => (None, true),
                None => (None, false),
            }
        };
        if expired {
            let mut entries = self.entries.write().await;
            if entries
                .by_config
                .get(&config_id)
                .is_some_and(|entry| entry.stored_at.elapsed() >= self.ttl)
            {
                entries.by_config.remove(&config_id);
            }
        }
        let outcome = if hit.is_some() { "hit" } else { "miss" };
        counter!("devconf_checksum_cache_lookups_total", "outcome" => outcome).increment(1);
        hit
    }

    pub async fn ticket(&self) -> CacheTicket {
        CacheTicket(self.entries.read().await.generation)
    }

    /// Store a checksum computed after `ticket` was taken. Returns false
    /// when an invalidation happened in between and the value was dropped.
    pub async fn put(&self, ticket: CacheTicket, config_id: Uuid, checksum: String) -> bool {
        let mut entries = self.entries.write().await;
        if entries.generation != ticket.0 {
            return false;
        }
        entries.by_config.insert(
            config_id,
            CachedChecksum {
                checksum,
                stored_at: Instant::now(),
            },
        );
        true
    }

    pub async fn invalidate(&self, config_id: Uuid) {
        let mut entries = self.entries.write().await;
        entries.by_config.remove(&config_id);
        entries.generation += 1;
    }

    pub async fn invalidate_many(&self, config_ids: &[Uuid]) {
        if config_ids.is_empty() {
            return;
        }
        let mut entries = self.entries.write().await;
        for id in config_ids {
            entries.by_config.remove(id);
        }
        entries.generation += 1;
        counter!("devconf_checksum_cache_bulk_invalidations_total").increment(1);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.by_config.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_lowercase_sha256_hex() {
        assert_eq!(
            checksum_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = ChecksumCache::new(Duration::from_millis(20));
        let id = Uuid::new_v4();
        let ticket = cache.ticket().await;
        cache.put(ticket, id, "abc".into()).await;
        assert_eq!(cache.get(id).await.as_deref(), Some("abc"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get(id).await.is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn stale_values_are_not_stored_after_invalidation() {
        let cache = ChecksumCache::new(Duration::from_secs(60));
        let id = Uuid::new_v4();
        let ticket = cache.ticket().await;
        cache.invalidate(id).await;
        assert!(!cache.put(ticket, id, "stale".into()).await);
        assert!(cache.get(id).await.is_none());

        let ticket = cache.ticket().await;
        assert!(cache.put(ticket, id, "fresh".into()).await);
        assert_eq!(cache.get(id).await.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn invalidation_drops_only_named_entries() {
        let cache = ChecksumCache::new(Duration::from_secs(60));
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        for id in [a, b, c] {
            let ticket = cache.ticket().await;
            cache.put(ticket, id, id.to_string()).await;
        }
        cache.invalidate(a).await;
        cache.invalidate_many(&[b]).await;
        assert!(cache.get(a).await.is_none());
        assert!(cache.get(b).await.is_none());
        assert_eq!(cache.get(c).await, Some(c.to_string()));
        assert_eq!(cache.len().await, 1);
    }
}
