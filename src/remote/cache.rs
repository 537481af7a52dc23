use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

use crate::types::{Binding, LockTableShard};

struct CachedBinding {
    binding: Binding,
    cached_at: Instant,
}

/// Bindings of remotely owned shards, each trusted for `ttl` after it was
/// fetched from the registry.
pub(crate) struct BindingCache {
    cache: HashMap<LockTableShard, CachedBinding>,
    ttl: Duration,
}

impl BindingCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            cache: HashMap::new(),
            ttl,
        }
    }

    pub(crate) fn get(&self, shard: LockTableShard) -> Option<Binding> {
        self.cache
            .get(&shard)
            .filter(|entry| !self.is_expired(entry))
            .map(|entry| entry.binding.clone())
    }

    pub(crate) fn refresh(&mut self, binding: Binding) {
        // never move a shard back to an older binding
        if let Some(current) = self.cache.get(&binding.shard) {
            if current.binding.version > binding.version && !self.is_expired(current) {
                return;
            }
        }
        self.cache.insert(
            binding.shard,
            CachedBinding {
                binding,
                cached_at: Instant::now(),
            },
        );
    }

    pub(crate) fn invalidate(&mut self, shard: LockTableShard) {
        self.cache.remove(&shard);
    }

    fn is_expired(&self, entry: &CachedBinding) -> bool {
        entry.cached_at + self.ttl <= Instant::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServiceIdentity;

    fn binding(version: u64) -> Binding {
        Binding {
            shard: LockTableShard::new(0, 1),
            owner: ServiceIdentity::new("cn-2", "cn-2"),
            version,
            lease_expiry_ms: u64::MAX,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let mut cache = BindingCache::new(Duration::from_millis(100));
        let shard = LockTableShard::new(0, 1);
        assert!(cache.get(shard).is_none());
        cache.refresh(binding(1));
        assert_eq!(cache.get(shard), Some(binding(1)));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(cache.get(shard).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn older_versions_do_not_replace_newer() {
        let mut cache = BindingCache::new(Duration::from_secs(1));
        let shard = LockTableShard::new(0, 1);
        cache.refresh(binding(3));
        cache.refresh(binding(2));
        assert_eq!(cache.get(shard).map(|b| b.version), Some(3));
        cache.invalidate(shard);
        cache.refresh(binding(2));
        assert_eq!(cache.get(shard).map(|b| b.version), Some(2));
    }
}
