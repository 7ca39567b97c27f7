// src/artifact_cache.rs
//! Bounded cache of compiled permutations.
//!
//! Reads take the shared lock and use `peek`, so lookups from many threads never
//! serialize on LRU bookkeeping. Writers replace or remove whole `Arc` entries.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::RwLock;

use crate::permutation::{CompiledPermutation, PermutationKey};
use crate::source_model::BlockId;

pub struct ArtifactCache {
    entries: RwLock<LruCache<PermutationKey, Arc<CompiledPermutation>>>,
    by_block: RwLock<HashMap<BlockId, HashSet<PermutationKey>>>,
}

impl ArtifactCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
            by_block: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &PermutationKey) -> Option<Arc<CompiledPermutation>> {
        self.entries.read().peek(key).cloned()
    }

    pub fn contains(&self, key: &PermutationKey) -> bool {
        self.entries.read().contains(key)
    }

    pub fn insert(&self, artifact: Arc<CompiledPermutation>) {
        let key = artifact.key.clone();
        let block = artifact.block_id;
        let evicted = self.entries.write().push(key.clone(), artifact);

        let mut by_block = self.by_block.write();
        if let Some((old_key, old)) = evicted {
            if old_key != key {
                log::debug!("artifact cache evicted {old_key}");
                if let Some(keys) = by_block.get_mut(&old.block_id) {
                    keys.remove(&old_key);
                    if keys.is_empty() {
                        by_block.remove(&old.block_id);
                    }
                }
            }
        }
        by_block.entry(block).or_default().insert(key);
    }

    pub fn remove(&self, key: &PermutationKey) -> Option<Arc<CompiledPermutation>> {
        let removed = self.entries.write().pop(key)?;
        let mut by_block = self.by_block.write();
        if let Some(keys) = by_block.get_mut(&removed.block_id) {
            keys.remove(key);
            if keys.is_empty() {
                by_block.remove(&removed.block_id);
            }
        }
        Some(removed)
    }

    /// Drop every artifact of `block`. Returns how many were dropped.
    pub fn invalidate_block(&self, block: BlockId) -> usize {
        let Some(keys) = self.by_block.write().remove(&block) else {
            return 0;
        };
        let mut entries = self.entries.write();
        keys.iter().filter(|k| entries.pop(*k).is_some()).count()
    }

    /// Drop everything (compiler version change).
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let n = entries.len();
        entries.clear();
        self.by_block.write().clear();
        n
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permutation::{FeatureLevel, PermutationTarget, QualityLevel};

    fn artifact(block: u64, hash: u64) -> Arc<CompiledPermutation> {
        let target = PermutationTarget::new(FeatureLevel::Sm5, QualityLevel::Low, "PlatformA");
        Arc::new(CompiledPermutation {
            key: PermutationKey::new(&target, "v1", hash),
            block_id: BlockId(block),
            bytecode: vec![1, 2, 3],
            warnings: vec![],
        })
    }

    #[test]
    fn test_insert_get_invalidate() {
        let cache = ArtifactCache::new(8);
        let a = artifact(1, 10);
        let b = artifact(1, 11);
        let c = artifact(2, 12);
        for x in [&a, &b, &c] {
            cache.insert(x.clone());
        }
        assert!(Arc::ptr_eq(&cache.get(&a.key).unwrap(), &a));
        assert_eq!(cache.invalidate_block(BlockId(1)), 2);
        assert!(cache.get(&a.key).is_none());
        assert!(cache.contains(&c.key));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_eviction_updates_index() {
        let cache = ArtifactCache::new(2);
        cache.insert(artifact(1, 1));
        cache.insert(artifact(2, 2));
        cache.insert(artifact(3, 3));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.invalidate_block(BlockId(1)), 0);
        assert_eq!(cache.invalidate_block(BlockId(3)), 1);
    }

    #[test]
    fn test_clear() {
        let cache = ArtifactCache::new(4);
        cache.insert(artifact(1, 1));
        cache.insert(artifact(2, 2));
        assert_eq!(cache.clear(), 2);
        assert!(cache.is_empty());
    }
}
