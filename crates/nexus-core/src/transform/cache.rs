//! Transform output cache.
//!
//! One entry per module, valid while both the module's content hash and
//! the transform-config hash match. Entries remember the extra files their
//! transform read so a change to one of those files can find its owners.

use super::{TransformError, TransformOutput};
use crate::graph::ModuleId;
use nexus_proto::CacheStats;
use rustc_hash::FxHashMap as HashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry {
    content_hash: String,
    config_hash: String,
    output: Arc<TransformOutput>,
    extra_deps: Vec<ModuleId>,
    cost: Duration,
    last_used: u64,
}

/// Module id to transformed output.
#[derive(Debug, Default)]
pub struct TransformCache {
    entries: HashMap<ModuleId, CacheEntry>,
    dep_owners: HashMap<ModuleId, BTreeSet<ModuleId>>,
    tick: u64,
    max_entries: Option<usize>,
    hits: u64,
    misses: u64,
    transform_time: Duration,
}

impl TransformCache {
    /// `max_entries` bounds the cache with least-recently-used eviction.
    #[must_use]
    pub fn new(max_entries: Option<usize>) -> Self {
        Self {
            max_entries: max_entries.filter(|&n| n > 0),
            ..Self::default()
        }
    }

    /// Content hash of the entry for `id`, if it was produced under
    /// `config_hash`. Does not count as a use.
    #[must_use]
    pub fn probe(&self, id: ModuleId, config_hash: &str) -> Option<&str> {
        self.entries
            .get(&id)
            .filter(|e| e.config_hash == config_hash)
            .map(|e| e.content_hash.as_str())
    }

    /// Output for `id` when both hashes match.
    pub fn get(
        &mut self,
        id: ModuleId,
        content_hash: &str,
        config_hash: &str,
    ) -> Option<Arc<TransformOutput>> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self
            .entries
            .get_mut(&id)
            .filter(|e| e.content_hash == content_hash && e.config_hash == config_hash)?;
        entry.last_used = tick;
        self.hits += 1;
        Some(Arc::clone(&entry.output))
    }

    /// Store a freshly transformed output. Returns ids evicted to stay
    /// within the size bound.
    pub fn insert(
        &mut self,
        id: ModuleId,
        content_hash: &str,
        config_hash: &str,
        output: Arc<TransformOutput>,
        extra_deps: Vec<ModuleId>,
        cost: Duration,
    ) -> Vec<ModuleId> {
        self.evict(id);
        self.tick += 1;
        self.misses += 1;
        self.transform_time += cost;
        debug!(module = %id, cost_us = cost.as_micros() as u64, "Transformed module");

        for dep in &extra_deps {
            self.dep_owners.entry(*dep).or_default().insert(id);
        }
        self.entries.insert(
            id,
            CacheEntry {
                content_hash: content_hash.to_string(),
                config_hash: config_hash.to_string(),
                output,
                extra_deps,
                cost,
                last_used: self.tick,
            },
        );
        self.enforce_bound(id)
    }

    /// Lookup-or-populate in one step.
    pub fn get_or_transform<F>(
        &mut self,
        id: ModuleId,
        content_hash: &str,
        config_hash: &str,
        transform: F,
    ) -> Result<Arc<TransformOutput>, TransformError>
    where
        F: FnOnce() -> Result<(TransformOutput, Vec<ModuleId>), TransformError>,
    {
        if let Some(hit) = self.get(id, content_hash, config_hash) {
            return Ok(hit);
        }
        let start = std::time::Instant::now();
        let (output, deps) = transform()?;
        let output = Arc::new(output);
        self.insert(
            id,
            content_hash,
            config_hash,
            Arc::clone(&output),
            deps,
            start.elapsed(),
        );
        Ok(output)
    }

    fn enforce_bound(&mut self, keep: ModuleId) -> Vec<ModuleId> {
        let Some(max) = self.max_entries else {
            return Vec::new();
        };
        let mut evicted = Vec::new();
        while self.entries.len() > max {
            let victim = self
                .entries
                .iter()
                .filter(|(id, _)| **id != keep)
                .min_by_key(|(id, e)| (e.last_used, **id))
                .map(|(id, _)| *id);
            let Some(victim) = victim else {
                break;
            };
            self.evict(victim);
            evicted.push(victim);
        }
        evicted
    }

    /// Drop the entry for `id`. Returns whether one existed.
    pub fn evict(&mut self, id: ModuleId) -> bool {
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        for dep in entry.extra_deps {
            if let Some(owners) = self.dep_owners.get_mut(&dep) {
                owners.remove(&id);
                if owners.is_empty() {
                    self.dep_owners.remove(&dep);
                }
            }
        }
        true
    }

    /// Modules whose cached output read `dep`.
    #[must_use]
    pub fn owners_of(&self, dep: ModuleId) -> Vec<ModuleId> {
        self.dep_owners
            .get(&dep)
            .map(|o| o.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn extra_deps(&self, id: ModuleId) -> &[ModuleId] {
        self.entries.get(&id).map_or(&[], |e| e.extra_deps.as_slice())
    }

    /// Recorded transform cost of the entry for `id`.
    #[must_use]
    pub fn cost(&self, id: ModuleId) -> Option<Duration> {
        self.entries.get(&id).map(|e| e.cost)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
            transform_ms: self.transform_time.as_millis() as u64,
        }
    }
}
