//! Evaluation cache with dependency-driven invalidation
//!
//! Each entry remembers the names consulted while computing it. A reverse
//! index (name -> entries that consulted it) turns invalidation into a walk
//! over reverse edges.

use crate::value::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    pub deps: HashSet<String>,
}

/// Counters for cache behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Default)]
pub struct EvalCache {
    entries: HashMap<String, CacheEntry>,
    dependents: HashMap<String, HashSet<String>>,
    stats: CacheStats,
}

impl EvalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `name`, counting the hit or miss.
    pub fn lookup(&mut self, name: &str) -> Option<&CacheEntry> {
        match self.entries.get(name) {
            Some(entry) => {
                self.stats.hits += 1;
                trace!("Cache hit: {}", name);
                Some(entry)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Look up `name` without touching the counters.
    pub fn peek(&self, name: &str) -> Option<&CacheEntry> {
        self.entries.get(name)
    }

    pub fn store(&mut self, name: &str, value: Value, deps: HashSet<String>) {
        self.unlink(name);
        for dep in &deps {
            let _ = self
                .dependents
                .entry(dep.clone())
                .or_default()
                .insert(name.to_string());
        }
        trace!("Cache store: {} (deps: {:?})", name, deps);
        let _ = self
            .entries
            .insert(name.to_string(), CacheEntry { value, deps });
        self.stats.stores += 1;
    }

    /// Remove `name` and, transitively, every entry that consulted it.
    ///
    /// Returns the number of entries evicted.
    pub fn invalidate(&mut self, name: &str) -> usize {
        let mut pending = vec![name.to_string()];
        let mut seen = HashSet::new();
        let mut evicted = 0;

        while let Some(current) = pending.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if self.unlink(&current) {
                evicted += 1;
            }
            if let Some(users) = self.dependents.remove(&current) {
                pending.extend(users);
            }
        }

        if evicted > 0 {
            debug!("Invalidated {}: evicted {} cache entries", name, evicted);
        }
        self.stats.evictions += evicted as u64;
        evicted
    }

    /// Drop the entry for `name` and its reverse edges. Returns whether an
    /// entry existed.
    fn unlink(&mut self, name: &str) -> bool {
        let Some(entry) = self.entries.remove(name) else {
            return false;
        };
        for dep in &entry.deps {
            if let Some(users) = self.dependents.get_mut(dep) {
                let _ = users.remove(name);
                if users.is_empty() {
                    let _ = self.dependents.remove(dep);
                }
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.dependents.clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}
