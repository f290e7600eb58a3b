//! Per-unit pass result cache.
//!
//! Entries are keyed by the unit, the pass, the fingerprint of the unit's IR
//! before the pass, and a context hash (pass options plus the summaries the
//! pass saw from its dependencies). Each entry has its own lock: a worker that
//! misses holds the entry while it computes, so two workers never compute the
//! same key, while workers on other keys proceed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::callgraph::UnitKey;
use crate::hash::ContentHash;
use crate::ir::NodeId;
use crate::lint::Diagnostic;

/// Identity of one pass application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub unit: UnitKey,
    pub pass: String,
    /// Fingerprint of the unit's IR before the pass.
    pub input: ContentHash,
    /// Hash of pass options and dependency summaries.
    pub context: ContentHash,
}

/// Stored result of one pass application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Replacement node, `None` when the pass left the unit unchanged.
    pub output: Option<NodeId>,
    /// Fingerprint of the unit after the pass.
    pub output_fingerprint: ContentHash,
    pub diagnostics: Vec<Diagnostic>,
    pub summary: Option<serde_json::Value>,
    /// Program units the pass appended next to the unit.
    #[serde(default)]
    pub added: Vec<NodeId>,
}

/// Shared handle to one entry. `None` until computed.
pub type CacheSlot = Arc<Mutex<Option<CacheEntry>>>;

/// Hit and miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: usize,
    pub misses: usize,
}

/// Session-owned pass cache.
#[derive(Debug, Default)]
pub struct PassCache {
    entries: RwLock<HashMap<CacheKey, CacheSlot>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl PassCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the slot for `key`. Lock the slot to read or fill it.
    pub fn slot(&self, key: &CacheKey) -> CacheSlot {
        if let Some(slot) = self.entries.read().get(key) {
            return Arc::clone(slot);
        }
        let mut entries = self.entries.write();
        Arc::clone(entries.entry(key.clone()).or_default())
    }

    /// Look up a computed entry without reserving a slot.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let slot = self.entries.read().get(key).cloned()?;
        let entry = slot.lock().clone();
        entry
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop the entries of `unit` whose input the unit has moved past: all
    /// of them except `kept` and those keyed on the `current` fingerprint.
    /// Returns how many were dropped.
    pub fn evict_stale(&self, unit: &UnitKey, current: &ContentHash, kept: &CacheKey) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| key.unit != *unit || key.input == *current || key == kept);
        before - entries.len()
    }

    /// Drop all entries of one pass.
    pub fn invalidate_pass(&self, pass: &str) {
        self.entries.write().retain(|key, _| key.pass != pass);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.read().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ItemPath;
    use crate::types::SourceId;

    fn key(pass: &str, input: &str) -> CacheKey {
        key_at(0, pass, input)
    }

    fn key_at(item: usize, pass: &str, input: &str) -> CacheKey {
        CacheKey {
            unit: UnitKey::new(SourceId(0), ItemPath(vec![item])),
            pass: pass.into(),
            input: ContentHash::compute(input.as_bytes()),
            context: ContentHash::compute(b""),
        }
    }

    fn entry() -> CacheEntry {
        CacheEntry {
            output: None,
            output_fingerprint: ContentHash::compute(b"out"),
            diagnostics: Vec::new(),
            summary: None,
            added: Vec::new(),
        }
    }

    #[test]
    fn slot_is_shared_per_key() {
        let cache = PassCache::new();
        let a = cache.slot(&key("idem", "x"));
        let b = cache.slot(&key("idem", "x"));
        assert!(Arc::ptr_eq(&a, &b));
        let c = cache.slot(&key("idem", "y"));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn get_sees_filled_slots_only() {
        let cache = PassCache::new();
        let k = key("idem", "x");
        let slot = cache.slot(&k);
        assert_eq!(cache.get(&k), None);
        *slot.lock() = Some(entry());
        assert_eq!(cache.get(&k), Some(entry()));
    }

    #[test]
    fn invalidate_pass_keeps_other_passes() {
        let cache = PassCache::new();
        cache.slot(&key("a", "x"));
        cache.slot(&key("b", "x"));
        cache.invalidate_pass("a");
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn evict_stale_drops_superseded_inputs_of_one_unit() {
        let cache = PassCache::new();
        let used = key("a", "x");
        for k in [
            used.clone(),
            key("a", "w"),
            key("b", "w"),
            key("b", "y"),
            key_at(1, "a", "w"),
        ] {
            cache.slot(&k);
        }
        let current = ContentHash::compute(b"y");
        assert_eq!(cache.evict_stale(&used.unit, &current, &used), 2);
        assert_eq!(cache.stats().entries, 3);
        assert!(cache.entries.read().contains_key(&used));
        assert!(cache.entries.read().contains_key(&key("b", "y")));
        assert!(cache.entries.read().contains_key(&key_at(1, "a", "w")));
    }

    #[test]
    fn concurrent_slots_compute_once() {
        let cache = Arc::new(PassCache::new());
        let computed = Arc::new(AtomicUsize::new(0));
        let k = key("idem", "x");
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let cache = Arc::clone(&cache);
                let computed = Arc::clone(&computed);
                let k = k.clone();
                scope.spawn(move || {
                    let slot = cache.slot(&k);
                    let mut guard = slot.lock();
                    if guard.is_none() {
                        computed.fetch_add(1, Ordering::SeqCst);
                        *guard = Some(entry());
                    }
                });
            }
        });
        assert_eq!(computed.load(Ordering::SeqCst), 1);
    }
}
