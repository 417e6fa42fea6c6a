//! Per-view compiled statement cache.

use std::{collections::HashSet, sync::Arc};

use lru::LruCache;

use crate::{compiler::Fingerprint, unit::CompiledQuery};

pub const DEFAULT_STATEMENT_CACHE_SIZE: usize = 100;

#[derive(Debug, Clone)]
struct Entry {
    /// Schema version the entry was compiled under.
    dbver: u64,
    query: Arc<CompiledQuery>,
}

/// Bounded insertion-ordered mapping with LRU promotion on access.
///
/// Not thread safe; owned by a single connection view. Eviction is manual
/// (`needs_cleanup`/`cleanup_one`) so the caller controls when the work
/// happens, and a side-set of keys marked by DDL is dropped wholesale at
/// the next DDL commit boundary.
#[derive(Debug)]
pub struct StatementsCache {
    cache: LruCache<Fingerprint, Entry>,
    maxsize: usize,
    remove_on_ddl: HashSet<Fingerprint>,
}

impl StatementsCache {
    pub fn new(maxsize: usize) -> StatementsCache {
        StatementsCache {
            cache: LruCache::unbounded(),
            maxsize,
            remove_on_ddl: HashSet::new(),
        }
    }

    /// Look up a compiled query, promoting it to most-recently-used.
    ///
    /// Entries compiled under an older schema version are stale: they are
    /// dropped on sight and reported as a miss.
    pub fn get(&mut self, key: &Fingerprint, current_dbver: u64) -> Option<Arc<CompiledQuery>> {
        let entry = self.cache.get(key)?;
        if entry.dbver == current_dbver {
            return Some(entry.query.clone());
        }
        self.cache.pop(key);
        self.remove_on_ddl.remove(key);
        None
    }

    pub fn insert(&mut self, key: Fingerprint, dbver: u64, query: Arc<CompiledQuery>) {
        self.cache.put(key, Entry { dbver, query });
    }

    /// Record a key to evict at the next DDL commit boundary.
    pub fn add_to_remove_on_ddl(&mut self, key: Fingerprint) {
        self.remove_on_ddl.insert(key);
    }

    /// Evict everything recorded by
    /// [`add_to_remove_on_ddl`][StatementsCache::add_to_remove_on_ddl].
    pub fn apply_ddl_evictions(&mut self) {
        for key in self.remove_on_ddl.drain() {
            self.cache.pop(&key);
        }
    }

    pub fn needs_cleanup(&self) -> bool {
        self.cache.len() > self.maxsize
    }

    /// Evict the least-recently-used entry.
    pub fn cleanup_one(&mut self) {
        if let Some((key, _)) = self.cache.pop_lru() {
            self.remove_on_ddl.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::unit::QueryUnitGroup;

    fn fpr(source: &str) -> Fingerprint {
        crate::compiler::CompileRequest::new(source, "default").fingerprint()
    }

    fn query() -> Arc<CompiledQuery> {
        Arc::new(CompiledQuery::new(Arc::new(QueryUnitGroup::new())))
    }

    #[test]
    fn lru_on_access() {
        let mut cache = StatementsCache::new(2);
        let (a, b, c) = (fpr("a"), fpr("b"), fpr("c"));
        cache.insert(a, 1, query());
        cache.insert(b, 1, query());
        cache.insert(c, 1, query());

        assert!(cache.needs_cleanup());
        // touch `a` so `b` becomes least recently used
        assert!(cache.get(&a, 1).is_some());
        cache.cleanup_one();
        assert!(!cache.needs_cleanup());
        assert!(cache.get(&b, 1).is_none());
        assert!(cache.get(&a, 1).is_some());
        assert!(cache.get(&c, 1).is_some());
    }

    #[test]
    fn stale_dbver_is_a_miss() {
        let mut cache = StatementsCache::new(4);
        let key = fpr("select 1");
        cache.insert(key, 1, query());
        assert!(cache.get(&key, 1).is_some());
        assert!(cache.get(&key, 2).is_none());
        // dropped, not just hidden
        assert!(cache.is_empty());
    }

    #[test]
    fn ddl_eviction_set() {
        let mut cache = StatementsCache::new(4);
        let (a, b) = (fpr("a"), fpr("b"));
        cache.insert(a, 1, query());
        cache.insert(b, 1, query());
        cache.add_to_remove_on_ddl(a);

        cache.apply_ddl_evictions();
        assert!(cache.get(&a, 1).is_none());
        assert!(cache.get(&b, 1).is_some());

        // set is drained, a re-inserted entry survives the next boundary
        cache.insert(a, 1, query());
        cache.apply_ddl_evictions();
        assert!(cache.get(&a, 1).is_some());
    }
}
