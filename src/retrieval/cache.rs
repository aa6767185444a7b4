//! Two-layer query cache: exact canonical-form lookup plus a semantic
//! layer over cached query embeddings. Both layers live behind one
//! mutex and share the capacity policy.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use crate::vector;

use super::RetrievedChunk;

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_SEMANTIC_THRESHOLD: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheHit {
    Exact,
    Semantic,
}

pub struct QueryCache {
    capacity: usize,
    semantic_threshold: f64,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    exact: HashMap<String, Vec<RetrievedChunk>>,
    exact_order: VecDeque<String>,
    semantic: VecDeque<(Vec<f32>, Vec<RetrievedChunk>)>,
}

pub fn canonicalize(query: &str) -> String {
    query.trim().to_lowercase()
}

impl QueryCache {
    pub fn new(capacity: usize, semantic_threshold: f64) -> Self {
        Self {
            capacity: capacity.max(1),
            semantic_threshold,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Layer 1 first (canonical key), then a linear scan of cached
    /// query embeddings.
    pub fn lookup(
        &self,
        canonical: &str,
        embedding: &[f32],
    ) -> Option<(CacheHit, Vec<RetrievedChunk>)> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(results) = inner.exact.get(canonical) {
            return Some((CacheHit::Exact, results.clone()));
        }

        if !embedding.is_empty() {
            for (cached_embedding, results) in &inner.semantic {
                if vector::cosine_similarity(embedding, cached_embedding) > self.semantic_threshold
                {
                    return Some((CacheHit::Semantic, results.clone()));
                }
            }
        }

        None
    }

    pub fn insert(&self, canonical: &str, embedding: &[f32], results: &[RetrievedChunk]) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if inner.exact.insert(canonical.to_string(), results.to_vec()).is_none() {
            inner.exact_order.push_back(canonical.to_string());
        }
        while inner.exact.len() > self.capacity {
            match inner.exact_order.pop_front() {
                Some(oldest) => {
                    inner.exact.remove(&oldest);
                }
                None => break,
            }
        }

        if !embedding.is_empty() {
            inner.semantic.push_back((embedding.to_vec(), results.to_vec()));
            while inner.semantic.len() > self.capacity {
                inner.semantic.pop_front();
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.exact.clear();
        inner.exact_order.clear();
        inner.semantic.clear();
    }

    #[cfg(test)]
    fn exact_len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .exact
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: i64) -> Vec<RetrievedChunk> {
        vec![RetrievedChunk {
            id,
            ..RetrievedChunk::default()
        }]
    }

    #[test]
    fn exact_hit_after_canonicalization() {
        let cache = QueryCache::new(10, DEFAULT_SEMANTIC_THRESHOLD);
        cache.insert(&canonicalize("  What IS a Cache? "), &[1.0, 0.0], &result(1));

        let (hit, results) = cache
            .lookup(&canonicalize("what is a cache?"), &[0.0, 1.0])
            .expect("hit");
        assert_eq!(hit, CacheHit::Exact);
        assert_eq!(results[0].id, 1);
    }

    #[test]
    fn semantic_hit_above_threshold() {
        let cache = QueryCache::new(10, 0.95);
        cache.insert("cache eviction", &[1.0, 0.0], &result(2));

        // cos ≈ 0.995
        let (hit, results) = cache
            .lookup("evicting caches", &[0.995, 0.1])
            .expect("hit");
        assert_eq!(hit, CacheHit::Semantic);
        assert_eq!(results[0].id, 2);

        // cos ≈ 0.707 stays a miss.
        assert!(cache.lookup("unrelated", &[0.7, 0.7]).is_none());
    }

    #[test]
    fn eviction_respects_capacity() {
        let cache = QueryCache::new(DEFAULT_CAPACITY, DEFAULT_SEMANTIC_THRESHOLD);
        for i in 0..(DEFAULT_CAPACITY + 20) {
            cache.insert(&format!("query {i}"), &[], &result(i as i64));
        }
        assert_eq!(cache.exact_len(), DEFAULT_CAPACITY);
        // Oldest entries fall out first.
        assert!(cache.lookup("query 0", &[]).is_none());
        assert!(cache.lookup("query 119", &[]).is_some());
    }

    #[test]
    fn reinsert_same_key_does_not_grow_order() {
        let cache = QueryCache::new(2, DEFAULT_SEMANTIC_THRESHOLD);
        cache.insert("a", &[], &result(1));
        cache.insert("a", &[], &result(2));
        cache.insert("b", &[], &result(3));
        assert_eq!(cache.exact_len(), 2);
        let (_, results) = cache.lookup("a", &[]).expect("hit");
        assert_eq!(results[0].id, 2, "reinsert refreshes the value");
    }

    #[test]
    fn clear_empties_both_layers() {
        let cache = QueryCache::new(10, 0.95);
        cache.insert("a", &[1.0, 0.0], &result(1));
        cache.clear();
        assert!(cache.lookup("a", &[1.0, 0.0]).is_none());
    }
}
