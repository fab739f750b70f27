//! Evaluation Cache
//!
//! Memoizes evaluated snapshots by the content hash of their raw facts.
//! Evaluation is pure, so a hit is always equivalent to recomputing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::evaluator::{evaluate_with_digest, fact_digest};
use super::types::{PostureSnapshot, RawFacts};

/// Bounded snapshot memo with oldest-first eviction
pub struct EvaluationCache {
    inner: RwLock<CacheInner>,
    max_size: usize,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, Arc<PostureSnapshot>>,
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
}

impl EvaluationCache {
    pub fn new() -> Self {
        Self::with_capacity(128)
    }

    /// A capacity of zero disables memoization
    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            max_size,
        }
    }

    /// Return the cached snapshot for these facts, evaluating on a miss
    pub fn evaluate(&self, facts: &RawFacts) -> Arc<PostureSnapshot> {
        let digest = fact_digest(facts);

        if self.max_size == 0 {
            return Arc::new(evaluate_with_digest(facts, digest));
        }

        if let Ok(inner) = self.inner.read() {
            if let Some(snapshot) = inner.entries.get(&digest) {
                let snapshot = Arc::clone(snapshot);
                drop(inner);
                if let Ok(mut inner) = self.inner.write() {
                    inner.hits += 1;
                }
                debug!(digest = %digest, "Evaluation cache hit");
                return snapshot;
            }
        }

        let snapshot = Arc::new(evaluate_with_digest(facts, digest.clone()));

        // A poisoned lock only costs us memoization
        if let Ok(mut inner) = self.inner.write() {
            inner.misses += 1;
            if !inner.entries.contains_key(&digest) {
                if inner.order.len() >= self.max_size {
                    if let Some(oldest) = inner.order.pop_front() {
                        inner.entries.remove(&oldest);
                    }
                }
                inner.order.push_back(digest.clone());
                inner.entries.insert(digest, Arc::clone(&snapshot));
            }
        }

        snapshot
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        self.inner
            .read()
            .map(|i| (i.hits, i.misses))
            .unwrap_or((0, 0))
    }
}

impl Default for EvaluationCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::posture::types::Table;

    fn facts(n: usize) -> RawFacts {
        RawFacts {
            tables: (0..n)
                .map(|i| Table::new(format!("t{}", i), i % 2 == 0))
                .collect(),
            users: vec![],
            auth_enabled: true,
        }
    }

    #[test]
    fn test_hit_returns_same_snapshot() {
        let cache = EvaluationCache::with_capacity(4);
        let a = cache.evaluate(&facts(3));
        let b = cache.evaluate(&facts(3));

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.stats(), (1, 1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicts_oldest_entry() {
        let cache = EvaluationCache::with_capacity(2);
        let first = cache.evaluate(&facts(1));
        cache.evaluate(&facts(2));
        cache.evaluate(&facts(3));
        assert_eq!(cache.len(), 2);

        let again = cache.evaluate(&facts(1));
        assert!(!Arc::ptr_eq(&first, &again));
        assert_eq!(*first, *again);
    }

    #[test]
    fn test_zero_capacity_disables_memo() {
        let cache = EvaluationCache::with_capacity(0);
        let a = cache.evaluate(&facts(2));
        let b = cache.evaluate(&facts(2));
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(cache.is_empty());
        assert_eq!(a, b);
    }
}
