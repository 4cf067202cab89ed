use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::report::Report;
use crate::types::StatType;

/// Every argument of a report query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub system: String,
    pub start: Option<String>,
    pub end: Option<String>,
    pub stat_type: StatType,
    pub limit: usize,
}

/// Short-lived LRU of finished reports. A capacity or TTL of zero disables it.
pub struct ReportCache {
    inner: Option<Mutex<lru::LruCache<CacheKey, (Instant, Arc<Report>)>>>,
    ttl: Duration,
}

impl ReportCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let inner = match NonZeroUsize::new(capacity) {
            Some(cap) if !ttl.is_zero() => Some(Mutex::new(lru::LruCache::new(cap))),
            _ => None,
        };
        Self { inner, ttl }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<Report>> {
        let mut cache = self.inner.as_ref()?.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = cache
            .get(key)
            .map(|(stored_at, report)| (stored_at.elapsed() < self.ttl, Arc::clone(report)));
        match entry {
            Some((true, report)) => Some(report),
            Some((false, _)) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: CacheKey, report: Arc<Report>) {
        if let Some(inner) = &self.inner {
            let mut cache = inner.lock().unwrap_or_else(PoisonError::into_inner);
            cache.put(key, (Instant::now(), report));
        }
    }

    /// Drop every cached report for `system`. Returns how many were dropped.
    pub fn invalidate_system(&self, system: &str) -> usize {
        let Some(inner) = &self.inner else {
            return 0;
        };
        let mut cache = inner.lock().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<CacheKey> = cache
            .iter()
            .filter(|(k, _)| k.system == system)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            cache.pop(key);
        }
        stale.len()
    }

    pub fn clear(&self) {
        if let Some(inner) = &self.inner {
            inner.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .as_ref()
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
