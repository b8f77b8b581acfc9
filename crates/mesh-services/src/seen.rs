//! Bounded duplicate-suppression cache for message and file ids.
//!
//! Holds at most `capacity` ids; the least recently seen id is evicted first.
//! An id older than `window` counts as unseen again. Within both bounds an id
//! is accepted exactly once.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;

pub struct SeenCache {
    ids: Mutex<LruCache<String, Instant>>,
    window: Duration,
}

impl SeenCache {
    pub fn new(capacity: usize, window: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ids: Mutex::new(LruCache::new(capacity)),
            window,
        }
    }

    /// Record `id`. Returns true if it was not already present, i.e. the
    /// caller is the one that gets to process it.
    pub fn check_and_insert(&self, id: &str) -> bool {
        self.check_and_insert_at(id, Instant::now())
    }

    pub fn check_and_insert_at(&self, id: &str, now: Instant) -> bool {
        let mut ids = self.lock();
        if let Some(seen_at) = ids.get(id) {
            if now.saturating_duration_since(*seen_at) <= self.window {
                return false;
            }
        }
        ids.put(id.to_string(), now);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock()
            .peek(id)
            .is_some_and(|seen_at| seen_at.elapsed() <= self.window)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, Instant>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
