//! In-process record of side effects already performed.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const DEFAULT_CAPACITY: usize = 10_000;

/// Bounded set of natural keys whose side effect has run.
///
/// A key is claimed before the effect and released if the effect fails, so
/// only a successful effect is remembered. When full, the oldest key is
/// forgotten. The record is lost on restart; collaborators receive the same
/// key and can deduplicate beyond that.
#[derive(Debug)]
pub struct ProcessedKeys {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl Default for ProcessedKeys {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ProcessedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The set stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `false` when the key was already claimed.
    pub fn claim(&self, key: &str) -> bool {
        let mut inner = self.lock();
        if !inner.keys.insert(key.to_string()) {
            return false;
        }
        inner.order.push_back(key.to_string());
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.keys.remove(&oldest);
            }
        }
        true
    }

    pub fn release(&self, key: &str) {
        let mut inner = self.lock();
        if inner.keys.remove(key) {
            inner.order.retain(|k| k != key);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
