//! Call counting for work closures.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Counts invocations per key. Clones share the same counts.
#[derive(Debug, Clone, Default)]
pub struct CallCounter {
    calls: Arc<Mutex<HashMap<String, usize>>>,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&self, key: impl Into<String>) {
        *self.calls.lock().entry(key.into()).or_default() += 1;
    }

    pub fn count(&self, key: &str) -> usize {
        self.calls.lock().get(key).copied().unwrap_or(0)
    }

    /// Calls across every key.
    pub fn total(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn keys(&self) -> usize {
        self.calls.lock().len()
    }
}
