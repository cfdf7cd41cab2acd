use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::debug;

use super::{parse, CompiledFormula};
use crate::FeeEngineResult;

/// Compiled formulas kept by a cache built with [`FormulaCache::new`].
pub const DEFAULT_CAPACITY: usize = 1024;

/// Memoizes compiled formulas by expression text, least recently used
/// evicted first once `capacity` is reached.
///
/// On a miss the expression is compiled outside the lock and inserted if
/// absent, so two threads compiling the same text both end up holding the
/// first tree that landed.
#[derive(Debug)]
pub struct FormulaCache {
    entries: Mutex<LruCache<String, Arc<CompiledFormula>>>,
}

impl Default for FormulaCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl FormulaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A zero capacity is treated as one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        FormulaCache {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get_or_compile(&self, expression: &str) -> FeeEngineResult<Arc<CompiledFormula>> {
        if let Some(hit) = self.get(expression) {
            return Ok(hit);
        }

        let compiled = Arc::new(parse(expression)?);
        debug!(expression, "compiled formula");

        let mut entries = self.lock();
        if let Some(existing) = entries.get(expression) {
            return Ok(Arc::clone(existing));
        }
        if let Some((evicted, _)) = entries.push(expression.to_string(), Arc::clone(&compiled)) {
            if evicted != expression {
                debug!(expression = %evicted, "evicted compiled formula");
            }
        }
        Ok(compiled)
    }

    /// Cached tree for `expression`, marking it most recently used.
    pub fn get(&self, expression: &str) -> Option<Arc<CompiledFormula>> {
        self.lock().get(expression).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, Arc<CompiledFormula>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
