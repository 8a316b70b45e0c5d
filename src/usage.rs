use std::collections::HashMap;
use std::sync::RwLock;

use crate::{Result, RouterError};

/// Token counters for one credential, keyed by upstream model name.
///
/// One ledger lives inside each credential, so contention is bounded to the
/// requests sharing that credential; the critical section is a single map
/// update.
#[derive(Debug, Default)]
pub struct UsageLedger {
    counts: RwLock<HashMap<String, i64>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attributes `delta` tokens to `model`. Negative deltas are refused;
    /// counters only grow.
    pub fn add(&self, model: &str, delta: i64) -> Result<()> {
        if delta < 0 {
            return Err(RouterError::InvalidArgument(format!(
                "usage delta must be non-negative, got {delta}"
            )));
        }
        let mut counts = self.counts.write().unwrap_or_else(|e| e.into_inner());
        let slot = counts.entry(model.to_string()).or_insert(0);
        *slot = slot.saturating_add(delta);
        Ok(())
    }

    /// Tokens attributed to `model` so far; 0 if never incremented.
    pub fn get(&self, model: &str) -> i64 {
        self.counts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(model)
            .copied()
            .unwrap_or(0)
    }
}
