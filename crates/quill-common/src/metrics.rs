//! In-process event meters.
//!
//! Operational counters are kept in a small registry keyed by
//! `{domain, operation, outcome}`, e.g. `{history, download-ledger,
//! success}`. Tests read the counters back to assert exactly how much work
//! an operation performed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Outcome dimension of a meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

/// Registry of monotonically increasing event counters.
///
/// Cloning is cheap; all clones share the same counters.
#[derive(Clone, Default)]
pub struct MeterRegistry {
    counters: Arc<Mutex<HashMap<(String, String, &'static str), u64>>>,
}

impl MeterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark one event on the `{domain, name, outcome}` meter.
    pub fn mark(&self, domain: &str, name: &str, outcome: Outcome) {
        self.mark_by(domain, name, outcome, 1);
    }

    /// Mark `count` events at once.
    pub fn mark_by(&self, domain: &str, name: &str, outcome: Outcome, count: u64) {
        if count == 0 {
            return;
        }
        let mut counters = self.counters.lock();
        *counters
            .entry((domain.to_string(), name.to_string(), outcome.as_str()))
            .or_insert(0) += count;
    }

    /// Current count of the `{domain, name, outcome}` meter.
    pub fn count(&self, domain: &str, name: &str, outcome: Outcome) -> u64 {
        self.counters
            .lock()
            .get(&(domain.to_string(), name.to_string(), outcome.as_str()))
            .copied()
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for MeterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counters = self.counters.lock();
        f.debug_map()
            .entries(counters.iter().map(|((d, n, o), v)| {
                (format!("{d}.{n}.{o}"), v)
            }))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_count() {
        let meters = MeterRegistry::new();
        assert_eq!(meters.count("history", "publish", Outcome::Success), 0);

        meters.mark("history", "publish", Outcome::Success);
        meters.mark_by("history", "publish", Outcome::Success, 2);
        meters.mark("history", "publish", Outcome::Failure);

        assert_eq!(meters.count("history", "publish", Outcome::Success), 3);
        assert_eq!(meters.count("history", "publish", Outcome::Failure), 1);
    }

    #[test]
    fn test_clones_share_counters() {
        let meters = MeterRegistry::new();
        let clone = meters.clone();
        clone.mark("history", "download-bucket", Outcome::Success);
        assert_eq!(meters.count("history", "download-bucket", Outcome::Success), 1);
    }

    #[test]
    fn test_mark_by_zero_is_noop() {
        let meters = MeterRegistry::new();
        meters.mark_by("history", "verify-ledger", Outcome::Success, 0);
        assert_eq!(meters.count("history", "verify-ledger", Outcome::Success), 0);
    }
}
