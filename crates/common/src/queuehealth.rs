//! Process-wide queue health counters.
//!
//! Named saturation counters incremented by queueing components when they
//! shed or delay work (full subscriber channels, full session queues). The
//! management surface serves a snapshot so operators can tell back-pressure
//! apart from upstream failures.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use serde::Serialize;

/// Snapshot of all queue health counters.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub counters: HashMap<String, i64>,
}

static COUNTERS: LazyLock<RwLock<HashMap<String, i64>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Increment a counter by one. Empty reasons are ignored.
pub fn inc(reason: &str) {
    add(reason, 1);
}

/// Add a delta to a counter. Empty reasons and zero deltas are ignored.
pub fn add(reason: &str, delta: i64) {
    if reason.is_empty() || delta == 0 {
        return;
    }
    let mut counters = COUNTERS.write().expect("queuehealth lock poisoned");
    *counters.entry(reason.to_string()).or_insert(0) += delta;
}

/// Current value of a counter (zero when never incremented).
pub fn get(reason: &str) -> i64 {
    let counters = COUNTERS.read().expect("queuehealth lock poisoned");
    counters.get(reason).copied().unwrap_or(0)
}

/// Copy of all counters.
pub fn snapshot_all() -> Snapshot {
    let counters = COUNTERS.read().expect("queuehealth lock poisoned");
    Snapshot {
        counters: counters.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_and_get_roundtrip() {
        inc("test_inc_and_get");
        inc("test_inc_and_get");
        assert!(get("test_inc_and_get") >= 2);
    }

    #[test]
    fn add_ignores_zero_delta() {
        let before = get("test_add_zero");
        add("test_add_zero", 0);
        assert_eq!(get("test_add_zero"), before);
    }

    #[test]
    fn empty_reason_is_ignored() {
        inc("");
        assert_eq!(get(""), 0);
    }

    #[test]
    fn snapshot_contains_incremented_counter() {
        add("test_snapshot_counter", 3);
        let snap = snapshot_all();
        assert!(snap.counters["test_snapshot_counter"] >= 3);
    }
}
