//! Operator-injected drill faults.
//!
//! Small counter map of pre-armed synthetic failures used to exercise
//! error-handling paths in production. `proxy-failure` fails the request
//! fast without penalizing the picked account; `account-quota-exhausted`
//! applies a synthetic 429 penalty and lets dispatch continue to the next
//! candidate.

use std::collections::HashMap;
use std::sync::Mutex;

use credential::Error;

pub const SCENARIO_PROXY_FAILURE: &str = "proxy-failure";
pub const SCENARIO_ACCOUNT_QUOTA_EXHAUSTED: &str = "account-quota-exhausted";

/// Normalize an operator-supplied scenario name. The scenario set is closed;
/// anything else is rejected.
pub fn normalize_scenario(raw: &str) -> Option<&'static str> {
    match raw.trim().to_lowercase().as_str() {
        SCENARIO_PROXY_FAILURE => Some(SCENARIO_PROXY_FAILURE),
        SCENARIO_ACCOUNT_QUOTA_EXHAUSTED => Some(SCENARIO_ACCOUNT_QUOTA_EXHAUSTED),
        _ => None,
    }
}

/// Pre-armed fault counters.
#[derive(Debug, Default)]
pub struct DrillFaults {
    remaining: Mutex<HashMap<&'static str, u32>>,
}

impl DrillFaults {
    /// Arm `count` more faults for the scenario; returns the remaining count.
    pub fn apply(&self, scenario: &str, count: u32) -> Result<u32, Error> {
        let Some(normalized) = normalize_scenario(scenario) else {
            return Err(Error::new(
                "unsupported_scenario",
                format!("unsupported scenario: {}", scenario.trim()),
                400,
            ));
        };
        let count = count.max(1);
        let mut remaining = self.remaining.lock().expect("drill lock poisoned");
        let entry = remaining.entry(normalized).or_insert(0);
        *entry += count;
        Ok(*entry)
    }

    /// Remaining counts per armed scenario.
    pub fn snapshot(&self) -> HashMap<String, u32> {
        let remaining = self.remaining.lock().expect("drill lock poisoned");
        remaining
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(scenario, count)| (scenario.to_string(), *count))
            .collect()
    }

    /// Atomically consume one armed fault; false when none remain.
    pub fn consume(&self, scenario: &str) -> bool {
        let mut remaining = self.remaining.lock().expect("drill lock poisoned");
        match remaining.get_mut(scenario) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    remaining.remove(scenario);
                }
                true
            }
            _ => false,
        }
    }
}

/// The injected fail-fast error for `proxy-failure`.
pub fn proxy_failure_error() -> Error {
    Error::new(
        "proxy_failure_injected",
        "internal drill injected proxy failure",
        502,
    )
    .retryable()
}

/// The injected quota error for `account-quota-exhausted`.
pub fn quota_exhausted_error() -> Error {
    Error::new(
        "quota_exhausted_injected",
        "internal drill injected account quota exhaustion",
        429,
    )
    .retryable()
}
