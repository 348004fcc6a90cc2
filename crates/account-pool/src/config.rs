//! Manager configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default egress mapping state file, relative to the working directory.
pub const DEFAULT_EGRESS_STATE_FILE: &str = ".runtime-cache/state/egress-mapping.json";

/// Pool behavior knobs, swappable at runtime via `Manager::set_config`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Permanently disable accounts on fatal classifications
    /// (account/workspace deactivated).
    pub disable_fatal_accounts: bool,
    /// When enabled, auths with an empty proxy URL are excluded from
    /// selection.
    pub account_proxy_constraint: bool,
    pub egress: EgressConfig,
    pub streaming: StreamingConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            disable_fatal_accounts: true,
            account_proxy_constraint: false,
            egress: EgressConfig::default(),
            streaming: StreamingConfig::default(),
        }
    }
}

/// Egress determinism tracking settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    pub enabled: bool,
    pub state_file: PathBuf,
    /// Accounts alert once their drift count reaches this value; values <= 0
    /// normalize to 1.
    pub drift_alert_threshold: i32,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            state_file: PathBuf::from(DEFAULT_EGRESS_STATE_FILE),
            drift_alert_threshold: 1,
        }
    }
}

impl EgressConfig {
    pub fn normalized_threshold(&self) -> u32 {
        if self.drift_alert_threshold <= 0 {
            1
        } else {
            self.drift_alert_threshold as u32
        }
    }
}

/// Server-side streaming behavior.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// How many times a streaming request may be re-dispatched before any
    /// payload byte has been delivered downstream. 0 disables bootstrap
    /// retries.
    pub bootstrap_retries: u32,
}

/// Dispatch retry settings.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Upper bound for any single retry wait.
    pub max_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_wait: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_fatal_disable_policy() {
        let cfg = ManagerConfig::default();
        assert!(cfg.disable_fatal_accounts);
        assert!(!cfg.account_proxy_constraint);
        assert!(!cfg.egress.enabled);
        assert_eq!(cfg.streaming.bootstrap_retries, 0);
    }

    #[test]
    fn egress_threshold_normalizes_non_positive() {
        let mut cfg = EgressConfig::default();
        cfg.drift_alert_threshold = 0;
        assert_eq!(cfg.normalized_threshold(), 1);
        cfg.drift_alert_threshold = -5;
        assert_eq!(cfg.normalized_threshold(), 1);
        cfg.drift_alert_threshold = 3;
        assert_eq!(cfg.normalized_threshold(), 3);
    }
}
