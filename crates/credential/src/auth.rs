//! Credential runtime state model.
//!
//! Runtime transitions:
//! - active → error (classified upstream failure, cooldown horizon set)
//! - error → active (success after the horizon elapsed)
//! - any → disabled (fatal classification under the disable policy)
//! - disabled → (management re-enable only; never by success or refresh)

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::canonical_model;

/// Status message prefix that marks a policy-induced disable. An auth whose
/// message carries this prefix must never be re-enabled by success or refresh.
pub const DISABLED_BY_POLICY_PREFIX: &str = "disabled_by_policy:";

/// Lifecycle status of an auth or a per-model state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Unknown,
    Active,
    Error,
    Disabled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Active => "active",
            Status::Error => "error",
            Status::Disabled => "disabled",
        }
    }

    /// Parse a persisted status label. Unrecognized labels return `None` so
    /// hydration can fall back to the next source.
    pub fn parse(raw: &str) -> Option<Status> {
        match raw.trim() {
            "unknown" => Some(Status::Unknown),
            "active" => Some(Status::Active),
            "error" => Some(Status::Error),
            "disabled" => Some(Status::Disabled),
            _ => None,
        }
    }
}

/// Normalized machine-readable failure category used by selector cooling and
/// disable policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    QuotaLimited5h,
    QuotaLimited7d,
    QuotaLimited,
    Unauthorized,
    WorkspaceDeactivated,
    Forbidden,
    TransientUpstream,
    NetworkError,
    AccountDeactivated,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::QuotaLimited5h => "quota_limited_5h",
            ErrorKind::QuotaLimited7d => "quota_limited_7d",
            ErrorKind::QuotaLimited => "quota_limited",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::WorkspaceDeactivated => "workspace_deactivated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::TransientUpstream => "transient_upstream",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::AccountDeactivated => "account_deactivated",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Normalize a raw code into a kind. Anything outside the closed set maps
    /// to `Unknown`.
    pub fn normalize(raw: &str) -> ErrorKind {
        match raw.trim().to_ascii_lowercase().as_str() {
            "quota_limited_5h" => ErrorKind::QuotaLimited5h,
            "quota_limited_7d" => ErrorKind::QuotaLimited7d,
            "quota_limited" => ErrorKind::QuotaLimited,
            "unauthorized" => ErrorKind::Unauthorized,
            "workspace_deactivated" => ErrorKind::WorkspaceDeactivated,
            "forbidden" => ErrorKind::Forbidden,
            "transient_upstream" => ErrorKind::TransientUpstream,
            "network_error" => ErrorKind::NetworkError,
            "account_deactivated" => ErrorKind::AccountDeactivated,
            _ => ErrorKind::Unknown,
        }
    }

    /// Fatal kinds permanently disable the account under the disable policy.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::AccountDeactivated | ErrorKind::WorkspaceDeactivated
        )
    }

    pub fn is_quota(&self) -> bool {
        matches!(
            self,
            ErrorKind::QuotaLimited | ErrorKind::QuotaLimited5h | ErrorKind::QuotaLimited7d
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream error with its HTTP projection.
///
/// `code` holds an [`ErrorKind`] label once the error has been classified;
/// `message` keeps the raw upstream text, which may itself be JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Error {
    pub code: String,
    pub message: String,
    pub http_status: u16,
    pub retryable: bool,
    /// Horizon carried by synthetic cooldown errors for the `Retry-After`
    /// header. Not persisted.
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl Error {
    pub fn new(code: impl Into<String>, message: impl Into<String>, http_status: u16) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            http_status,
            retryable: false,
            retry_after: None,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Transport-level failure with no HTTP response.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new("", message, 0).retryable()
    }

    /// HTTP status to project outward. Errors without a response surface as
    /// 502 so clients see a gateway failure rather than a bare 0.
    pub fn status_code(&self) -> u16 {
        if self.http_status == 0 {
            502
        } else {
            self.http_status
        }
    }

    /// Headers to project outward alongside the status line.
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(retry_after) = self.retry_after {
            headers.push((
                "Content-Type".to_string(),
                "application/json".to_string(),
            ));
            headers.push((
                "Retry-After".to_string(),
                retry_after.as_secs().to_string(),
            ));
        }
        headers
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.code)
        } else {
            f.write_str(&self.message)
        }
    }
}

impl std::error::Error for Error {}

/// Quota exhaustion block on an auth or model state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaState {
    pub exceeded: bool,
    pub reason: String,
    pub next_recover_at: Option<DateTime<Utc>>,
    pub backoff_level: i32,
}

impl QuotaState {
    /// Whether the quota block is still holding at `now`.
    pub fn active(&self, now: DateTime<Utc>) -> bool {
        self.exceeded && self.next_recover_at.map(|at| at > now).unwrap_or(true)
    }
}

/// Per-(auth, canonical model) runtime health. Lazily created on the first
/// result for that model and never implicitly destroyed; an elapsed horizon
/// is simply observed as non-blocking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelState {
    pub status: Status,
    pub status_message: String,
    pub unavailable: bool,
    pub next_retry_after: Option<DateTime<Utc>>,
    pub quota: QuotaState,
    pub last_error: Option<Error>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A single upstream credential with its durable runtime state.
#[derive(Debug, Clone, Default)]
pub struct Auth {
    pub id: String,
    pub provider: String,
    pub label: String,
    /// Opaque pointer to the backing store entry.
    pub file_name: String,
    pub disabled: bool,
    pub status: Status,
    pub status_message: String,
    pub proxy_url: String,
    /// Structured configuration (api_key, base_url, priority, custom headers).
    pub attributes: HashMap<String, String>,
    /// Free-form bag; durable runtime state and OAuth tokens live here.
    pub metadata: Map<String, Value>,
    pub unavailable: bool,
    pub next_retry_after: Option<DateTime<Utc>>,
    pub quota: QuotaState,
    pub last_error: Option<Error>,
    pub updated_at: Option<DateTime<Utc>>,
    pub model_states: HashMap<String, ModelState>,
}

impl Auth {
    /// Selection priority from `attributes["priority"]`; absent or malformed
    /// values default to 0.
    pub fn priority(&self) -> i32 {
        self.attributes
            .get("priority")
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Model state for `model`, falling back to the canonical base name when
    /// the exact name has no entry.
    pub fn model_state(&self, model: &str) -> Option<&ModelState> {
        if model.is_empty() {
            return None;
        }
        if let Some(state) = self.model_states.get(model) {
            return Some(state);
        }
        let base = canonical_model(model);
        if base != model {
            return self.model_states.get(base);
        }
        None
    }

    /// Mutable model state for the canonical base of `model`, created on
    /// first use.
    pub fn model_state_mut(&mut self, model: &str) -> &mut ModelState {
        let key = canonical_model(model).to_string();
        self.model_states.entry(key).or_default()
    }

    /// Whether the disable was induced by a fatal classification.
    pub fn is_policy_disabled(&self) -> bool {
        self.status_message
            .trim()
            .starts_with(DISABLED_BY_POLICY_PREFIX)
    }

    /// String attribute lookup, trimmed; `None` when absent or blank.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// String metadata lookup, trimmed; `None` when absent or blank.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// Recompute the auth-level availability flag after mutations.
///
/// A disabled auth is pinned unavailable with no recovery horizon. An auth
/// whose horizon and quota block have both elapsed is observed as available
/// again without an explicit transition.
pub fn update_aggregated_availability(auth: &mut Auth, now: DateTime<Utc>) {
    if auth.disabled || auth.status == Status::Disabled {
        auth.disabled = true;
        auth.status = Status::Disabled;
        auth.unavailable = true;
        auth.next_retry_after = None;
        return;
    }
    let horizon_active = auth.next_retry_after.map(|at| at > now).unwrap_or(false);
    let quota_active = auth.quota.exceeded
        && auth
            .quota
            .next_recover_at
            .map(|at| at > now)
            .unwrap_or(false);
    if auth.unavailable && !horizon_active && !quota_active {
        auth.unavailable = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn error_kind_normalize_roundtrip() {
        for kind in [
            ErrorKind::QuotaLimited5h,
            ErrorKind::QuotaLimited7d,
            ErrorKind::QuotaLimited,
            ErrorKind::Unauthorized,
            ErrorKind::WorkspaceDeactivated,
            ErrorKind::Forbidden,
            ErrorKind::TransientUpstream,
            ErrorKind::NetworkError,
            ErrorKind::AccountDeactivated,
        ] {
            assert_eq!(ErrorKind::normalize(kind.as_str()), kind);
        }
        assert_eq!(ErrorKind::normalize("nonsense"), ErrorKind::Unknown);
        assert_eq!(ErrorKind::normalize("  Unauthorized "), ErrorKind::Unauthorized);
    }

    #[test]
    fn fatal_kinds_are_the_deactivation_pair() {
        assert!(ErrorKind::AccountDeactivated.is_fatal());
        assert!(ErrorKind::WorkspaceDeactivated.is_fatal());
        assert!(!ErrorKind::QuotaLimited7d.is_fatal());
        assert!(!ErrorKind::Unauthorized.is_fatal());
    }

    #[test]
    fn error_status_code_maps_zero_to_bad_gateway() {
        assert_eq!(Error::network("connection refused").status_code(), 502);
        assert_eq!(Error::new("unauthorized", "", 401).status_code(), 401);
    }

    #[test]
    fn error_headers_carry_retry_after() {
        let err = Error::new("model_cooldown", "{}", 429)
            .with_retry_after(Duration::from_secs(60));
        let headers = err.headers();
        assert!(headers.contains(&("Retry-After".to_string(), "60".to_string())));
        assert!(headers
            .iter()
            .any(|(k, v)| k == "Content-Type" && v == "application/json"));
    }

    #[test]
    fn model_state_falls_back_to_canonical_base() {
        let mut auth = Auth::default();
        auth.model_states
            .insert("gpt-5".to_string(), ModelState::default());
        assert!(auth.model_state("gpt-5(high)").is_some());
        assert!(auth.model_state("gpt-5").is_some());
        assert!(auth.model_state("other").is_none());
    }

    #[test]
    fn model_state_mut_keys_by_canonical_base() {
        let mut auth = Auth::default();
        auth.model_state_mut("gpt-5(high)").unavailable = true;
        assert!(auth.model_states.contains_key("gpt-5"));
        assert!(!auth.model_states.contains_key("gpt-5(high)"));
    }

    #[test]
    fn aggregated_availability_clears_elapsed_horizon() {
        let now = Utc::now();
        let mut auth = Auth {
            unavailable: true,
            next_retry_after: Some(now - ChronoDuration::seconds(10)),
            ..Auth::default()
        };
        update_aggregated_availability(&mut auth, now);
        assert!(!auth.unavailable);
    }

    #[test]
    fn aggregated_availability_pins_disabled() {
        let now = Utc::now();
        let mut auth = Auth {
            disabled: true,
            status: Status::Disabled,
            next_retry_after: Some(now + ChronoDuration::hours(1)),
            ..Auth::default()
        };
        update_aggregated_availability(&mut auth, now);
        assert!(auth.unavailable);
        assert!(auth.next_retry_after.is_none(), "disabled has no horizon");
    }

    #[test]
    fn policy_disabled_detection_uses_prefix() {
        let mut auth = Auth::default();
        auth.status_message = "disabled_by_policy:account_deactivated".into();
        assert!(auth.is_policy_disabled());
        auth.status_message = "quota exceeded".into();
        assert!(!auth.is_policy_disabled());
    }

    #[test]
    fn priority_defaults_to_zero() {
        let mut auth = Auth::default();
        assert_eq!(auth.priority(), 0);
        auth.attributes.insert("priority".into(), "7".into());
        assert_eq!(auth.priority(), 7);
        auth.attributes.insert("priority".into(), "abc".into());
        assert_eq!(auth.priority(), 0);
    }
}
