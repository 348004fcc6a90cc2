//! Cooldown policy.
//!
//! Translates a classified failure into the auth's runtime state: retry
//! horizon with the 30-minute floor, quota block bookkeeping, and the
//! fatal-disable policy. Success clears blocks but never re-enables a
//! policy-disabled auth.

use std::time::Duration;

use chrono::{DateTime, Utc};
use credential::{
    classify, Auth, Classification, Error, ErrorKind, Status, DISABLED_BY_POLICY_PREFIX,
};
use tracing::{info, warn};

/// Minimum cooldown applied to any non-fatal, non-network failure.
pub const MIN_COOLDOWN: Duration = Duration::from_secs(30 * 60);

/// Short cooldown for transport failures; network recovery is fast.
pub const NETWORK_COOLDOWN: Duration = Duration::from_secs(15);

/// Apply a failed result to the auth. Targets the model state when a model
/// name is present (canonicalized), the auth-level fields otherwise.
pub fn apply_failure(
    auth: &mut Auth,
    model: &str,
    err: &Error,
    disable_fatal_accounts: bool,
    now: DateTime<Utc>,
) -> Classification {
    let classification = classify(err, err.retry_after);
    let kind = classification.kind;

    let next_retry_after = if classification.fatal {
        None
    } else if kind == ErrorKind::NetworkError {
        Some(now + chrono_duration(NETWORK_COOLDOWN))
    } else {
        let hint = classification.retry_after.unwrap_or(Duration::ZERO);
        Some(now + chrono_duration(hint.max(MIN_COOLDOWN)))
    };

    // Keep an explicit upstream code (e.g. an injected drill fault); stamp
    // the classified kind only when none was supplied.
    let mut stored_error = err.clone();
    if stored_error.code.trim().is_empty() {
        stored_error.code = kind.as_str().to_string();
    }
    stored_error.retryable = !classification.fatal;

    let status_message = if classification.reason.is_empty() {
        kind.as_str().to_string()
    } else {
        format!("{}: {}", kind.as_str(), classification.reason)
    };

    let model = model.trim();
    if model.is_empty() {
        auth.status = Status::Error;
        auth.status_message = status_message;
        auth.unavailable = true;
        auth.next_retry_after = next_retry_after;
        auth.last_error = Some(stored_error.clone());
        if kind.is_quota() {
            auth.quota.exceeded = true;
            auth.quota.reason = kind.as_str().to_string();
            auth.quota.next_recover_at = next_retry_after;
            auth.quota.backoff_level += 1;
        }
    } else {
        let state = auth.model_state_mut(model);
        state.status = Status::Error;
        state.status_message = status_message;
        state.unavailable = true;
        state.next_retry_after = next_retry_after;
        state.updated_at = Some(now);
        state.last_error = Some(stored_error.clone());
        if kind.is_quota() {
            state.quota.exceeded = true;
            state.quota.reason = kind.as_str().to_string();
            state.quota.next_recover_at = next_retry_after;
            state.quota.backoff_level += 1;
        }
    }
    auth.updated_at = Some(now);

    if classification.fatal && disable_fatal_accounts {
        let message = format!("{DISABLED_BY_POLICY_PREFIX}{kind}");
        warn!(
            auth_id = %auth.id,
            kind = %kind,
            "fatal classification, disabling account by policy"
        );
        auth.disabled = true;
        auth.status = Status::Disabled;
        auth.status_message = message.clone();
        auth.unavailable = true;
        auth.next_retry_after = None;
        for state in auth.model_states.values_mut() {
            state.status = Status::Disabled;
            state.status_message = message.clone();
            state.unavailable = true;
            state.next_retry_after = None;
            state.updated_at = Some(now);
        }
    }

    classification
}

/// Apply a successful result: clear blocks and mark the auth active, unless
/// it is disabled.
pub fn apply_success(auth: &mut Auth, model: &str, now: DateTime<Utc>) {
    if auth.disabled || auth.status == Status::Disabled {
        // Policy- or management-disabled auths stay down until explicitly
        // re-enabled.
        return;
    }
    auth.status = Status::Active;
    auth.status_message.clear();
    auth.unavailable = false;
    auth.next_retry_after = None;
    auth.quota.exceeded = false;
    auth.quota.reason.clear();
    auth.quota.next_recover_at = None;
    auth.last_error = None;
    auth.updated_at = Some(now);

    let model = model.trim();
    if !model.is_empty() {
        let state = auth.model_state_mut(model);
        if state.status != Status::Disabled {
            state.status = Status::Active;
            state.status_message.clear();
            state.unavailable = false;
            state.next_retry_after = None;
            state.quota.exceeded = false;
            state.quota.reason.clear();
            state.quota.next_recover_at = None;
            state.last_error = None;
            state.updated_at = Some(now);
        }
    }
    info!(auth_id = %auth.id, model, "account healthy again");
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 4))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn auth() -> Auth {
        Auth {
            id: "acct-1".into(),
            provider: "codex".into(),
            status: Status::Active,
            ..Auth::default()
        }
    }

    fn upstream(status: u16, message: &str) -> Error {
        Error::new("", message, status)
    }

    #[test]
    fn cooldown_floor_is_thirty_minutes() {
        // P1: every quota/unauthorized/forbidden/transient/unknown failure
        // cools down at least 30 minutes.
        let now = Utc::now();
        for (status, message) in [
            (429u16, r#"{"error":{"resets_in_seconds":10}}"#),
            (401, "nope"),
            (403, "forbidden"),
            (500, "boom"),
            (418, "odd"),
        ] {
            let mut a = auth();
            apply_failure(&mut a, "", &upstream(status, message), true, now);
            let horizon = a.next_retry_after.expect("horizon set");
            assert!(
                horizon >= now + ChronoDuration::minutes(30),
                "status {status} horizon too short"
            );
            assert!(a.unavailable);
            assert_eq!(a.status, Status::Error);
        }
    }

    #[test]
    fn longer_hint_extends_past_floor() {
        let now = Utc::now();
        let mut a = auth();
        apply_failure(
            &mut a,
            "",
            &upstream(429, r#"{"error":{"resets_in_seconds":18000}}"#),
            true,
            now,
        );
        let horizon = a.next_retry_after.unwrap();
        assert!(horizon >= now + ChronoDuration::seconds(17990));
        assert!(a.quota.exceeded);
        assert_eq!(a.quota.backoff_level, 1);
        // Invariant 2: the retry horizon covers the quota horizon.
        assert!(a.next_retry_after.unwrap() >= a.quota.next_recover_at.unwrap());
    }

    #[test]
    fn network_error_cools_fifteen_seconds() {
        let now = Utc::now();
        let mut a = auth();
        apply_failure(&mut a, "", &upstream(0, "connection refused"), true, now);
        let horizon = a.next_retry_after.unwrap();
        assert!(horizon <= now + ChronoDuration::seconds(16));
        assert!(horizon > now + ChronoDuration::seconds(10));
    }

    #[test]
    fn model_failure_lands_on_canonical_state() {
        let now = Utc::now();
        let mut a = auth();
        apply_failure(
            &mut a,
            "gpt-5(high)",
            &upstream(429, "rate limited"),
            true,
            now,
        );
        let state = &a.model_states["gpt-5"];
        assert!(state.unavailable);
        assert!(state.quota.exceeded);
        assert_eq!(state.last_error.as_ref().unwrap().code, "quota_limited");
        // Auth-level fields untouched.
        assert!(!a.unavailable);
    }

    #[test]
    fn fatal_disables_auth_and_all_model_states() {
        let now = Utc::now();
        let mut a = auth();
        a.model_states.insert("m1".into(), Default::default());
        let body = r#"{"error":{"code":"token_invalidated","message":"Your authentication token has been invalidated."}}"#;
        let classification = apply_failure(&mut a, "m2", &upstream(401, body), true, now);

        assert!(classification.fatal);
        assert!(a.disabled);
        assert_eq!(a.status, Status::Disabled);
        assert!(a.next_retry_after.is_none(), "disabled has no horizon");
        assert_eq!(
            a.status_message,
            "disabled_by_policy:account_deactivated"
        );
        for state in a.model_states.values() {
            assert_eq!(state.status, Status::Disabled);
            assert!(state.status_message.starts_with(DISABLED_BY_POLICY_PREFIX));
        }
        assert!(a.model_states.contains_key("m2"));
    }

    #[test]
    fn fatal_without_policy_keeps_auth_enabled() {
        let now = Utc::now();
        let mut a = auth();
        let classification =
            apply_failure(&mut a, "", &upstream(402, "payment required"), false, now);
        assert!(classification.fatal);
        assert!(!a.disabled);
        assert_eq!(a.status, Status::Error);
    }

    #[test]
    fn success_clears_blocks() {
        let now = Utc::now();
        let mut a = auth();
        apply_failure(&mut a, "gpt-5", &upstream(429, "limit"), true, now);
        apply_failure(&mut a, "", &upstream(500, "boom"), true, now);

        apply_success(&mut a, "gpt-5", now);
        assert_eq!(a.status, Status::Active);
        assert!(!a.unavailable);
        assert!(!a.quota.exceeded);
        assert!(a.last_error.is_none());
        let state = &a.model_states["gpt-5"];
        assert!(!state.unavailable);
        assert!(!state.quota.exceeded);
    }

    #[test]
    fn success_never_reenables_policy_disabled_auth() {
        let now = Utc::now();
        let mut a = auth();
        apply_failure(&mut a, "", &upstream(402, "payment required"), true, now);
        assert!(a.disabled);

        apply_success(&mut a, "", now);
        assert!(a.disabled);
        assert_eq!(a.status, Status::Disabled);
        assert!(a.status_message.starts_with(DISABLED_BY_POLICY_PREFIX));
    }

    #[test]
    fn stored_error_code_carries_the_kind() {
        let now = Utc::now();
        let mut a = auth();
        apply_failure(&mut a, "", &upstream(503, "unavailable"), true, now);
        assert_eq!(a.last_error.as_ref().unwrap().code, "transient_upstream");
    }
}
