//! Metadata codec for durable runtime state.
//!
//! Runtime health is projected into the credential's free-form metadata map
//! under the `_runtime_state` key, plus a flat set of top-level mirror keys
//! for back-compatible readers. Empty and zero values are removed rather than
//! written as empty strings. Hydration reads `_runtime_state` first and falls
//! back to the flat keys.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Map, Value};

use crate::auth::{Auth, Error, ModelState, QuotaState, Status, DISABLED_BY_POLICY_PREFIX};

pub const RUNTIME_STATE_METADATA_KEY: &str = "_runtime_state";

/// Project the auth's runtime state into its metadata map.
pub fn sync_runtime_state_to_metadata(auth: &mut Auth) {
    let (last_err_kind, last_err_reason, last_err_code, last_err_retryable) = match &auth.last_error
    {
        Some(err) => (
            err.code.trim().to_string(),
            err.message.trim().to_string(),
            err.http_status,
            err.retryable,
        ),
        None => (String::new(), String::new(), 0, false),
    };
    let last_err_at = auth.updated_at;

    // cooldown_until is the latest horizon across the auth and its models.
    let mut cooldown_until = auth.next_retry_after;
    let mut raise = |candidate: Option<DateTime<Utc>>| {
        if let Some(at) = candidate {
            if cooldown_until.map(|cur| at > cur).unwrap_or(true) {
                cooldown_until = Some(at);
            }
        }
    };
    raise(auth.quota.next_recover_at);
    for state in auth.model_states.values() {
        raise(state.next_retry_after);
        raise(state.quota.next_recover_at);
    }

    let mut model_states = Map::new();
    for (model, state) in &auth.model_states {
        model_states.insert(
            model.clone(),
            json!({
                "status": state.status.as_str(),
                "status_message": state.status_message.trim(),
                "unavailable": state.unavailable,
                "next_retry_after": format_runtime_time(state.next_retry_after),
                "updated_at": format_runtime_time(state.updated_at),
                "quota": encode_quota(&state.quota),
                "last_error": encode_runtime_error(state.last_error.as_ref()),
            }),
        );
    }

    auth.metadata.insert(
        RUNTIME_STATE_METADATA_KEY.to_string(),
        json!({
            "status": auth.status.as_str(),
            "status_message": auth.status_message.trim(),
            "unavailable": auth.unavailable,
            "next_retry_after": format_runtime_time(auth.next_retry_after),
            "updated_at": format_runtime_time(auth.updated_at),
            "quota": encode_quota(&auth.quota),
            "last_error": encode_runtime_error(auth.last_error.as_ref()),
            "model_states": Value::Object(model_states),
        }),
    );

    set_or_delete_string(&mut auth.metadata, "last_error_kind", &last_err_kind);
    set_or_delete_string(&mut auth.metadata, "last_error_reason", &last_err_reason);
    set_or_delete_int(&mut auth.metadata, "last_error_code", last_err_code as i64);
    set_or_delete_time(&mut auth.metadata, "last_error_at", last_err_at);
    set_or_delete_time(&mut auth.metadata, "next_retry_after", auth.next_retry_after);
    set_or_delete_time(&mut auth.metadata, "cooldown_until", cooldown_until);
    auth.metadata.insert(
        "disabled_by_policy".to_string(),
        Value::Bool(
            auth.status_message
                .trim()
                .starts_with(DISABLED_BY_POLICY_PREFIX),
        ),
    );
    auth.metadata.insert(
        "status_message".to_string(),
        Value::String(auth.status_message.trim().to_string()),
    );
    auth.metadata.insert(
        "status".to_string(),
        Value::String(auth.status.as_str().to_string()),
    );
    auth.metadata
        .insert("unavailable".to_string(), Value::Bool(auth.unavailable));
    if !last_err_kind.is_empty() || !last_err_reason.is_empty() || last_err_code > 0 || last_err_retryable
    {
        auth.metadata.insert(
            "last_error".to_string(),
            json!({
                "kind": last_err_kind,
                "reason": last_err_reason,
                "http_code": last_err_code,
                "retryable": last_err_retryable,
            }),
        );
    } else {
        auth.metadata.remove("last_error");
    }
}

/// Overlay the durable runtime state from metadata onto a freshly loaded auth.
pub fn hydrate_runtime_state_from_metadata(auth: &mut Auth) {
    let runtime_state = auth
        .metadata
        .get(RUNTIME_STATE_METADATA_KEY)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let Some(status) = runtime_state.get("status").and_then(parse_status) {
        auth.status = status;
    } else if let Some(status) = auth.metadata.get("status").and_then(parse_status) {
        auth.status = status;
    }
    let message = parse_string(runtime_state.get("status_message"));
    if !message.is_empty() {
        auth.status_message = message;
    } else {
        let flat = parse_string(auth.metadata.get("status_message"));
        if !flat.is_empty() {
            auth.status_message = flat;
        }
    }
    if let Some(unavailable) = runtime_state.get("unavailable").and_then(parse_bool) {
        auth.unavailable = unavailable;
    } else if let Some(unavailable) = auth.metadata.get("unavailable").and_then(parse_bool) {
        auth.unavailable = unavailable;
    }
    if let Some(ts) = runtime_state.get("next_retry_after").and_then(parse_time) {
        auth.next_retry_after = Some(ts);
    } else if let Some(ts) = auth.metadata.get("next_retry_after").and_then(parse_time) {
        auth.next_retry_after = Some(ts);
    }
    if let Some(ts) = runtime_state.get("updated_at").and_then(parse_time) {
        auth.updated_at = Some(ts);
    }

    if let Some(quota) = runtime_state.get("quota").and_then(Value::as_object) {
        auth.quota = decode_quota(quota);
    }
    if let Some(err) = runtime_state.get("last_error").and_then(Value::as_object) {
        auth.last_error = decode_runtime_error(err);
    } else if let Some(err) = auth.metadata.get("last_error").and_then(Value::as_object) {
        auth.last_error = decode_runtime_error(err);
    }
    if auth.last_error.is_none() {
        let kind = parse_string(auth.metadata.get("last_error_kind"));
        let reason = parse_string(auth.metadata.get("last_error_reason"));
        let code = auth
            .metadata
            .get("last_error_code")
            .and_then(parse_int)
            .unwrap_or(0);
        if !kind.is_empty() || !reason.is_empty() || code > 0 {
            auth.last_error = Some(Error::new(kind, reason, code as u16));
        }
    }

    if let Some(states) = runtime_state.get("model_states").and_then(Value::as_object) {
        for (model, raw) in states {
            let Some(state_map) = raw.as_object() else {
                continue;
            };
            let mut state = ModelState {
                status_message: parse_string(state_map.get("status_message")),
                unavailable: state_map
                    .get("unavailable")
                    .and_then(parse_bool)
                    .unwrap_or(false),
                next_retry_after: state_map.get("next_retry_after").and_then(parse_time),
                updated_at: state_map.get("updated_at").and_then(parse_time),
                ..ModelState::default()
            };
            if let Some(status) = state_map.get("status").and_then(parse_status) {
                state.status = status;
            }
            if let Some(quota) = state_map.get("quota").and_then(Value::as_object) {
                state.quota = decode_quota(quota);
            }
            if let Some(err) = state_map.get("last_error").and_then(Value::as_object) {
                state.last_error = decode_runtime_error(err);
            }
            auth.model_states.insert(model.clone(), state);
        }
    }
}

fn encode_quota(quota: &QuotaState) -> Value {
    json!({
        "exceeded": quota.exceeded,
        "reason": quota.reason.trim(),
        "next_recover_at": format_runtime_time(quota.next_recover_at),
        "backoff_level": quota.backoff_level,
    })
}

fn decode_quota(raw: &Map<String, Value>) -> QuotaState {
    QuotaState {
        exceeded: raw.get("exceeded").and_then(parse_bool).unwrap_or(false),
        reason: parse_string(raw.get("reason")),
        next_recover_at: raw.get("next_recover_at").and_then(parse_time),
        backoff_level: raw.get("backoff_level").and_then(parse_int).unwrap_or(0) as i32,
    }
}

fn encode_runtime_error(err: Option<&Error>) -> Value {
    match err {
        Some(err) => json!({
            "kind": err.code.trim(),
            "reason": err.message.trim(),
            "http_code": err.http_status,
            "retryable": err.retryable,
        }),
        None => Value::Null,
    }
}

fn decode_runtime_error(raw: &Map<String, Value>) -> Option<Error> {
    let kind = parse_string(raw.get("kind"));
    let reason = parse_string(raw.get("reason"));
    let http_code = raw.get("http_code").and_then(parse_int).unwrap_or(0);
    let retryable = raw.get("retryable").and_then(parse_bool).unwrap_or(false);
    if kind.is_empty() && reason.is_empty() && http_code == 0 && !retryable {
        return None;
    }
    let mut err = Error::new(kind, reason, http_code as u16);
    err.retryable = retryable;
    Some(err)
}

fn set_or_delete_string(metadata: &mut Map<String, Value>, key: &str, value: &str) {
    let value = value.trim();
    if value.is_empty() {
        metadata.remove(key);
    } else {
        metadata.insert(key.to_string(), Value::String(value.to_string()));
    }
}

fn set_or_delete_int(metadata: &mut Map<String, Value>, key: &str, value: i64) {
    if value == 0 {
        metadata.remove(key);
    } else {
        metadata.insert(key.to_string(), Value::Number(value.into()));
    }
}

fn set_or_delete_time(metadata: &mut Map<String, Value>, key: &str, ts: Option<DateTime<Utc>>) {
    match ts {
        Some(at) => {
            metadata.insert(
                key.to_string(),
                Value::String(at.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            );
        }
        None => {
            metadata.remove(key);
        }
    }
}

fn format_runtime_time(ts: Option<DateTime<Utc>>) -> String {
    match ts {
        Some(at) => at.to_rfc3339_opts(SecondsFormat::Nanos, true),
        None => String::new(),
    }
}

fn parse_status(value: &Value) -> Option<Status> {
    Status::parse(&parse_string(Some(value)))
}

fn parse_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            }
        }
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        _ => None,
    }
}

fn parse_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_f64().map(|f| f as i64),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse RFC3339 (with or without sub-second precision) or epoch seconds.
fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            DateTime::parse_from_rfc3339(trimmed)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        }
        Value::Number(n) => {
            let secs = n.as_i64()?;
            Utc.timestamp_opt(secs, 0).single()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn blocked_auth(now: DateTime<Utc>) -> Auth {
        let mut auth = Auth {
            id: "acct-1".into(),
            provider: "codex".into(),
            status: Status::Error,
            status_message: "quota exceeded".into(),
            unavailable: true,
            next_retry_after: Some(now + Duration::minutes(30)),
            quota: QuotaState {
                exceeded: true,
                reason: "quota_limited_5h".into(),
                next_recover_at: Some(now + Duration::minutes(30)),
                backoff_level: 1,
            },
            last_error: Some(
                Error::new("quota_limited_5h", "limit reached", 429).retryable(),
            ),
            updated_at: Some(now),
            ..Auth::default()
        };
        auth.model_states.insert(
            "gpt-5".into(),
            ModelState {
                status: Status::Error,
                unavailable: true,
                next_retry_after: Some(now + Duration::hours(5)),
                quota: QuotaState {
                    exceeded: true,
                    next_recover_at: Some(now + Duration::hours(5)),
                    backoff_level: 2,
                    ..QuotaState::default()
                },
                ..ModelState::default()
            },
        );
        auth
    }

    #[test]
    fn sync_then_hydrate_roundtrips() {
        // P9: everything that matters survives a save/reload cycle.
        let now = Utc::now();
        let mut auth = blocked_auth(now);
        sync_runtime_state_to_metadata(&mut auth);

        let mut reloaded = Auth {
            id: auth.id.clone(),
            provider: auth.provider.clone(),
            metadata: auth.metadata.clone(),
            ..Auth::default()
        };
        hydrate_runtime_state_from_metadata(&mut reloaded);

        assert_eq!(reloaded.status, Status::Error);
        assert_eq!(reloaded.status_message, "quota exceeded");
        assert!(reloaded.unavailable);
        assert_eq!(
            reloaded.next_retry_after.unwrap().timestamp_micros(),
            auth.next_retry_after.unwrap().timestamp_micros()
        );
        assert!(reloaded.quota.exceeded);
        assert_eq!(reloaded.quota.backoff_level, 1);
        assert_eq!(
            reloaded.last_error.as_ref().unwrap().code,
            "quota_limited_5h"
        );
        let model = &reloaded.model_states["gpt-5"];
        assert!(model.unavailable);
        assert_eq!(model.quota.backoff_level, 2);
        assert_eq!(
            model.next_retry_after.unwrap().timestamp_micros(),
            auth.model_states["gpt-5"]
                .next_retry_after
                .unwrap()
                .timestamp_micros()
        );
    }

    #[test]
    fn flat_mirror_keys_are_written() {
        let now = Utc::now();
        let mut auth = blocked_auth(now);
        sync_runtime_state_to_metadata(&mut auth);

        assert_eq!(auth.metadata["last_error_kind"], "quota_limited_5h");
        assert_eq!(auth.metadata["last_error_code"], 429);
        assert_eq!(auth.metadata["status"], "error");
        assert_eq!(auth.metadata["unavailable"], true);
        assert_eq!(auth.metadata["disabled_by_policy"], false);
        assert!(auth.metadata.contains_key("next_retry_after"));
        // cooldown_until is the model horizon (5h), not the auth one (30m).
        let cooldown = auth.metadata["cooldown_until"].as_str().unwrap();
        let parsed = DateTime::parse_from_rfc3339(cooldown).unwrap();
        assert!(parsed.with_timezone(&Utc) > now + Duration::hours(4));
    }

    #[test]
    fn empty_values_are_removed_not_written() {
        let mut auth = Auth {
            id: "acct-1".into(),
            status: Status::Active,
            ..Auth::default()
        };
        auth.metadata
            .insert("last_error_kind".into(), Value::String("stale".into()));
        auth.metadata
            .insert("next_retry_after".into(), Value::String("stale".into()));
        sync_runtime_state_to_metadata(&mut auth);

        assert!(!auth.metadata.contains_key("last_error_kind"));
        assert!(!auth.metadata.contains_key("next_retry_after"));
        assert!(!auth.metadata.contains_key("last_error"));
    }

    #[test]
    fn hydrate_falls_back_to_flat_keys() {
        let mut auth = Auth::default();
        auth.metadata
            .insert("status".into(), Value::String("error".into()));
        auth.metadata
            .insert("unavailable".into(), Value::String("true".into()));
        auth.metadata.insert(
            "next_retry_after".into(),
            Value::String("2031-01-02T03:04:05Z".into()),
        );
        auth.metadata
            .insert("last_error_kind".into(), Value::String("unauthorized".into()));
        auth.metadata
            .insert("last_error_code".into(), Value::Number(401.into()));

        hydrate_runtime_state_from_metadata(&mut auth);
        assert_eq!(auth.status, Status::Error);
        assert!(auth.unavailable);
        assert!(auth.next_retry_after.is_some());
        assert_eq!(auth.last_error.as_ref().unwrap().http_status, 401);
    }

    #[test]
    fn parse_time_accepts_epoch_seconds() {
        let parsed = parse_time(&Value::Number(1_771_331_564.into())).unwrap();
        assert_eq!(parsed.timestamp(), 1_771_331_564);
    }

    #[test]
    fn parse_bool_accepts_string_and_number() {
        assert_eq!(parse_bool(&Value::String("true".into())), Some(true));
        assert_eq!(parse_bool(&Value::String("0".into())), Some(false));
        assert_eq!(parse_bool(&Value::Number(1.into())), Some(true));
        assert_eq!(parse_bool(&Value::String("maybe".into())), None);
    }

    #[test]
    fn disabled_by_policy_flag_follows_message_prefix() {
        let mut auth = Auth {
            disabled: true,
            status: Status::Disabled,
            status_message: "disabled_by_policy:account_deactivated".into(),
            ..Auth::default()
        };
        sync_runtime_state_to_metadata(&mut auth);
        assert_eq!(auth.metadata["disabled_by_policy"], true);
    }
}
