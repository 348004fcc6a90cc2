//! Upstream error classification.
//!
//! Normalizes raw upstream failures into the closed [`ErrorKind`] taxonomy
//! plus a retry-after hint and a fatal flag. Selector cooling and the disable
//! policy consume the result; nothing downstream re-parses upstream bodies.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde_json::{Map, Value};

use crate::auth::{Error, ErrorKind};

const NETWORK_RETRY_AFTER: Duration = Duration::from_secs(15);

/// Body substrings that identify transport-level failures when no HTTP
/// response was received.
const NETWORK_HINTS: &[&str] = &[
    "connection refused",
    "connection reset",
    "dial tcp",
    "timeout",
    "tls",
    "no such host",
    "temporary failure",
    "eof",
    "network is unreachable",
    "context deadline exceeded",
    "proxyconnect",
];

/// Reasons on a 401/403 that mean the account itself is gone, not just the
/// request.
const DEACTIVATION_HINTS: &[&str] = &[
    "account deactivated",
    "workspace deactivated",
    "account banned",
    "account suspended",
    "subscription inactive",
    "token revoked",
    "token invalidated",
    "token_invalidated",
    "authentication token has been invalidated",
    "user disabled",
];

static DURATION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*(d|h|m|s)\b").expect("duration pattern"));
static AFTER_SECONDS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"after\s+(\d+)\s*seconds?").expect("after-seconds pattern"));

/// Outcome of classifying one upstream failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub reason: String,
    pub retry_after: Option<Duration>,
    pub fatal: bool,
}

/// Classify an upstream error, optionally seeded with a transport-level
/// retry-after hint (e.g. a `Retry-After` response header).
pub fn classify(err: &Error, retry_after_hint: Option<Duration>) -> Classification {
    classify_at(err, retry_after_hint, Utc::now())
}

/// [`classify`] with an explicit clock, for deterministic tests of
/// epoch-timestamp reset keys.
pub fn classify_at(
    err: &Error,
    retry_after_hint: Option<Duration>,
    now: DateTime<Utc>,
) -> Classification {
    let status = err.http_status;
    let message = err.message.trim();
    let reason = extract_error_reason(message);
    let lower_reason = reason.to_lowercase();
    let lower_message = message.to_lowercase();

    // Already-classified errors are adopted unchanged.
    let pre_classified = ErrorKind::normalize(&err.code);
    if pre_classified != ErrorKind::Unknown {
        return Classification {
            kind: pre_classified,
            reason,
            retry_after: retry_after_hint,
            fatal: pre_classified.is_fatal(),
        };
    }

    if status == 0 && looks_like_network_error(&lower_message) {
        return Classification {
            kind: ErrorKind::NetworkError,
            reason,
            retry_after: Some(NETWORK_RETRY_AFTER),
            fatal: false,
        };
    }

    match status {
        429 => {
            let effective = retry_after_hint.or_else(|| parse_retry_after_hint(message, now));
            let kind = classify_quota_kind(effective, &lower_message);
            Classification {
                kind,
                reason,
                retry_after: effective,
                fatal: false,
            }
        }
        401 => {
            if is_deactivation_reason(&lower_reason) {
                Classification {
                    kind: ErrorKind::AccountDeactivated,
                    reason,
                    retry_after: None,
                    fatal: true,
                }
            } else {
                Classification {
                    kind: ErrorKind::Unauthorized,
                    reason,
                    retry_after: None,
                    fatal: false,
                }
            }
        }
        402 => Classification {
            kind: ErrorKind::WorkspaceDeactivated,
            reason,
            retry_after: None,
            fatal: true,
        },
        403 => {
            if is_deactivation_reason(&lower_reason) {
                Classification {
                    kind: ErrorKind::AccountDeactivated,
                    reason,
                    retry_after: None,
                    fatal: true,
                }
            } else {
                Classification {
                    kind: ErrorKind::Forbidden,
                    reason,
                    retry_after: None,
                    fatal: false,
                }
            }
        }
        408 | 500 | 502 | 503 | 504 => Classification {
            kind: ErrorKind::TransientUpstream,
            reason,
            retry_after: None,
            fatal: false,
        },
        _ => {
            if looks_like_network_error(&lower_message) {
                Classification {
                    kind: ErrorKind::NetworkError,
                    reason,
                    retry_after: Some(NETWORK_RETRY_AFTER),
                    fatal: false,
                }
            } else {
                Classification {
                    kind: ErrorKind::Unknown,
                    reason,
                    retry_after: retry_after_hint,
                    fatal: false,
                }
            }
        }
    }
}

/// Bucket a 429 into the 7d/5h/base quota kinds.
///
/// The horizon thresholds are slightly shortened (15m / 5m) because upstream
/// reset clocks report the remainder of the window, not its full length.
fn classify_quota_kind(retry_after: Option<Duration>, lower_message: &str) -> ErrorKind {
    if let Some(delay) = retry_after {
        if delay >= Duration::from_secs(7 * 24 * 3600 - 15 * 60) {
            return ErrorKind::QuotaLimited7d;
        }
        if delay >= Duration::from_secs(5 * 3600 - 5 * 60) {
            return ErrorKind::QuotaLimited5h;
        }
    }
    if lower_message.contains("7d")
        || lower_message.contains("7 day")
        || lower_message.contains("weekly")
    {
        return ErrorKind::QuotaLimited7d;
    }
    if lower_message.contains("5h")
        || lower_message.contains("5 hour")
        || lower_message.contains("session")
    {
        return ErrorKind::QuotaLimited5h;
    }
    ErrorKind::QuotaLimited
}

/// Parse a retry-after hint out of a 429 body: structured JSON first,
/// substring heuristics second.
fn parse_retry_after_hint(message: &str, now: DateTime<Utc>) -> Option<Duration> {
    if let Some(from_json) = parse_retry_after_from_json(message, now) {
        return Some(from_json);
    }

    let msg = message.to_lowercase();
    if msg.is_empty() {
        return None;
    }

    if msg.contains("7d") || msg.contains("7 day") || msg.contains("7-day") {
        return Some(Duration::from_secs(7 * 24 * 3600));
    }
    if msg.contains("5h") || msg.contains("5 hour") || msg.contains("5-hour") {
        return Some(Duration::from_secs(5 * 3600));
    }

    let mut total = Duration::ZERO;
    for caps in DURATION_PATTERN.captures_iter(&msg) {
        let Ok(value) = caps[1].parse::<u64>() else {
            continue;
        };
        if value == 0 {
            continue;
        }
        total += match &caps[2] {
            "d" => Duration::from_secs(value * 24 * 3600),
            "h" => Duration::from_secs(value * 3600),
            "m" => Duration::from_secs(value * 60),
            _ => Duration::from_secs(value),
        };
    }
    if total > Duration::ZERO {
        return Some(total);
    }

    if let Some(caps) = AFTER_SECONDS_PATTERN.captures(&msg) {
        if let Ok(seconds) = caps[1].parse::<u64>() {
            if seconds > 0 {
                return Some(Duration::from_secs(seconds));
            }
        }
    }

    None
}

fn parse_retry_after_from_json(message: &str, now: DateTime<Utc>) -> Option<Duration> {
    let trimmed = message.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let payload: Map<String, Value> = serde_json::from_str(trimmed).ok()?;

    if let Some(delay) = retry_after_from_node(&payload, now) {
        return Some(delay);
    }
    for key in ["error", "detail"] {
        if let Some(node) = payload.get(key).and_then(Value::as_object) {
            if let Some(delay) = retry_after_from_node(node, now) {
                return Some(delay);
            }
        }
    }
    None
}

/// Recognized reset keys in provider payloads, e.g.
/// `{"error":{"resets_in_seconds":260750}}`, `{"error":{"resets_at":1771331564}}`,
/// `{"detail":{"retry_after_seconds":300}}`.
fn retry_after_from_node(node: &Map<String, Value>, now: DateTime<Utc>) -> Option<Duration> {
    const SECONDS_KEYS: &[&str] = &[
        "resets_in_seconds",
        "retry_after_seconds",
        "retry_in_seconds",
        "reset_in_seconds",
    ];
    const TIMESTAMP_KEYS: &[&str] = &["resets_at", "reset_at", "retry_after_at", "retry_at"];

    for key in SECONDS_KEYS {
        if let Some(seconds) = node.get(*key).and_then(numeric_value) {
            if seconds > 0.0 {
                if let Ok(delay) = Duration::try_from_secs_f64(seconds) {
                    return Some(delay);
                }
            }
        }
    }

    for key in TIMESTAMP_KEYS {
        if let Some(ts) = node.get(*key).and_then(numeric_value) {
            if ts > 0.0 {
                let recover_at = Utc.timestamp_opt(ts as i64, 0).single()?;
                let delay = recover_at - now;
                if delay > chrono::Duration::zero() {
                    return delay.to_std().ok();
                }
            }
        }
    }

    if let Some(seconds) = node.get("retry_after").and_then(numeric_value) {
        if seconds > 0.0 {
            if let Ok(delay) = Duration::try_from_secs_f64(seconds) {
                return Some(delay);
            }
        }
    }

    for key in ["error", "detail"] {
        if let Some(nested) = node.get(key).and_then(Value::as_object) {
            if let Some(delay) = retry_after_from_node(nested, now) {
                return Some(delay);
            }
        }
    }

    None
}

fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn looks_like_network_error(lower_message: &str) -> bool {
    if lower_message.is_empty() {
        return false;
    }
    NETWORK_HINTS
        .iter()
        .any(|hint| lower_message.contains(hint))
}

fn is_deactivation_reason(lower_reason: &str) -> bool {
    if lower_reason.is_empty() {
        return false;
    }
    DEACTIVATION_HINTS
        .iter()
        .any(|hint| lower_reason.contains(hint))
}

/// Structured reason extraction: `error.message`, `error.code`, top-level
/// `message`, falling back to the raw trimmed string.
pub fn extract_error_reason(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let Ok(payload) = serde_json::from_str::<Map<String, Value>>(trimmed) else {
        return trimmed.to_string();
    };
    if let Some(err_node) = payload.get("error").and_then(Value::as_object) {
        if let Some(msg) = err_node.get("message").and_then(Value::as_str) {
            if !msg.trim().is_empty() {
                return msg.trim().to_string();
            }
        }
        if let Some(code) = err_node.get("code").and_then(Value::as_str) {
            if !code.trim().is_empty() {
                return code.trim().to_string();
            }
        }
    }
    if let Some(msg) = payload.get("message").and_then(Value::as_str) {
        if !msg.trim().is_empty() {
            return msg.trim().to_string();
        }
    }
    trimmed.to_string()
}
