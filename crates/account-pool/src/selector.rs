//! Selection strategies.
//!
//! Both strategies share the same pre-pick: walk the candidates once,
//! bucketing available auths by priority and remembering the earliest
//! cooldown horizon among blocked ones. When everything is cooling down the
//! pick surfaces a `model_cooldown` error that projects to HTTP 429 with a
//! `Retry-After` header so clients can back off intelligently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use credential::{canonical_model, Auth, Error, Status};
use executor::{Options, SESSION_AFFINITY_KEY};
use serde_json::json;

/// How long a session stays pinned to an auth without activity.
pub const SESSION_AFFINITY_TTL_SECS: i64 = 30 * 60;

/// Cursor map cap; exceeding it resets the whole map.
pub const MAX_CURSOR_KEYS: usize = 4096;

/// Pick an auth for `(provider, model)` out of the candidate set.
///
/// Implementations are synchronous: blocking work (upstream calls, disk)
/// never happens inside a pick.
pub trait Selector: Send + Sync {
    fn pick(
        &self,
        provider: &str,
        model: &str,
        opts: &Options,
        auths: &[Auth],
        now: DateTime<Utc>,
    ) -> Result<Auth, Error>;
}

#[derive(Debug, Clone)]
struct AffinityBinding {
    auth_id: String,
    expires_at: DateTime<Utc>,
}

/// Session → auth pin map with self-expiring entries.
///
/// Constructible per manager; a process-wide default exists as a convenience
/// for single-manager binaries.
#[derive(Default)]
pub struct SessionAffinity {
    bindings: Mutex<HashMap<String, AffinityBinding>>,
}

impl SessionAffinity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared process-wide instance.
    pub fn default_shared() -> Arc<SessionAffinity> {
        static SHARED: OnceLock<Arc<SessionAffinity>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(SessionAffinity::new())).clone()
    }

    fn load(&self, key: &str, now: DateTime<Utc>) -> Option<String> {
        if key.is_empty() {
            return None;
        }
        let mut bindings = self.bindings.lock().expect("affinity lock poisoned");
        bindings.retain(|_, binding| binding.expires_at > now);
        bindings.get(key).map(|binding| binding.auth_id.clone())
    }

    fn store(&self, key: &str, auth_id: &str, now: DateTime<Utc>) {
        if key.is_empty() || auth_id.trim().is_empty() {
            return;
        }
        let mut bindings = self.bindings.lock().expect("affinity lock poisoned");
        bindings.retain(|_, binding| binding.expires_at > now);
        bindings.insert(
            key.to_string(),
            AffinityBinding {
                auth_id: auth_id.to_string(),
                expires_at: now + chrono::Duration::seconds(SESSION_AFFINITY_TTL_SECS),
            },
        );
    }

    #[cfg(test)]
    pub(crate) fn reset(&self) {
        self.bindings.lock().expect("affinity lock poisoned").clear();
    }
}

fn affinity_key(provider: &str, model: &str, opts: &Options) -> Option<String> {
    let session = opts.metadata_str(SESSION_AFFINITY_KEY)?;
    Some(format!("{provider}|{}|{session}", canonical_model(model)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockReason {
    Cooldown,
    Disabled,
    Other,
}

/// Whether `auth` is blocked for `model` at `now`, with the block reason and
/// the recovery horizon for cooldowns.
fn is_auth_blocked_for_model(
    auth: &Auth,
    model: &str,
    now: DateTime<Utc>,
) -> Option<(BlockReason, Option<DateTime<Utc>>)> {
    if auth.disabled || auth.status == Status::Disabled {
        return Some((BlockReason::Disabled, None));
    }
    if !model.is_empty() {
        if let Some(state) = auth.model_state(model) {
            if state.status == Status::Disabled {
                return Some((BlockReason::Disabled, None));
            }
            if state.unavailable {
                // A zero horizon means the state needs re-evaluation, not a
                // block.
                let Some(retry_at) = state.next_retry_after else {
                    return None;
                };
                if retry_at > now {
                    let mut next = retry_at;
                    if let Some(recover_at) = state.quota.next_recover_at {
                        if recover_at > now {
                            next = recover_at;
                        }
                    }
                    let reason = if state.quota.exceeded {
                        BlockReason::Cooldown
                    } else {
                        BlockReason::Other
                    };
                    return Some((reason, Some(next.max(now))));
                }
            }
        }
        return None;
    }
    if auth.unavailable {
        if let Some(retry_at) = auth.next_retry_after {
            if retry_at > now {
                let mut next = retry_at;
                if let Some(recover_at) = auth.quota.next_recover_at {
                    if recover_at > now {
                        next = recover_at;
                    }
                }
                let reason = if auth.quota.exceeded {
                    BlockReason::Cooldown
                } else {
                    BlockReason::Other
                };
                return Some((reason, Some(next.max(now))));
            }
        }
    }
    None
}

/// Available candidates for the pick, sorted by id within the winning
/// priority bucket.
fn get_available_auths<'a>(
    auths: &'a [Auth],
    provider: &str,
    model: &str,
    now: DateTime<Utc>,
) -> Result<Vec<&'a Auth>, Error> {
    if auths.is_empty() {
        return Err(Error::new("auth_not_found", "no auth candidates", 404));
    }

    let mut available_by_priority: HashMap<i32, Vec<&Auth>> = HashMap::new();
    let mut cooldown_count = 0usize;
    let mut earliest: Option<DateTime<Utc>> = None;

    for candidate in auths {
        match is_auth_blocked_for_model(candidate, model, now) {
            None => {
                available_by_priority
                    .entry(candidate.priority())
                    .or_default()
                    .push(candidate);
            }
            Some((BlockReason::Cooldown, next)) => {
                cooldown_count += 1;
                if let Some(next) = next {
                    if earliest.map(|cur| next < cur).unwrap_or(true) {
                        earliest = Some(next);
                    }
                }
            }
            Some(_) => {}
        }
    }

    if available_by_priority.is_empty() {
        if cooldown_count == auths.len() {
            if let Some(earliest) = earliest {
                let provider_for_error = if provider == "mixed" { "" } else { provider };
                let reset_in = (earliest - now).to_std().unwrap_or(Duration::ZERO);
                return Err(model_cooldown_error(model, provider_for_error, reset_in));
            }
        }
        return Err(Error::new("auth_unavailable", "no auth available", 503));
    }

    let best_priority = available_by_priority.keys().copied().max().unwrap_or(0);
    let mut available = available_by_priority.remove(&best_priority).unwrap_or_default();
    if available.len() > 1 {
        available.sort_by(|a, b| a.id.cmp(&b.id));
    }
    Ok(available)
}

/// Build the 429 cooldown error: JSON envelope body, `Retry-After` and
/// content-type headers via the error's HTTP projection. `provider` is
/// omitted from the envelope when empty (mixed-provider dispatch).
pub fn model_cooldown_error(model: &str, provider: &str, reset_in: Duration) -> Error {
    let model_name = if model.is_empty() {
        "requested model"
    } else {
        model
    };
    let mut message = format!("All credentials for model {model_name} are cooling down");
    if !provider.is_empty() {
        message = format!("{message} via provider {provider}");
    }
    let reset_seconds = reset_in.as_secs_f64().ceil().max(0.0) as u64;
    let display = if reset_in > Duration::ZERO && reset_in < Duration::from_secs(1) {
        Duration::from_secs(1)
    } else {
        Duration::from_secs(reset_seconds)
    };

    let mut error_body = json!({
        "code": "model_cooldown",
        "message": message,
        "model": model,
        "reset_time": format_duration(display),
        "reset_seconds": reset_seconds,
    });
    if !provider.is_empty() {
        error_body["provider"] = json!(provider);
    }
    let payload = json!({ "error": error_body });

    Error::new("model_cooldown", payload.to_string(), 429)
        .with_retry_after(Duration::from_secs(reset_seconds))
}

/// Compact duration rendering for the cooldown envelope ("1h30m0s", "45s").
fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Sticky round-robin: keep the current account until it is unavailable,
/// then advance deterministically to the next id in sorted order, wrapping
/// around.
pub struct RoundRobinSelector {
    affinity: Arc<SessionAffinity>,
    cursors: Mutex<HashMap<String, String>>,
    max_keys: usize,
}

impl RoundRobinSelector {
    pub fn new(affinity: Arc<SessionAffinity>) -> Self {
        Self {
            affinity,
            cursors: Mutex::new(HashMap::new()),
            max_keys: MAX_CURSOR_KEYS,
        }
    }

    #[cfg(test)]
    fn with_max_keys(affinity: Arc<SessionAffinity>, max_keys: usize) -> Self {
        Self {
            affinity,
            cursors: Mutex::new(HashMap::new()),
            max_keys,
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new(SessionAffinity::default_shared())
    }
}

impl Selector for RoundRobinSelector {
    fn pick(
        &self,
        provider: &str,
        model: &str,
        opts: &Options,
        auths: &[Auth],
        now: DateTime<Utc>,
    ) -> Result<Auth, Error> {
        let available = get_available_auths(auths, provider, model, now)?;
        let cursor_key = format!("{provider}:{}", canonical_model(model));
        let affinity_key = affinity_key(provider, model, opts);

        if let Some(key) = affinity_key.as_deref() {
            if let Some(pinned_id) = self.affinity.load(key, now) {
                if let Some(pinned) = available.iter().find(|a| a.id == pinned_id) {
                    let mut cursors = self.cursors.lock().expect("cursor lock poisoned");
                    cursors.insert(cursor_key, pinned.id.clone());
                    drop(cursors);
                    self.affinity.store(key, &pinned.id, now);
                    return Ok((*pinned).clone());
                }
            }
        }

        let selected = {
            let mut cursors = self.cursors.lock().expect("cursor lock poisoned");
            let has_cursor = cursors.contains_key(&cursor_key);
            if !has_cursor && cursors.len() >= self.max_keys {
                cursors.clear();
            }
            let last_selected = cursors.get(&cursor_key).cloned().unwrap_or_default();

            let mut selected: &Auth = available[0];
            if !last_selected.is_empty() {
                if let Some(current) = available.iter().copied().find(|a| a.id == last_selected) {
                    selected = current;
                } else {
                    // Previous credential is no longer available: advance to
                    // the next id in sorted order, wrapping around.
                    selected = available
                        .iter()
                        .copied()
                        .find(|a| a.id > last_selected)
                        .unwrap_or(available[0]);
                }
            }
            cursors.insert(cursor_key, selected.id.clone());
            selected.clone()
        };

        if let Some(key) = affinity_key.as_deref() {
            self.affinity.store(key, &selected.id, now);
        }
        Ok(selected)
    }
}

/// Deterministic first-available selection. Burns one account before moving
/// on, which staggers rolling subscription windows.
pub struct FillFirstSelector {
    affinity: Arc<SessionAffinity>,
}

impl FillFirstSelector {
    pub fn new(affinity: Arc<SessionAffinity>) -> Self {
        Self { affinity }
    }
}

impl Default for FillFirstSelector {
    fn default() -> Self {
        Self::new(SessionAffinity::default_shared())
    }
}

impl Selector for FillFirstSelector {
    fn pick(
        &self,
        provider: &str,
        model: &str,
        opts: &Options,
        auths: &[Auth],
        now: DateTime<Utc>,
    ) -> Result<Auth, Error> {
        let available = get_available_auths(auths, provider, model, now)?;
        let affinity_key = affinity_key(provider, model, opts);

        if let Some(key) = affinity_key.as_deref() {
            if let Some(pinned_id) = self.affinity.load(key, now) {
                if let Some(pinned) = available.iter().find(|a| a.id == pinned_id) {
                    self.affinity.store(key, &pinned.id, now);
                    return Ok((*pinned).clone());
                }
            }
        }

        let selected = available[0].clone();
        if let Some(key) = affinity_key.as_deref() {
            self.affinity.store(key, &selected.id, now);
        }
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credential::{ModelState, QuotaState};
    use serde_json::Value;

    fn auth(id: &str) -> Auth {
        Auth {
            id: id.into(),
            provider: "codex".into(),
            status: Status::Active,
            ..Auth::default()
        }
    }

    fn cooling_model_state(now: DateTime<Utc>, secs: i64) -> ModelState {
        ModelState {
            unavailable: true,
            next_retry_after: Some(now + chrono::Duration::seconds(secs)),
            quota: QuotaState {
                exceeded: true,
                next_recover_at: Some(now + chrono::Duration::seconds(secs)),
                ..QuotaState::default()
            },
            ..ModelState::default()
        }
    }

    fn opts_with_session(session: &str) -> Options {
        let mut opts = Options::default();
        opts.metadata
            .insert(SESSION_AFFINITY_KEY.into(), Value::String(session.into()));
        opts
    }

    fn rr() -> RoundRobinSelector {
        let affinity = Arc::new(SessionAffinity::new());
        RoundRobinSelector::new(affinity)
    }

    #[test]
    fn sticky_then_advance_then_stay() {
        // End-to-end scenario 1: sticky pick, advance on block, stay after
        // restore.
        let now = Utc::now();
        let selector = rr();
        let opts = Options::default();
        let mut a = auth("a");
        let b = auth("b");

        let picked = selector
            .pick("codex", "", &opts, &[a.clone(), b.clone()], now)
            .unwrap();
        assert_eq!(picked.id, "a");

        a.unavailable = true;
        a.next_retry_after = Some(now + chrono::Duration::minutes(30));
        let picked = selector
            .pick("codex", "", &opts, &[a.clone(), b.clone()], now)
            .unwrap();
        assert_eq!(picked.id, "b");

        a.unavailable = false;
        a.next_retry_after = None;
        let picked = selector
            .pick("codex", "", &opts, &[a.clone(), b.clone()], now)
            .unwrap();
        assert_eq!(picked.id, "b", "cursor stays put after restore");
    }

    #[test]
    fn advance_wraps_in_sorted_order() {
        let now = Utc::now();
        let selector = rr();
        let opts = Options::default();
        let a = auth("a");
        let b = auth("b");
        let mut c = auth("c");

        // Walk the cursor to "c".
        selector
            .pick("codex", "", &opts, &[c.clone()], now)
            .unwrap();
        // "c" blocked: next after "c" wraps to "a".
        c.unavailable = true;
        c.next_retry_after = Some(now + chrono::Duration::minutes(5));
        let picked = selector
            .pick("codex", "", &opts, &[a.clone(), b.clone(), c.clone()], now)
            .unwrap();
        assert_eq!(picked.id, "a");
    }

    #[test]
    fn all_cooldown_yields_429_envelope() {
        // End-to-end scenario 2.
        let now = Utc::now();
        let selector = rr();
        let opts = Options::default();
        let mut a = auth("a");
        let mut b = auth("b");
        a.provider = "gemini".into();
        b.provider = "gemini".into();
        a.model_states
            .insert("m".into(), cooling_model_state(now, 60));
        b.model_states
            .insert("m".into(), cooling_model_state(now, 90));

        let err = selector
            .pick("gemini", "m", &opts, &[a.clone(), b.clone()], now)
            .unwrap_err();
        assert_eq!(err.status_code(), 429);
        let headers = err.headers();
        assert!(headers.contains(&("Retry-After".to_string(), "60".to_string())));
        let body: Value = serde_json::from_str(&err.message).unwrap();
        assert_eq!(body["error"]["code"], "model_cooldown");
        assert_eq!(body["error"]["reset_seconds"], 60);
        assert_eq!(body["error"]["provider"], "gemini");
        assert_eq!(body["error"]["model"], "m");

        // Mixed dispatch omits the provider field.
        let err = selector
            .pick("mixed", "m", &opts, &[a, b], now)
            .unwrap_err();
        let body: Value = serde_json::from_str(&err.message).unwrap();
        assert!(body["error"].get("provider").is_none());
    }

    #[test]
    fn disabled_only_set_is_unavailable_not_cooldown() {
        let now = Utc::now();
        let selector = rr();
        let mut a = auth("a");
        a.disabled = true;
        a.status = Status::Disabled;
        let err = selector
            .pick("codex", "", &Options::default(), &[a], now)
            .unwrap_err();
        assert_eq!(err.code, "auth_unavailable");
    }

    #[test]
    fn empty_candidates_is_not_found() {
        let err = rr()
            .pick("codex", "", &Options::default(), &[], Utc::now())
            .unwrap_err();
        assert_eq!(err.code, "auth_not_found");
    }

    #[test]
    fn priority_dominance() {
        // P6: a lower-priority auth is never returned while a higher one is
        // available.
        let now = Utc::now();
        let selector = rr();
        let opts = Options::default();
        let mut low = auth("a-low");
        let mut high = auth("b-high");
        low.attributes.insert("priority".into(), "0".into());
        high.attributes.insert("priority".into(), "10".into());

        for _ in 0..5 {
            let picked = selector
                .pick("codex", "", &opts, &[low.clone(), high.clone()], now)
                .unwrap();
            assert_eq!(picked.id, "b-high");
        }
    }

    #[test]
    fn session_affinity_sticks_and_rebinds() {
        // P3 + P4.
        let now = Utc::now();
        let affinity = Arc::new(SessionAffinity::new());
        let selector = RoundRobinSelector::new(affinity);
        let opts = opts_with_session("sess-1");
        let a = auth("a");
        let b = auth("b");

        let first = selector
            .pick("codex", "m", &opts, &[a.clone(), b.clone()], now)
            .unwrap();
        let second = selector
            .pick("codex", "m", &opts, &[a.clone(), b.clone()], now)
            .unwrap();
        assert_eq!(first.id, second.id);

        // Pinned auth excluded (retry path): rebind to the new pick...
        let only_other: Vec<Auth> = [a.clone(), b.clone()]
            .into_iter()
            .filter(|x| x.id != first.id)
            .collect();
        let rebound = selector
            .pick("codex", "m", &opts, &only_other, now)
            .unwrap();
        assert_ne!(rebound.id, first.id);

        // ...and stick to the new pin with the full set back.
        let after = selector
            .pick("codex", "m", &opts, &[a, b], now)
            .unwrap();
        assert_eq!(after.id, rebound.id);
    }

    #[test]
    fn affinity_expires_after_ttl() {
        let now = Utc::now();
        let affinity = Arc::new(SessionAffinity::new());
        affinity.store("k", "a", now);
        assert_eq!(affinity.load("k", now).as_deref(), Some("a"));
        let later = now + chrono::Duration::seconds(SESSION_AFFINITY_TTL_SECS + 1);
        assert_eq!(affinity.load("k", later), None);
        affinity.reset();
    }

    #[test]
    fn thinking_suffix_shares_cursor_and_blocks() {
        // P7: name(a) and name(b) share cursor state and block decisions.
        let now = Utc::now();
        let selector = rr();
        let opts = Options::default();
        let mut a = auth("a");
        let b = auth("b");

        let first = selector
            .pick("codex", "gpt-5(low)", &opts, &[a.clone(), b.clone()], now)
            .unwrap();
        assert_eq!(first.id, "a");

        // Block the canonical base; a pick for another suffix must move too.
        a.model_states
            .insert("gpt-5".into(), cooling_model_state(now, 120));
        let second = selector
            .pick("codex", "gpt-5(high)", &opts, &[a.clone(), b.clone()], now)
            .unwrap();
        assert_eq!(second.id, "b");
    }

    #[test]
    fn zero_horizon_unavailable_is_reevaluated() {
        let now = Utc::now();
        let selector = rr();
        let mut a = auth("a");
        a.model_states.insert(
            "m".into(),
            ModelState {
                unavailable: true,
                next_retry_after: None,
                ..ModelState::default()
            },
        );
        let picked = selector
            .pick("codex", "m", &Options::default(), &[a], now)
            .unwrap();
        assert_eq!(picked.id, "a");
    }

    #[test]
    fn cursor_map_resets_past_cap() {
        let now = Utc::now();
        let affinity = Arc::new(SessionAffinity::new());
        let selector = RoundRobinSelector::with_max_keys(affinity, 4);
        let opts = Options::default();
        let a = auth("a");
        for i in 0..4 {
            selector
                .pick("codex", &format!("model-{i}"), &opts, &[a.clone()], now)
                .unwrap();
        }
        assert_eq!(selector.cursors.lock().unwrap().len(), 4);
        selector
            .pick("codex", "model-overflow", &opts, &[a], now)
            .unwrap();
        // The map was wiped before inserting the overflow cursor.
        assert_eq!(selector.cursors.lock().unwrap().len(), 1);
    }

    #[test]
    fn fill_first_burns_the_first_sorted_account() {
        let now = Utc::now();
        let affinity = Arc::new(SessionAffinity::new());
        let selector = FillFirstSelector::new(affinity);
        let opts = Options::default();
        let mut a = auth("a");
        let b = auth("b");

        for _ in 0..3 {
            let picked = selector
                .pick("codex", "", &opts, &[b.clone(), a.clone()], now)
                .unwrap();
            assert_eq!(picked.id, "a");
        }
        a.unavailable = true;
        a.next_retry_after = Some(now + chrono::Duration::minutes(30));
        let picked = selector
            .pick("codex", "", &opts, &[b.clone(), a.clone()], now)
            .unwrap();
        assert_eq!(picked.id, "b");
    }

    #[test]
    fn cooldown_error_formats_durations() {
        let err = model_cooldown_error("m", "codex", Duration::from_secs(5400));
        let body: Value = serde_json::from_str(&err.message).unwrap();
        assert_eq!(body["error"]["reset_time"], "1h30m0s");
        assert_eq!(body["error"]["reset_seconds"], 5400);

        let err = model_cooldown_error("m", "", Duration::from_millis(200));
        let body: Value = serde_json::from_str(&err.message).unwrap();
        assert_eq!(body["error"]["reset_time"], "1s");
        assert_eq!(body["error"]["reset_seconds"], 1);
    }
}
