//! Egress determinism tracker.
//!
//! Every pick records which outbound proxy the account is about to use. The
//! account → proxy-digest mapping persists across restarts so a changed
//! egress path (drift) is detected and counted. Snapshots are redacted: the
//! digest never leaves the tracker and proxy identities collapse to
//! `direct` or `proxy#<12 hex>`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;
use url::Url;

use crate::config::EgressConfig;

/// Persisted per-account egress observation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EgressMappingEntry {
    #[serde(default)]
    pub proxy_identity: String,
    #[serde(default)]
    pub proxy_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub drift_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_drift_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_provider: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_model: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct EgressMappingState {
    version: u32,
    updated_at: DateTime<Utc>,
    accounts: HashMap<String, EgressMappingEntry>,
}

/// Read-only observability view for account egress mappings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EgressMappingSnapshot {
    pub enabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state_file: String,
    pub drift_alert_threshold: u32,
    pub total_accounts: usize,
    pub drifted_accounts: usize,
    pub alerted_accounts: usize,
    pub total_drift_events: u64,
    pub inconsistent_accounts: usize,
    pub total_consistency_issues: usize,
    pub accounts: Vec<EgressMappingSnapshotRecord>,
}

/// Sanitized per-account egress mapping status.
#[derive(Debug, Clone, Serialize)]
pub struct EgressMappingSnapshotRecord {
    pub auth_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub provider: String,
    pub proxy_identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_seen_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    pub drift_count: u32,
    pub drift_alerted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_drift_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_provider: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_model: String,
    pub consistency_status: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub consistency_issues: Vec<&'static str>,
}

/// Account → proxy mapping with drift detection and atomic persistence.
///
/// Callers guard the tracker with the manager's egress lock; file IO is
/// synchronous and short.
#[derive(Debug, Default)]
pub struct EgressTracker {
    enabled: bool,
    state_file: PathBuf,
    drift_alert_threshold: u32,
    loaded: bool,
    mappings: HashMap<String, EgressMappingEntry>,
}

impl EgressTracker {
    pub fn apply_config(&mut self, cfg: &EgressConfig) {
        let state_file = cfg.state_file.clone();
        let same_path = state_file == self.state_file;
        self.enabled = cfg.enabled;
        self.drift_alert_threshold = cfg.normalized_threshold();
        self.state_file = state_file;
        if !self.enabled || !same_path {
            self.loaded = false;
            self.mappings.clear();
        }
    }

    /// Record one pick. Loads the state file lazily on first use, detects
    /// digest drift, and persists the updated mapping atomically.
    pub fn observe(
        &mut self,
        auth_id: &str,
        proxy_url: &str,
        provider: &str,
        model: &str,
        now: DateTime<Utc>,
    ) {
        let auth_id = auth_id.trim();
        if !self.enabled || auth_id.is_empty() {
            return;
        }
        self.ensure_loaded();

        let (proxy_identity, proxy_digest) = normalize_proxy_identity_and_digest(proxy_url);
        let provider = provider.trim().to_lowercase();
        let model = model.trim().to_string();

        let entry = self.mappings.entry(auth_id.to_string()).or_default();
        let mut drifted = false;
        let mut prev_identity = String::new();
        if entry.proxy_digest.is_empty() {
            entry.first_seen_at = entry.first_seen_at.or(Some(now));
        } else if entry.proxy_digest != proxy_digest {
            drifted = true;
            prev_identity = entry.proxy_identity.clone();
            entry.drift_count += 1;
            entry.last_drift_at = Some(now);
        }
        if entry.first_seen_at.is_none() {
            entry.first_seen_at = Some(now);
        }
        entry.proxy_identity = proxy_identity.clone();
        entry.proxy_digest = proxy_digest;
        entry.last_seen_at = Some(now);
        entry.last_provider = provider.clone();
        entry.last_model = model.clone();
        let drift_count = entry.drift_count;

        if drifted {
            warn!(
                auth_id,
                provider,
                model,
                from_proxy_identity = prev_identity,
                to_proxy_identity = proxy_identity,
                drift_count,
                drift_alert_threshold = self.drift_alert_threshold,
                drift_alerted = drift_count >= self.drift_alert_threshold,
                "egress drift detected"
            );
            metrics::counter!("pool_egress_drift_total").increment(1);
        }

        if let Err(e) = persist_state(&self.state_file, &self.mappings, now) {
            warn!(state_file = %self.state_file.display(), error = %e, "failed to persist egress mapping state");
        }
    }

    /// Redacted snapshot plus aggregate totals. `providers` maps auth id to
    /// provider for records whose auth is still registered.
    pub fn snapshot(&mut self, providers: &HashMap<String, String>) -> EgressMappingSnapshot {
        let mut snapshot = EgressMappingSnapshot {
            enabled: self.enabled,
            state_file: self.state_file.display().to_string(),
            drift_alert_threshold: self.drift_alert_threshold.max(1),
            ..EgressMappingSnapshot::default()
        };
        if !self.enabled {
            return snapshot;
        }
        self.ensure_loaded();

        let mut ids: Vec<&String> = self.mappings.keys().collect();
        ids.sort();

        for auth_id in ids {
            let entry = &self.mappings[auth_id];
            let issues = entry_consistency_issues(entry);
            let record = EgressMappingSnapshotRecord {
                auth_id: auth_id.clone(),
                provider: providers.get(auth_id).cloned().unwrap_or_default(),
                proxy_identity: redact_proxy_identity(&entry.proxy_identity, &entry.proxy_digest),
                first_seen_at: entry.first_seen_at,
                last_seen_at: entry.last_seen_at,
                drift_count: entry.drift_count,
                drift_alerted: entry.drift_count >= snapshot.drift_alert_threshold,
                last_drift_at: entry.last_drift_at,
                last_provider: entry.last_provider.clone(),
                last_model: entry.last_model.clone(),
                consistency_status: if issues.is_empty() { "ok" } else { "inconsistent" },
                consistency_issues: issues,
            };
            if record.drift_count > 0 {
                snapshot.drifted_accounts += 1;
            }
            if record.drift_alerted {
                snapshot.alerted_accounts += 1;
            }
            snapshot.total_drift_events += record.drift_count as u64;
            if !record.consistency_issues.is_empty() {
                snapshot.inconsistent_accounts += 1;
                snapshot.total_consistency_issues += record.consistency_issues.len();
            }
            snapshot.accounts.push(record);
        }
        snapshot.total_accounts = snapshot.accounts.len();
        snapshot
    }

    fn ensure_loaded(&mut self) {
        if self.loaded {
            return;
        }
        self.mappings = match load_state(&self.state_file) {
            Ok(mappings) => mappings,
            Err(e) => {
                warn!(state_file = %self.state_file.display(), error = %e, "failed to load egress mapping state");
                HashMap::new()
            }
        };
        self.loaded = true;
    }

    #[cfg(test)]
    pub(crate) fn entry(&self, auth_id: &str) -> Option<&EgressMappingEntry> {
        self.mappings.get(auth_id)
    }
}

fn entry_consistency_issues(entry: &EgressMappingEntry) -> Vec<&'static str> {
    let mut issues = Vec::new();
    if entry.proxy_identity.trim().is_empty() {
        issues.push("missing_proxy_identity");
    }
    if entry.proxy_digest.trim().is_empty() {
        issues.push("missing_proxy_digest");
    }
    if let (Some(first), Some(last)) = (entry.first_seen_at, entry.last_seen_at) {
        if first > last {
            issues.push("first_seen_after_last_seen");
        }
    }
    if entry.drift_count > 0 && entry.last_drift_at.is_none() {
        issues.push("drift_without_timestamp");
    }
    if entry.drift_count == 0 && entry.last_drift_at.is_some() {
        issues.push("stale_drift_timestamp");
    }
    issues
}

/// Collapse a proxy identity for external exposure.
fn redact_proxy_identity(identity: &str, digest: &str) -> String {
    let identity = identity.trim();
    if identity.eq_ignore_ascii_case("direct") {
        return "direct".to_string();
    }
    let seed = if digest.trim().is_empty() {
        identity
    } else {
        digest.trim()
    };
    if seed.is_empty() {
        return "proxy".to_string();
    }
    let token = digest_string(seed);
    format!("proxy#{}", &token[..12])
}

/// Canonicalize the proxy URL: userinfo/query/fragment stripped, scheme and
/// host lowercased. An empty URL canonicalizes to the literal "direct".
fn normalize_proxy_identity_and_digest(proxy_url: &str) -> (String, String) {
    let trimmed = proxy_url.trim();
    if trimmed.is_empty() {
        return ("direct".to_string(), digest_string("direct"));
    }

    match Url::parse(trimmed) {
        Ok(mut parsed) => {
            let scheme = parsed.scheme().to_lowercase();
            let host = parsed
                .host_str()
                .map(str::to_lowercase)
                .unwrap_or_default();
            let identity = if !host.is_empty() {
                let host_port = match parsed.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host,
                };
                format!("{scheme}://{host_port}")
            } else {
                "proxy".to_string()
            };
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            parsed.set_query(None);
            parsed.set_fragment(None);
            (identity, digest_string(parsed.as_str()))
        }
        Err(_) => ("proxy".to_string(), digest_string(trimmed)),
    }
}

fn digest_string(raw: &str) -> String {
    let sum = Sha256::digest(raw.as_bytes());
    sum.iter().map(|b| format!("{b:02x}")).collect()
}

fn persist_state(
    path: &Path,
    mappings: &HashMap<String, EgressMappingEntry>,
    now: DateTime<Utc>,
) -> std::io::Result<()> {
    if path.as_os_str().is_empty() {
        return Ok(());
    }
    let state = EgressMappingState {
        version: 1,
        updated_at: now,
        accounts: mappings.clone(),
    };
    let raw = serde_json::to_vec_pretty(&state)
        .map_err(|e| std::io::Error::other(format!("serializing egress state: {e}")))?;
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700));
            }
        }
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, raw)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600));
    }
    std::fs::rename(&tmp, path)
}

fn load_state(path: &Path) -> std::io::Result<HashMap<String, EgressMappingEntry>> {
    if path.as_os_str().is_empty() {
        return Ok(HashMap::new());
    }
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e),
    };
    if data.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let state: EgressMappingState = serde_json::from_str(&data)
        .map_err(|e| std::io::Error::other(format!("parsing egress state: {e}")))?;
    let mut out = HashMap::with_capacity(state.accounts.len());
    for (raw_id, mut entry) in state.accounts {
        let id = raw_id.trim().to_string();
        if id.is_empty() {
            continue;
        }
        entry.proxy_identity = entry.proxy_identity.trim().to_string();
        entry.proxy_digest = entry.proxy_digest.trim().to_string();
        entry.last_provider = entry.last_provider.trim().to_lowercase();
        entry.last_model = entry.last_model.trim().to_string();
        out.insert(id, entry);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(dir: &tempfile::TempDir) -> EgressTracker {
        let mut tracker = EgressTracker::default();
        tracker.apply_config(&EgressConfig {
            enabled: true,
            state_file: dir.path().join("egress-mapping.json"),
            drift_alert_threshold: 1,
        });
        tracker
    }

    #[test]
    fn first_observation_creates_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = tracker(&dir);
        let now = Utc::now();
        t.observe("acct-1", "http://user:pw@proxy.example:8080/?x=1", "codex", "gpt-5", now);

        let entry = t.entry("acct-1").unwrap();
        assert_eq!(entry.proxy_identity, "http://proxy.example:8080");
        assert_eq!(entry.drift_count, 0);
        assert_eq!(entry.last_provider, "codex");
        assert!(entry.first_seen_at.is_some());
        // Digest excludes userinfo and query.
        let (_, clean_digest) =
            normalize_proxy_identity_and_digest("http://proxy.example:8080/");
        assert_eq!(entry.proxy_digest, clean_digest);
    }

    #[test]
    fn drift_increments_exactly_once_per_change() {
        // P12.
        let dir = tempfile::tempdir().unwrap();
        let mut t = tracker(&dir);
        let now = Utc::now();
        t.observe("acct-1", "http://proxy-a.example:8080", "codex", "m", now);
        t.observe("acct-1", "http://proxy-b.example:8080", "codex", "m", now);

        let entry = t.entry("acct-1").unwrap();
        assert_eq!(entry.drift_count, 1);
        assert_eq!(entry.proxy_identity, "http://proxy-b.example:8080");
        assert!(entry.last_drift_at.is_some());

        // Same proxy again: no further drift.
        t.observe("acct-1", "http://proxy-b.example:8080", "codex", "m", now);
        assert_eq!(t.entry("acct-1").unwrap().drift_count, 1);
    }

    #[test]
    fn userinfo_change_does_not_drift() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = tracker(&dir);
        let now = Utc::now();
        t.observe("acct-1", "http://alice:x@proxy.example:8080", "codex", "m", now);
        t.observe("acct-1", "http://bob:y@proxy.example:8080", "codex", "m", now);
        assert_eq!(t.entry("acct-1").unwrap().drift_count, 0);
    }

    #[test]
    fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        {
            let mut t = tracker(&dir);
            t.observe("acct-1", "http://proxy.example:8080", "codex", "m", now);
        }
        let mut t2 = tracker(&dir);
        t2.observe("acct-1", "http://other.example:9090", "codex", "m", now);
        assert_eq!(t2.entry("acct-1").unwrap().drift_count, 1);
    }

    #[test]
    fn empty_proxy_is_direct() {
        let (identity, digest) = normalize_proxy_identity_and_digest("");
        assert_eq!(identity, "direct");
        assert_eq!(digest, digest_string("direct"));
    }

    #[test]
    fn snapshot_redacts_identity_and_never_leaks_digest() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = tracker(&dir);
        let now = Utc::now();
        t.observe("acct-1", "http://secret-user:pw@proxy.example:8080", "codex", "m", now);
        t.observe("acct-2", "", "gemini", "m", now);

        let mut providers = HashMap::new();
        providers.insert("acct-1".to_string(), "codex".to_string());
        let snap = t.snapshot(&providers);

        assert_eq!(snap.total_accounts, 2);
        let rendered = serde_json::to_string(&snap).unwrap();
        assert!(!rendered.contains("secret-user"));
        assert!(!rendered.contains("proxy.example"));

        let acct1 = snap.accounts.iter().find(|r| r.auth_id == "acct-1").unwrap();
        assert!(acct1.proxy_identity.starts_with("proxy#"));
        assert_eq!(acct1.proxy_identity.len(), "proxy#".len() + 12);
        assert_eq!(acct1.provider, "codex");
        let acct2 = snap.accounts.iter().find(|r| r.auth_id == "acct-2").unwrap();
        assert_eq!(acct2.proxy_identity, "direct");
    }

    #[test]
    fn snapshot_counts_drifts_and_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = tracker(&dir);
        let now = Utc::now();
        t.observe("acct-1", "http://a.example:1", "codex", "m", now);
        t.observe("acct-1", "http://b.example:1", "codex", "m", now);
        t.observe("acct-2", "http://c.example:1", "codex", "m", now);

        let snap = t.snapshot(&HashMap::new());
        assert_eq!(snap.drifted_accounts, 1);
        assert_eq!(snap.alerted_accounts, 1);
        assert_eq!(snap.total_drift_events, 1);
        assert_eq!(snap.inconsistent_accounts, 0);
    }

    #[test]
    fn consistency_flags_surface() {
        let entry = EgressMappingEntry {
            proxy_identity: String::new(),
            proxy_digest: String::new(),
            drift_count: 2,
            last_drift_at: None,
            ..EgressMappingEntry::default()
        };
        let issues = entry_consistency_issues(&entry);
        assert!(issues.contains(&"missing_proxy_identity"));
        assert!(issues.contains(&"missing_proxy_digest"));
        assert!(issues.contains(&"drift_without_timestamp"));

        let entry = EgressMappingEntry {
            proxy_identity: "direct".into(),
            proxy_digest: "abc".into(),
            drift_count: 0,
            last_drift_at: Some(Utc::now()),
            ..EgressMappingEntry::default()
        };
        assert_eq!(entry_consistency_issues(&entry), vec!["stale_drift_timestamp"]);
    }

    #[test]
    fn disabled_tracker_is_inert() {
        let mut t = EgressTracker::default();
        t.observe("acct-1", "http://a.example:1", "codex", "m", Utc::now());
        assert!(t.entry("acct-1").is_none());
        let snap = t.snapshot(&HashMap::new());
        assert!(!snap.enabled);
        assert!(snap.accounts.is_empty());
    }

    #[test]
    fn tolerates_absent_and_empty_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("egress-mapping.json");
        assert!(load_state(&path).unwrap().is_empty());
        std::fs::write(&path, "  ").unwrap();
        assert!(load_state(&path).unwrap().is_empty());
    }
}
