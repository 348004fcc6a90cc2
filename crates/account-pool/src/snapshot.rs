//! Redacted management views.
//!
//! Read-only snapshots served to the management collaborator. Attributes and
//! metadata never leave the manager: they carry API keys, OAuth tokens, and
//! proxy credentials.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use credential::{Auth, ModelState, QuotaState, Status};
use serde::Serialize;

use crate::manager::Manager;

/// Redacted per-model runtime view.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStateSnapshot {
    pub status: Status,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status_message: String,
    pub unavailable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_after: Option<DateTime<Utc>>,
    pub quota: QuotaState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_kind: Option<String>,
}

/// Redacted per-auth runtime view.
#[derive(Debug, Clone, Serialize)]
pub struct AuthSnapshot {
    pub id: String,
    pub provider: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub label: String,
    pub status: Status,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status_message: String,
    pub disabled: bool,
    pub unavailable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_after: Option<DateTime<Utc>>,
    pub quota: QuotaState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_kind: Option<String>,
    /// Whether the auth routes through an egress proxy; the URL itself is
    /// never exposed.
    pub proxied: bool,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub model_states: HashMap<String, ModelStateSnapshot>,
}

fn model_snapshot(state: &ModelState) -> ModelStateSnapshot {
    ModelStateSnapshot {
        status: state.status,
        status_message: state.status_message.clone(),
        unavailable: state.unavailable,
        next_retry_after: state.next_retry_after,
        quota: state.quota.clone(),
        last_error_kind: state.last_error.as_ref().map(|e| e.code.clone()),
    }
}

fn auth_snapshot(auth: &Auth) -> AuthSnapshot {
    AuthSnapshot {
        id: auth.id.clone(),
        provider: auth.provider.clone(),
        label: auth.label.clone(),
        status: auth.status,
        status_message: auth.status_message.clone(),
        disabled: auth.disabled,
        unavailable: auth.unavailable,
        next_retry_after: auth.next_retry_after,
        quota: auth.quota.clone(),
        last_error_kind: auth.last_error.as_ref().map(|e| e.code.clone()),
        proxied: !auth.proxy_url.trim().is_empty(),
        model_states: auth
            .model_states
            .iter()
            .map(|(model, state)| (model.clone(), model_snapshot(state)))
            .collect(),
    }
}

impl Manager {
    /// Redacted snapshot of every registered auth, sorted by id.
    pub async fn auth_snapshots(&self) -> Vec<AuthSnapshot> {
        self.list_auths().await.iter().map(auth_snapshot).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{RoundRobinSelector, SessionAffinity};
    use credential::Error;
    use std::sync::Arc;

    #[tokio::test]
    async fn snapshots_redact_secrets() {
        let affinity = Arc::new(SessionAffinity::new());
        let manager = Manager::builder(Box::new(RoundRobinSelector::new(affinity))).build();

        let mut auth = Auth {
            id: "acct-1".into(),
            provider: "claude".into(),
            label: "team".into(),
            proxy_url: "http://secret-user:pw@proxy.example:8080".into(),
            status: Status::Error,
            status_message: "quota exceeded".into(),
            unavailable: true,
            last_error: Some(Error::new("quota_limited_5h", "limit", 429)),
            ..Auth::default()
        };
        auth.attributes
            .insert("api_key".into(), "sk-super-secret".into());
        auth.metadata.insert(
            "refresh_token".into(),
            serde_json::Value::String("rt-secret".into()),
        );
        auth.model_state_mut("m").unavailable = true;
        manager.register(auth).await.unwrap();

        let snapshots = manager.auth_snapshots().await;
        assert_eq!(snapshots.len(), 1);
        let snap = &snapshots[0];
        assert_eq!(snap.id, "acct-1");
        assert!(snap.proxied);
        assert_eq!(snap.last_error_kind.as_deref(), Some("quota_limited_5h"));
        assert!(snap.model_states.contains_key("m"));

        let rendered = serde_json::to_string(&snapshots).unwrap();
        assert!(!rendered.contains("sk-super-secret"));
        assert!(!rendered.contains("rt-secret"));
        assert!(!rendered.contains("proxy.example"));
    }
}
