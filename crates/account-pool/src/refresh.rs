//! Background token refresh coordinator.
//!
//! Periodically walks the registry and refreshes credentials whose tokens
//! approach expiry. The provider returns a clean auth shape; active cooldown
//! and policy-disable state from the stored entry is merged back in before
//! the replacement is stored, so a refresh never resurrects a frozen
//! account.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use credential::{merge_runtime_failure_state, Auth, Error};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::manager::{ExecutionResult, Manager};

/// Spawn the refresh loop. Runs every `interval` and refreshes any token
/// expiring within `threshold`. The immediate first tick is skipped because
/// tokens were just loaded.
pub fn spawn_refresh_task(
    manager: Arc<Manager>,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            refresh_cycle(&manager, threshold).await;
        }
    })
}

/// Run one refresh cycle over every registered auth.
pub async fn refresh_cycle(manager: &Manager, threshold: Duration) {
    let now = Utc::now();
    let horizon =
        now + chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());

    for auth in manager.list_auths().await {
        if auth.disabled {
            continue;
        }
        let Some(expires_at) = token_expiry(&auth) else {
            continue;
        };
        if expires_at > horizon {
            continue;
        }
        let Some(executor) = manager.executor_for(&auth.provider).await else {
            continue;
        };
        debug!(auth_id = %auth.id, "token expiring within threshold, refreshing");

        match executor.refresh(&auth).await {
            Ok(mut refreshed) => {
                merge_runtime_failure_state(&mut refreshed, &auth, now);
                manager.replace_auth(refreshed).await;
                info!(auth_id = %auth.id, "background token refresh succeeded");
            }
            Err(err) if matches!(err.http_status, 401 | 403) => {
                // A rejected refresh token means the credential is dead, not
                // merely rate limited.
                warn!(auth_id = %auth.id, error = %err, "refresh token rejected");
                let fatal = Error::new("account_deactivated", err.message.clone(), 401);
                manager
                    .mark_result(ExecutionResult {
                        auth_id: auth.id.clone(),
                        provider: auth.provider.clone(),
                        model: String::new(),
                        success: false,
                        error: Some(fatal),
                    })
                    .await;
            }
            Err(err) => {
                warn!(auth_id = %auth.id, error = %err, "background refresh failed, will retry next cycle");
            }
        }
    }
}

/// Token expiry from `metadata["expires_at"]` (RFC3339 or epoch seconds).
fn token_expiry(auth: &Auth) -> Option<DateTime<Utc>> {
    match auth.metadata.get("expires_at")? {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => Utc.timestamp_opt(n.as_i64()?, 0).single(),
        _ => None,
    }
}
