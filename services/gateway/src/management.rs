//! Management API
//!
//! Read-only observability plus the drill-fault control endpoint. Everything
//! here serves redacted snapshots; raw credentials, proxy URLs, and digests
//! never cross this surface.
//!
//! Endpoints:
//! - GET  /v0/management/auths                  — redacted auth runtime list
//! - GET  /v0/management/egress-mapping         — egress drift snapshot
//! - GET  /v0/management/internal-drill-faults  — remaining armed faults
//! - POST /v0/management/internal-drill-faults  — arm faults (gated)
//! - GET  /v0/management/prompt-queue/submissions
//! - GET  /v0/management/prompt-queue/events
//! - GET  /v0/management/usage/metrics          — event stream counters
//! - GET  /v0/management/queue-health           — saturation counters

use std::net::SocketAddr;
use std::sync::Arc;

use account_pool::{Manager, SCENARIO_ACCOUNT_QUOTA_EXHAUSTED, SCENARIO_PROXY_FAILURE};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use common::Secret;
use prompt_queue::{ListOptions, SubmissionStatus};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use usage_events::EventStreamManager;

/// Environment gate for the drill-fault endpoint.
pub const DRILL_FAULT_ENV_GATE: &str = "GATEWAY_ENABLE_DRILL_FAULTS";

/// Ports considered "shadow" deployments where drill faults may be armed.
const SHADOW_PORT_RANGE: std::ops::RangeInclusive<u16> = 50_000..=59_999;

/// Shared state for management handlers.
#[derive(Clone)]
pub struct ManagementState {
    pub manager: Arc<Manager>,
    pub queue: Arc<prompt_queue::Manager>,
    pub usage: Arc<EventStreamManager>,
    pub management_key: Arc<Secret>,
    pub listen_port: u16,
}

/// Build the management router.
pub fn router(state: ManagementState) -> Router {
    Router::new()
        .route("/auths", get(list_auths))
        .route("/egress-mapping", get(egress_mapping))
        .route(
            "/internal-drill-faults",
            get(drill_fault_snapshot).post(apply_drill_fault),
        )
        .route("/prompt-queue/submissions", get(queue_submissions))
        .route("/prompt-queue/events", get(queue_events))
        .route("/usage/metrics", get(usage_metrics))
        .route("/queue-health", get(queue_health))
        .with_state(state)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": {"type": "unauthorized", "message": "management key required"}})),
    )
        .into_response()
}

/// Bearer-key check; disabled when no key is configured.
fn authorize(state: &ManagementState, headers: &HeaderMap) -> Result<(), Response> {
    if state.management_key.is_empty() {
        return Ok(());
    }
    let supplied = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    if supplied == state.management_key.expose() {
        Ok(())
    } else {
        Err(unauthorized())
    }
}

async fn list_auths(
    State(state): State<ManagementState>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let auths = state.manager.auth_snapshots().await;
    Json(json!({ "auths": auths })).into_response()
}

async fn egress_mapping(
    State(state): State<ManagementState>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    Json(state.manager.egress_mapping_snapshot().await).into_response()
}

async fn drill_fault_snapshot(
    State(state): State<ManagementState>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    Json(json!({ "remaining": state.manager.internal_drill_fault_snapshot() })).into_response()
}

#[derive(Debug, Deserialize)]
struct DrillFaultRequest {
    scenario: String,
    #[serde(default)]
    count: u32,
}

/// Arm a drill fault. Only available when the environment gate is set, the
/// listener sits in the shadow port range, and the caller is loopback.
async fn apply_drill_fault(
    State(state): State<ManagementState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<DrillFaultRequest>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    if !drill_faults_enabled(state.listen_port, peer) {
        warn!(peer = %peer, port = state.listen_port, "drill fault request rejected by gate");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": {"type": "forbidden", "message": "drill faults are not enabled on this deployment"}})),
        )
            .into_response();
    }

    match state
        .manager
        .apply_internal_drill_fault(&req.scenario, req.count)
    {
        Ok(_) => {
            info!(scenario = %req.scenario, count = req.count.max(1), "drill fault armed");
            let assertion = match req.scenario.trim().to_lowercase().as_str() {
                SCENARIO_PROXY_FAILURE => "account_penalty_unchanged",
                SCENARIO_ACCOUNT_QUOTA_EXHAUSTED => "account_switched",
                _ => "",
            };
            Json(json!({
                "scenario": req.scenario.trim().to_lowercase(),
                "remaining": state.manager.internal_drill_fault_snapshot(),
                "assertion": assertion,
            }))
            .into_response()
        }
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"type": "invalid_request", "message": err.message}})),
        )
            .into_response(),
    }
}

/// The three-way gate for arming drill faults.
pub fn drill_faults_enabled(listen_port: u16, peer: SocketAddr) -> bool {
    let env_enabled = std::env::var(DRILL_FAULT_ENV_GATE)
        .map(|v| {
            let v = v.trim().to_lowercase();
            v == "1" || v == "true"
        })
        .unwrap_or(false);
    env_enabled && SHADOW_PORT_RANGE.contains(&listen_port) && peer.ip().is_loopback()
}

#[derive(Debug, Default, Deserialize)]
struct SubmissionsQuery {
    #[serde(default)]
    session_key: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: usize,
}

async fn queue_submissions(
    State(state): State<ManagementState>,
    headers: HeaderMap,
    Query(query): Query<SubmissionsQuery>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let status = match query.status.trim() {
        "" => None,
        "queued" => Some(SubmissionStatus::Queued),
        "running" => Some(SubmissionStatus::Running),
        "succeeded" => Some(SubmissionStatus::Succeeded),
        "failed" => Some(SubmissionStatus::Failed),
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"type": "invalid_request", "message": format!("unknown status filter: {other}")}})),
            )
                .into_response();
        }
    };
    let submissions = state.queue.list_submissions(ListOptions {
        session_key: query.session_key,
        status,
        offset: query.offset,
        limit: query.limit,
    });
    Json(json!({ "submissions": submissions })).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    session_key: String,
    #[serde(default)]
    since_seq: u64,
    #[serde(default)]
    limit: usize,
}

async fn queue_events(
    State(state): State<ManagementState>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let events = state
        .queue
        .events_since(&query.session_key, query.since_seq, query.limit);
    Json(json!({ "events": events, "queue": state.queue.metrics_snapshot() })).into_response()
}

async fn usage_metrics(
    State(state): State<ManagementState>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    Json(state.usage.metrics_snapshot()).into_response()
}

async fn queue_health(
    State(state): State<ManagementState>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    Json(common::queuehealth::snapshot_all()).into_response()
}
