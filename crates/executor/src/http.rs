//! Shared HTTP plumbing for executors.
//!
//! Builds per-auth clients (honoring the credential's egress proxy), applies
//! attribute-driven custom headers, and translates upstream failures into the
//! [`Error`] shape. Upstream bodies that are already valid JSON are
//! propagated verbatim; anything else is wrapped in the canonical envelope.

use std::time::Duration;

use credential::{Auth, Error};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::Response;

/// TCP connect timeout for upstream clients (distinct from per-request
/// timeouts owned by the caller's context).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Attribute key prefix for custom headers, e.g.
/// `header:x-org-id = "org_123"`.
pub const HEADER_ATTR_PREFIX: &str = "header:";

/// Build a client for one auth, routing through its egress proxy when set.
pub fn client_for(auth: &Auth) -> Result<reqwest::Client, Error> {
    let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
    let proxy_url = auth.proxy_url.trim();
    if !proxy_url.is_empty() {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| Error::network(format!("invalid proxy url: {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| Error::network(format!("building http client: {e}")))
}

/// Apply `header:`-prefixed attributes to an outgoing request. The
/// authorization header is protected: executors own credential injection.
pub fn apply_custom_headers(
    mut builder: reqwest::RequestBuilder,
    auth: &Auth,
) -> reqwest::RequestBuilder {
    for (key, value) in &auth.attributes {
        let Some(name) = key.strip_prefix(HEADER_ATTR_PREFIX) else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        if name.eq_ignore_ascii_case("authorization") {
            warn!(header = name, "refusing to overwrite authorization header");
            continue;
        }
        builder = builder.header(name, value.trim());
    }
    builder
}

/// Translate a non-success upstream response into an [`Error`].
pub async fn error_from_response(resp: reqwest::Response) -> Error {
    let status = resp.status().as_u16();
    let retry_after_header = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = resp.text().await.unwrap_or_default();
    let mut err = Error::new("", normalize_error_body(&body, status), status);
    err.retryable = matches!(status, 408 | 429 | 500 | 502 | 503 | 504);
    if let Some(retry_after) = retry_after_header {
        err = err.with_retry_after(retry_after);
    }
    err
}

/// Translate a transport failure (no response) into a network [`Error`].
pub fn error_from_transport(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        return Error::network(format!("timeout: {err}"));
    }
    if err.is_connect() {
        return Error::network(format!("connection refused: {err}"));
    }
    Error::network(err.to_string())
}

/// Keep JSON bodies as-is; wrap everything else in the canonical envelope.
pub fn normalize_error_body(body: &str, status: u16) -> String {
    let trimmed = body.trim();
    if !trimmed.is_empty() && serde_json::from_str::<Value>(trimmed).is_ok() {
        return trimmed.to_string();
    }
    let message = if trimmed.is_empty() {
        format!("upstream returned status {status}")
    } else {
        trimmed.to_string()
    };
    json!({
        "error": {
            "message": message,
            "type": "upstream_error",
            "code": status,
        }
    })
    .to_string()
}

/// Parse, mutate, and re-serialize a JSON object payload. Non-object
/// payloads are rejected before any bytes reach upstream.
pub fn mutate_json_payload(
    payload: &[u8],
    mutate: impl FnOnce(&mut Map<String, Value>),
) -> Result<Vec<u8>, Error> {
    let mut parsed: Map<String, Value> = if payload.is_empty() {
        Map::new()
    } else {
        serde_json::from_slice(payload)
            .map_err(|e| Error::new("", format!("request payload is not a JSON object: {e}"), 400))?
    };
    mutate(&mut parsed);
    serde_json::to_vec(&Value::Object(parsed))
        .map_err(|e| Error::new("", format!("serializing request payload: {e}"), 500))
}

/// Local token estimate for providers without a count endpoint: roughly four
/// bytes per token on mixed prose payloads.
pub fn local_token_estimate(payload: &[u8]) -> Response {
    let tokens = (payload.len() / 4).max(1);
    Response {
        payload: json!({ "input_tokens": tokens }).to_string().into_bytes(),
    }
}

/// Token endpoint response for both exchange and refresh.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute).
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Refresh an access token using a refresh token.
///
/// 401/403 from the token endpoint means the refresh token is revoked; that
/// surfaces as a fatal-classifiable 401 so the manager can disable the
/// account.
pub async fn oauth_refresh(
    client: &reqwest::Client,
    endpoint: &str,
    client_id: &str,
    refresh_token: &str,
    extra: &[(&str, &str)],
) -> Result<TokenResponse, Error> {
    let mut form = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
    ];
    form.extend_from_slice(extra);

    let resp = client
        .post(endpoint)
        .form(&form)
        .send()
        .await
        .map_err(error_from_transport)?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let status = status.as_u16();
        if status == 401 || status == 403 {
            return Err(Error::new(
                "token_invalidated",
                format!("refresh token rejected ({status}): {body}"),
                401,
            ));
        }
        let mut err = Error::new("", normalize_error_body(&body, status), status);
        err.retryable = true;
        return Err(err);
    }

    resp.json::<TokenResponse>()
        .await
        .map_err(|e| Error::network(format!("invalid refresh response: {e}")))
}
