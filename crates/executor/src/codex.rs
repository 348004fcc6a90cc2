//! Codex executor (OpenAI Responses API entrypoint).

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use credential::{Auth, Error};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::http::{
    apply_custom_headers, client_for, error_from_response, error_from_transport,
    local_token_estimate, mutate_json_payload, oauth_refresh,
};
use crate::sse::{pump_response, CodexProtocol};
use crate::{Executor, Options, Request, Response, StreamReceiver, STREAM_CHANNEL_CAPACITY};

const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
const TOKEN_ENDPOINT: &str = "https://auth.openai.com/oauth/token";
const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
const USER_AGENT: &str = "codex_cli_rs/0.101.0";

/// Stateless executor for Codex session credentials.
#[derive(Debug, Default)]
pub struct CodexExecutor;

impl CodexExecutor {
    pub fn new() -> Self {
        Self
    }

    fn bearer(auth: &Auth) -> Option<String> {
        auth.attribute("api_key")
            .map(str::to_string)
            .or_else(|| auth.metadata_str("access_token").map(str::to_string))
    }

    fn responses_url(auth: &Auth) -> String {
        let base = auth.attribute("base_url").unwrap_or(DEFAULT_BASE_URL);
        format!("{}/responses", base.trim_end_matches('/'))
    }

    async fn post_responses(
        &self,
        auth: &Auth,
        req: &Request,
        stream: bool,
    ) -> Result<reqwest::Response, Error> {
        let body = mutate_json_payload(&req.payload, |payload| {
            payload.insert("model".into(), Value::String(req.model.clone()));
            payload.insert("stream".into(), Value::Bool(stream));
        })?;
        let client = client_for(auth)?;
        let mut builder = client
            .post(Self::responses_url(auth))
            .header("Content-Type", "application/json")
            .header("User-Agent", USER_AGENT)
            .body(body);
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }
        builder = self.prepare_request(builder, auth);
        builder.send().await.map_err(error_from_transport)
    }
}

#[async_trait]
impl Executor for CodexExecutor {
    fn identifier(&self) -> &str {
        "codex"
    }

    async fn execute(&self, auth: &Auth, req: Request, _opts: Options) -> Result<Response, Error> {
        let resp = self.post_responses(auth, &req, false).await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let payload = resp
            .bytes()
            .await
            .map_err(error_from_transport)?
            .to_vec();
        Ok(Response { payload })
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        req: Request,
        _opts: Options,
    ) -> Result<StreamReceiver, Error> {
        let resp = self.post_responses(auth, &req, true).await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(pump_response(CodexProtocol, resp, tx));
        Ok(rx)
    }

    async fn count_tokens(
        &self,
        _auth: &Auth,
        req: Request,
        _opts: Options,
    ) -> Result<Response, Error> {
        // Codex has no count endpoint; serve a local estimate.
        Ok(local_token_estimate(&req.payload))
    }

    async fn refresh(&self, auth: &Auth) -> Result<Auth, Error> {
        let refresh_token = auth
            .metadata_str("refresh_token")
            .ok_or_else(|| Error::new("unauthorized", "auth has no refresh token", 401))?
            .to_string();
        let client = client_for(auth)?;
        let token = oauth_refresh(&client, TOKEN_ENDPOINT, CLIENT_ID, &refresh_token, &[]).await?;

        let mut refreshed = auth.clone();
        refreshed
            .metadata
            .insert("access_token".into(), Value::String(token.access_token));
        if let Some(rotated) = token.refresh_token {
            refreshed
                .metadata
                .insert("refresh_token".into(), Value::String(rotated));
        }
        if let Some(expires_in) = token.expires_in {
            let expires_at = Utc::now() + ChronoDuration::seconds(expires_in as i64);
            refreshed.metadata.insert(
                "expires_at".into(),
                Value::String(expires_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        }
        debug!(auth_id = %auth.id, "codex token refresh succeeded");
        Ok(refreshed)
    }

    fn prepare_request(
        &self,
        mut builder: reqwest::RequestBuilder,
        auth: &Auth,
    ) -> reqwest::RequestBuilder {
        if let Some(bearer) = Self::bearer(auth) {
            builder = builder.bearer_auth(bearer);
        }
        if let Some(account_id) = auth.metadata_str("account_id") {
            builder = builder.header("chatgpt-account-id", account_id);
        }
        apply_custom_headers(builder, auth)
    }

    async fn http_request(
        &self,
        auth: &Auth,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, Error> {
        self.prepare_request(builder, auth)
            .send()
            .await
            .map_err(error_from_transport)
    }
}
