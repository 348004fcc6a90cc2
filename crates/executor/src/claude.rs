//! Claude executor (Anthropic messages API).

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use credential::{Auth, Error};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::http::{
    apply_custom_headers, client_for, error_from_response, error_from_transport,
    mutate_json_payload, oauth_refresh,
};
use crate::sse::{pump_response, ClaudeProtocol};
use crate::{Executor, Options, Request, Response, StreamReceiver, STREAM_CHANNEL_CAPACITY};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";
const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";

/// Executor for Anthropic API keys and Claude subscription OAuth tokens.
#[derive(Debug, Default)]
pub struct ClaudeExecutor;

impl ClaudeExecutor {
    pub fn new() -> Self {
        Self
    }

    fn base_url(auth: &Auth) -> String {
        auth.attribute("base_url")
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string()
    }

    async fn post_messages(
        &self,
        auth: &Auth,
        req: &Request,
        path: &str,
        stream: bool,
    ) -> Result<reqwest::Response, Error> {
        let body = mutate_json_payload(&req.payload, |payload| {
            payload.insert("model".into(), Value::String(req.model.clone()));
            if path == "/v1/messages" {
                payload.insert("stream".into(), Value::Bool(stream));
            }
        })?;
        let client = client_for(auth)?;
        let mut builder = client
            .post(format!("{}{}", Self::base_url(auth), path))
            .header("Content-Type", "application/json")
            .header("anthropic-version", ANTHROPIC_VERSION)
            .body(body);
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }
        builder = self.prepare_request(builder, auth);
        builder.send().await.map_err(error_from_transport)
    }
}

#[async_trait]
impl Executor for ClaudeExecutor {
    fn identifier(&self) -> &str {
        "claude"
    }

    async fn execute(&self, auth: &Auth, req: Request, _opts: Options) -> Result<Response, Error> {
        let resp = self.post_messages(auth, &req, "/v1/messages", false).await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let payload = resp.bytes().await.map_err(error_from_transport)?.to_vec();
        Ok(Response { payload })
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        req: Request,
        _opts: Options,
    ) -> Result<StreamReceiver, Error> {
        let resp = self.post_messages(auth, &req, "/v1/messages", true).await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(pump_response(ClaudeProtocol, resp, tx));
        Ok(rx)
    }

    async fn count_tokens(
        &self,
        auth: &Auth,
        req: Request,
        _opts: Options,
    ) -> Result<Response, Error> {
        let resp = self
            .post_messages(auth, &req, "/v1/messages/count_tokens", false)
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let payload = resp.bytes().await.map_err(error_from_transport)?.to_vec();
        Ok(Response { payload })
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
        debug!(auth_id = %auth.id, "claude token refresh succeeded");
        Ok(refreshed)
    }

    fn prepare_request(
        &self,
        mut builder: reqwest::RequestBuilder,
        auth: &Auth,
    ) -> reqwest::RequestBuilder {
        if let Some(api_key) = auth.attribute("api_key") {
            builder = builder.header("x-api-key", api_key);
        } else if let Some(access_token) = auth.metadata_str("access_token") {
            builder = builder
                .bearer_auth(access_token)
                .header("anthropic-beta", OAUTH_BETA);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_defaults_to_anthropic() {
        assert_eq!(
            ClaudeExecutor::base_url(&Auth::default()),
            "https://api.anthropic.com"
        );
        let mut auth = Auth::default();
        auth.attributes
            .insert("base_url".into(), "http://localhost:7777/".into());
        assert_eq!(ClaudeExecutor::base_url(&auth), "http://localhost:7777");
    }

    #[tokio::test]
    async fn refresh_without_token_is_unauthorized() {
        let err = ClaudeExecutor::new()
            .refresh(&Auth::default())
            .await
            .unwrap_err();
        assert_eq!(err.http_status, 401);
    }
}
