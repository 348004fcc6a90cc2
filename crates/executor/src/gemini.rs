//! Gemini executor (Generative Language API).

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use credential::{Auth, Error};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::http::{
    apply_custom_headers, client_for, error_from_response, error_from_transport, oauth_refresh,
};
use crate::sse::{pump_response, GeminiProtocol};
use crate::{Executor, Options, Request, Response, StreamReceiver, STREAM_CHANNEL_CAPACITY};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Executor for Gemini API keys and Google OAuth credentials.
#[derive(Debug, Default)]
pub struct GeminiExecutor;

impl GeminiExecutor {
    pub fn new() -> Self {
        Self
    }

    fn base_url(auth: &Auth) -> String {
        auth.attribute("base_url")
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string()
    }

    fn model_url(auth: &Auth, model: &str, verb: &str, alt_sse: bool) -> String {
        let mut url = format!(
            "{}/v1beta/models/{}:{}",
            Self::base_url(auth),
            model,
            verb
        );
        if alt_sse {
            url.push_str("?alt=sse");
        }
        url
    }

    async fn post(
        &self,
        auth: &Auth,
        url: String,
        payload: &[u8],
        stream: bool,
    ) -> Result<reqwest::Response, Error> {
        let client = client_for(auth)?;
        let mut builder = client
            .post(url)
            .header("Content-Type", "application/json")
            .body(payload.to_vec());
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }
        builder = self.prepare_request(builder, auth);
        builder.send().await.map_err(error_from_transport)
    }
}

#[async_trait]
impl Executor for GeminiExecutor {
    fn identifier(&self) -> &str {
        "gemini"
    }

    async fn execute(&self, auth: &Auth, req: Request, _opts: Options) -> Result<Response, Error> {
        let url = Self::model_url(auth, &req.model, "generateContent", false);
        let resp = self.post(auth, url, &req.payload, false).await?;
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
        let url = Self::model_url(auth, &req.model, "streamGenerateContent", true);
        let resp = self.post(auth, url, &req.payload, true).await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(pump_response(GeminiProtocol, resp, tx));
        Ok(rx)
    }

    async fn count_tokens(
        &self,
        auth: &Auth,
        req: Request,
        _opts: Options,
    ) -> Result<Response, Error> {
        let url = Self::model_url(auth, &req.model, "countTokens", false);
        let resp = self.post(auth, url, &req.payload, false).await?;
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
        let client_id = auth
            .metadata_str("client_id")
            .ok_or_else(|| Error::new("unauthorized", "auth has no oauth client id", 401))?
            .to_string();
        let client_secret = auth
            .metadata_str("client_secret")
            .unwrap_or_default()
            .to_string();
        let client = client_for(auth)?;
        let token = oauth_refresh(
            &client,
            TOKEN_ENDPOINT,
            &client_id,
            &refresh_token,
            &[("client_secret", client_secret.as_str())],
        )
        .await?;

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
        debug!(auth_id = %auth.id, "gemini token refresh succeeded");
        Ok(refreshed)
    }

    fn prepare_request(
        &self,
        mut builder: reqwest::RequestBuilder,
        auth: &Auth,
    ) -> reqwest::RequestBuilder {
        if let Some(api_key) = auth.attribute("api_key") {
            builder = builder.header("x-goog-api-key", api_key);
        } else if let Some(access_token) = auth.metadata_str("access_token") {
            builder = builder.bearer_auth(access_token);
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
