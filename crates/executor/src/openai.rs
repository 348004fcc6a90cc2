//! OpenAI-compatible executor.
//!
//! Drives any chat-completions-shaped upstream (self-hosted gateways, vendor
//! compatibility endpoints). The provider identifier is configurable so one
//! binary can register several compatible pools side by side.

use async_trait::async_trait;
use credential::{Auth, Error};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::http::{
    apply_custom_headers, client_for, error_from_response, error_from_transport,
    local_token_estimate, mutate_json_payload,
};
use crate::sse::{pump_response, OpenAiProtocol};
use crate::{Executor, Options, Request, Response, StreamReceiver, STREAM_CHANNEL_CAPACITY};

/// Executor for OpenAI-compatible upstreams.
#[derive(Debug)]
pub struct OpenAiCompatExecutor {
    identifier: String,
}

impl OpenAiCompatExecutor {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }

    fn completions_url(auth: &Auth) -> Result<String, Error> {
        let base = auth.attribute("base_url").ok_or_else(|| {
            Error::new("", "openai-compatible auth has no base_url attribute", 400)
        })?;
        Ok(format!("{}/chat/completions", base.trim_end_matches('/')))
    }

    async fn post_completions(
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
            .post(Self::completions_url(auth)?)
            .header("Content-Type", "application/json")
            .body(body);
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }
        builder = self.prepare_request(builder, auth);
        builder.send().await.map_err(error_from_transport)
    }
}

#[async_trait]
impl Executor for OpenAiCompatExecutor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn execute(&self, auth: &Auth, req: Request, _opts: Options) -> Result<Response, Error> {
        let resp = self.post_completions(auth, &req, false).await?;
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
        let resp = self.post_completions(auth, &req, true).await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(pump_response(OpenAiProtocol, resp, tx));
        Ok(rx)
    }

    async fn count_tokens(
        &self,
        _auth: &Auth,
        req: Request,
        _opts: Options,
    ) -> Result<Response, Error> {
        Ok(local_token_estimate(&req.payload))
    }

    async fn refresh(&self, auth: &Auth) -> Result<Auth, Error> {
        // API-key upstreams have nothing to rotate.
        Ok(auth.clone())
    }

    fn prepare_request(
        &self,
        mut builder: reqwest::RequestBuilder,
        auth: &Auth,
    ) -> reqwest::RequestBuilder {
        if let Some(api_key) = auth.attribute("api_key") {
            builder = builder.bearer_auth(api_key);
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
    fn identifier_is_configurable() {
        assert_eq!(OpenAiCompatExecutor::new("openai").identifier(), "openai");
        assert_eq!(
            OpenAiCompatExecutor::new("local-vllm").identifier(),
            "local-vllm"
        );
    }

    #[test]
    fn completions_url_requires_base_url() {
        assert!(OpenAiCompatExecutor::completions_url(&Auth::default()).is_err());
        let mut auth = Auth::default();
        auth.attributes
            .insert("base_url".into(), "http://localhost:8000/v1/".into());
        assert_eq!(
            OpenAiCompatExecutor::completions_url(&auth).unwrap(),
            "http://localhost:8000/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn refresh_is_identity_for_api_keys() {
        let mut auth = Auth::default();
        auth.id = "acct-1".into();
        let refreshed = OpenAiCompatExecutor::new("openai")
            .refresh(&auth)
            .await
            .unwrap();
        assert_eq!(refreshed.id, "acct-1");
    }
}
