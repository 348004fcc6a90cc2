//! Per-provider executor contract.
//!
//! The auth manager drives every upstream through this narrow polymorphic
//! interface. An executor exists per provider identifier and owns request
//! preparation, upstream error translation into the [`credential::Error`]
//! shape, and the streaming error-mapping discipline the manager relies on.

pub mod claude;
pub mod codex;
pub mod gemini;
pub mod http;
pub mod openai;
pub mod sse;

use std::collections::HashMap;

use async_trait::async_trait;
use credential::{Auth, Error};
use serde_json::Value;
use tokio::sync::mpsc;

/// Metadata key carrying the client's session affinity key.
pub const SESSION_AFFINITY_KEY: &str = "session_affinity_key";
/// Metadata key carrying the model name the client originally requested.
pub const REQUESTED_MODEL_KEY: &str = "requested_model";
/// Metadata key carrying a client idempotency key.
pub const IDEMPOTENCY_KEY: &str = "idempotency_key";
/// Metadata key carrying an execution session identifier.
pub const EXECUTION_SESSION_KEY: &str = "execution_session";

/// Upstream request: the (possibly canonicalized) model plus the translated
/// payload bytes.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub model: String,
    pub payload: Vec<u8>,
}

/// Upstream response payload bytes.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub payload: Vec<u8>,
}

/// Per-call options threaded from the HTTP collaborator down to executors.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub stream: bool,
    pub alt: String,
    /// The untranslated client request, for executors that re-translate.
    pub original_request: Vec<u8>,
    /// Wire format the request arrived in (openai / claude / gemini).
    pub source_format: String,
    pub metadata: HashMap<String, Value>,
}

impl Options {
    /// String metadata lookup, trimmed; `None` when absent or blank.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// One streaming chunk: payload bytes in upstream order, or the single
/// terminal error.
pub type StreamChunk = Result<Vec<u8>, Error>;

/// Channel type executors hand back from [`Executor::execute_stream`].
pub type StreamReceiver = mpsc::Receiver<StreamChunk>;

/// Capacity of the chunk channel between an executor's producer task and the
/// manager's consumer loop.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Polymorphic per-provider operations consumed by the auth manager.
///
/// Contract:
/// - `execute` translates upstream failures into [`Error`] with an accurate
///   `http_status`; bodies that are already JSON are preserved verbatim.
/// - `execute_stream` emits payload chunks in order and at most one error
///   chunk, then closes the channel. A premature close without a terminal
///   event surfaces a synthetic `stream_disconnected_before_completion`
///   error at status 408.
/// - `refresh` rotates tokens and returns a clean auth; the manager merges
///   runtime failure state back in before storing it.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Stable provider id; matches `Auth::provider`.
    fn identifier(&self) -> &str;

    async fn execute(&self, auth: &Auth, req: Request, opts: Options) -> Result<Response, Error>;

    async fn execute_stream(
        &self,
        auth: &Auth,
        req: Request,
        opts: Options,
    ) -> Result<StreamReceiver, Error>;

    async fn count_tokens(
        &self,
        auth: &Auth,
        req: Request,
        opts: Options,
    ) -> Result<Response, Error>;

    async fn refresh(&self, auth: &Auth) -> Result<Auth, Error>;

    /// Inject this provider's credentials/headers into an arbitrary outgoing
    /// request builder.
    fn prepare_request(
        &self,
        builder: reqwest::RequestBuilder,
        auth: &Auth,
    ) -> reqwest::RequestBuilder;

    /// Tunnel an arbitrary HTTP request through a configured credential.
    async fn http_request(
        &self,
        auth: &Auth,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn options_metadata_str_trims_and_filters() {
        let mut opts = Options::default();
        opts.metadata
            .insert(SESSION_AFFINITY_KEY.into(), json!("  session-1  "));
        opts.metadata.insert(REQUESTED_MODEL_KEY.into(), json!(""));
        opts.metadata.insert(IDEMPOTENCY_KEY.into(), json!(42));

        assert_eq!(opts.metadata_str(SESSION_AFFINITY_KEY), Some("session-1"));
        assert_eq!(opts.metadata_str(REQUESTED_MODEL_KEY), None);
        assert_eq!(opts.metadata_str(IDEMPOTENCY_KEY), None);
        assert_eq!(opts.metadata_str(EXECUTION_SESSION_KEY), None);
    }
}
