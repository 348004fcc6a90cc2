//! SSE streaming discipline.
//!
//! Upstream SSE protocols differ in how they mark completion and failure;
//! each executor supplies an [`SseProtocol`] and the shared pump enforces the
//! channel contract: payload chunks in upstream order, at most one error
//! chunk, and a synthetic `stream_disconnected_before_completion` error at
//! status 408 when the stream closes without a terminal event.

use credential::Error;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::StreamChunk;

const DATA_TAG: &str = "data:";
const EVENT_TAG: &str = "event:";
const DONE_SENTINEL: &str = "[DONE]";

/// Retry-after keys copied from failed-event payloads into the synthesized
/// error body so the classifier can parse them downstream.
const RETRY_AFTER_KEYS: &[&str] = &[
    "resets_in_seconds",
    "retry_after_seconds",
    "retry_in_seconds",
    "reset_in_seconds",
    "resets_at",
    "reset_at",
    "retry_after_at",
    "retry_at",
    "retry_after",
];

/// How the pump should treat one SSE event.
pub enum SseDisposition {
    /// Forward the data bytes downstream.
    Payload,
    /// Forward the data bytes and mark the stream complete.
    Terminal,
    /// Emit this error chunk and stop.
    Failure(Error),
    /// Drop the event.
    Skip,
}

/// Protocol-specific event classification.
pub trait SseProtocol: Send + Sync {
    fn classify(&self, event_type: &str, data: &Value) -> SseDisposition;

    /// Whether a bare `data: [DONE]` line marks completion.
    fn done_sentinel_is_terminal(&self) -> bool {
        false
    }

    /// Whether a close without a terminal event is a premature disconnect.
    fn requires_terminal(&self) -> bool {
        true
    }
}

/// Codex (OpenAI Responses) discipline: `response.completed`/`response.done`
/// terminate; `response.failed` maps through the code→status table;
/// `response.incomplete` maps to 408.
pub struct CodexProtocol;

impl SseProtocol for CodexProtocol {
    fn classify(&self, event_type: &str, data: &Value) -> SseDisposition {
        match event_type {
            "response.completed" | "response.done" => SseDisposition::Terminal,
            "response.failed" => SseDisposition::Failure(failed_stream_error(data)),
            "response.incomplete" => SseDisposition::Failure(incomplete_stream_error(data)),
            "" => SseDisposition::Skip,
            _ => SseDisposition::Payload,
        }
    }
}

/// Claude messages discipline: `message_stop` terminates; an `error` event
/// carries the upstream error body.
pub struct ClaudeProtocol;

impl SseProtocol for ClaudeProtocol {
    fn classify(&self, event_type: &str, data: &Value) -> SseDisposition {
        match event_type {
            "message_stop" => SseDisposition::Terminal,
            "error" => {
                let status = match data
                    .pointer("/error/type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                {
                    "rate_limit_error" => 429,
                    "authentication_error" => 401,
                    "permission_error" => 403,
                    "overloaded_error" => 503,
                    _ => 502,
                };
                let mut err = Error::new("", data.to_string(), status);
                err.retryable = matches!(status, 429 | 503 | 502);
                SseDisposition::Failure(err)
            }
            "" => SseDisposition::Skip,
            _ => SseDisposition::Payload,
        }
    }
}

/// OpenAI chat-completions discipline: `data: [DONE]` terminates; there is no
/// in-band failure event (failures arrive as HTTP errors before streaming).
pub struct OpenAiProtocol;

impl SseProtocol for OpenAiProtocol {
    fn classify(&self, _event_type: &str, _data: &Value) -> SseDisposition {
        SseDisposition::Payload
    }

    fn done_sentinel_is_terminal(&self) -> bool {
        true
    }
}

/// Gemini discipline: a candidate with a `finishReason` terminates; a
/// top-level `error` object carries the failure.
pub struct GeminiProtocol;

impl SseProtocol for GeminiProtocol {
    fn classify(&self, _event_type: &str, data: &Value) -> SseDisposition {
        if let Some(error) = data.get("error") {
            let status = error
                .get("code")
                .and_then(Value::as_u64)
                .map(|c| c as u16)
                .unwrap_or(502);
            let mut err = Error::new("", data.to_string(), status);
            err.retryable = matches!(status, 429 | 500 | 502 | 503 | 504);
            return SseDisposition::Failure(err);
        }
        let finished = data
            .pointer("/candidates/0/finishReason")
            .and_then(Value::as_str)
            .map(|r| !r.trim().is_empty())
            .unwrap_or(false);
        if finished {
            SseDisposition::Terminal
        } else {
            SseDisposition::Payload
        }
    }
}

/// Map a codex `response.failed` error code onto an HTTP status.
pub fn status_from_failed_code(code: &str) -> u16 {
    match code.trim().to_ascii_lowercase().as_str() {
        "rate_limit_exceeded" | "insufficient_quota" | "quota_exceeded" | "usage_limit_exceeded" => {
            429
        }
        "invalid_prompt" | "context_length_exceeded" | "invalid_request"
        | "invalid_request_error" | "bad_request" => 400,
        "workspace_deactivated" | "deactivated_workspace" | "payment_required" => 402,
        "forbidden" | "access_denied" | "permission_denied" => 403,
        "unauthorized" | "invalid_api_key" | "authentication_error" | "token_invalidated"
        | "workspace_unauthorized" => 401,
        "server_overloaded" | "overloaded" | "service_unavailable" => 503,
        _ => 502,
    }
}

/// Build the error for a `response.failed` event. Retry-after keys from the
/// payload are copied into the synthesized body for the classifier.
pub fn failed_stream_error(data: &Value) -> Error {
    let code = data
        .pointer("/response/error/code")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    let mut message = data
        .pointer("/response/error/message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    if message.is_empty() {
        message = "response.failed event received".to_string();
    }

    let mut error_node = Map::new();
    error_node.insert("message".into(), Value::String(message.clone()));
    if !code.is_empty() {
        error_node.insert("code".into(), Value::String(code.clone()));
    }
    for key in RETRY_AFTER_KEYS {
        if let Some(value) = data.pointer(&format!("/response/error/{key}")) {
            error_node.insert((*key).to_string(), value.clone());
        }
    }

    let payload = json!({
        "type": "response.failed",
        "message": message,
        "error": Value::Object(error_node),
    });
    let mut err = Error::new("", payload.to_string(), status_from_failed_code(&code));
    err.retryable = matches!(err.http_status, 429 | 503 | 502);
    err
}

/// Build the 408 error for a `response.incomplete` event.
pub fn incomplete_stream_error(data: &Value) -> Error {
    let reason = data
        .pointer("/response/incomplete_details/reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    let message = if reason.is_empty() {
        "Incomplete response returned, reason: unknown".to_string()
    } else {
        format!("Incomplete response returned, reason: {reason}")
    };
    let payload = json!({
        "type": "response.incomplete",
        "message": message,
        "error": {
            "code": "response_incomplete",
            "message": message,
            "reason": reason,
        }
    });
    Error::new("", payload.to_string(), 408).retryable()
}

/// Build the synthetic error for a stream that closed without a terminal
/// event.
pub fn disconnect_error(cause: &str, last_event_type: &str, chunks_seen: usize) -> Error {
    let cause = if cause.trim().is_empty() {
        "no_terminal_event"
    } else {
        cause.trim()
    };
    let payload = json!({
        "type": "stream.disconnected",
        "message": "stream disconnected before completion",
        "error": {
            "code": "stream_disconnected_before_completion",
            "message": "stream closed before a terminal event",
            "cause": cause,
            "last_event_type": last_event_type,
            "chunks_seen": chunks_seen,
        }
    });
    Error::new(
        "stream_disconnected_before_completion",
        payload.to_string(),
        408,
    )
    .retryable()
}

/// Incremental SSE pump state. Executors feed decoded lines; the pump owns
/// the downstream channel contract.
pub struct SsePump<P: SseProtocol> {
    protocol: P,
    tx: mpsc::Sender<StreamChunk>,
    buffer: String,
    current_event: String,
    last_event_type: String,
    chunks_seen: usize,
    saw_terminal: bool,
    finished: bool,
}

impl<P: SseProtocol> SsePump<P> {
    pub fn new(protocol: P, tx: mpsc::Sender<StreamChunk>) -> Self {
        Self {
            protocol,
            tx,
            buffer: String::new(),
            current_event: String::new(),
            last_event_type: String::new(),
            chunks_seen: 0,
            saw_terminal: false,
            finished: false,
        }
    }

    /// Feed one decoded line. Returns `false` once the stream is finished
    /// (terminal seen or error emitted) and the caller should stop reading.
    pub async fn feed_line(&mut self, line: &str) -> bool {
        if self.finished {
            return false;
        }
        let line = line.trim();
        if let Some(event_type) = line.strip_prefix(EVENT_TAG) {
            self.current_event = event_type.trim().to_string();
            return true;
        }
        let Some(data) = line.strip_prefix(DATA_TAG) else {
            return true;
        };
        let data = data.trim();
        if data.is_empty() {
            return true;
        }
        if data == DONE_SENTINEL {
            if self.protocol.done_sentinel_is_terminal() {
                self.saw_terminal = true;
                self.finished = true;
                return false;
            }
            return true;
        }
        let Ok(parsed) = serde_json::from_str::<Value>(data) else {
            return true;
        };
        let event_type = parsed
            .get("type")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(self.current_event.as_str())
            .to_string();
        self.last_event_type = event_type.clone();

        match self.protocol.classify(&event_type, &parsed) {
            SseDisposition::Payload => {
                self.chunks_seen += 1;
                if self.tx.send(Ok(data.as_bytes().to_vec())).await.is_err() {
                    self.finished = true;
                    return false;
                }
                true
            }
            SseDisposition::Terminal => {
                self.chunks_seen += 1;
                let _ = self.tx.send(Ok(data.as_bytes().to_vec())).await;
                self.saw_terminal = true;
                self.finished = true;
                false
            }
            SseDisposition::Failure(err) => {
                debug!(event_type, status = err.http_status, "sse failure event");
                let _ = self.tx.send(Err(err)).await;
                self.finished = true;
                false
            }
            SseDisposition::Skip => true,
        }
    }

    /// Feed a decoded byte chunk, splitting buffered lines.
    pub async fn feed_bytes(&mut self, bytes: &[u8]) -> bool {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            if !self.feed_line(line.trim_end_matches(['\r', '\n'])).await {
                return false;
            }
        }
        true
    }

    /// Signal end of upstream bytes. Emits the synthetic disconnect error if
    /// the protocol required a terminal event that never arrived.
    pub async fn finish(mut self) {
        if self.finished || !self.protocol.requires_terminal() || self.saw_terminal {
            return;
        }
        let err = disconnect_error("no_terminal_event", &self.last_event_type, self.chunks_seen);
        let _ = self.tx.send(Err(err)).await;
        self.finished = true;
    }

    /// Signal a transport failure mid-stream.
    pub async fn fail_transport(mut self, err: Error) {
        if self.finished {
            return;
        }
        let _ = self.tx.send(Err(err)).await;
        self.finished = true;
    }
}

/// Drive a full upstream response through the pump.
pub async fn pump_response<P: SseProtocol>(
    protocol: P,
    resp: reqwest::Response,
    tx: mpsc::Sender<StreamChunk>,
) {
    let mut pump = SsePump::new(protocol, tx);
    let mut stream = resp.bytes_stream();
    while let Some(next) = stream.next().await {
        match next {
            Ok(bytes) => {
                if !pump.feed_bytes(&bytes).await {
                    return;
                }
            }
            Err(e) => {
                pump.fail_transport(crate::http::error_from_transport(e)).await;
                return;
            }
        }
    }
    pump.finish().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drive(lines: &[&str], close: bool) -> Vec<StreamChunk> {
        let (tx, mut rx) = mpsc::channel(64);
        let mut pump = SsePump::new(CodexProtocol, tx);
        for line in lines {
            if !pump.feed_line(line).await {
                break;
            }
        }
        if close {
            pump.finish().await;
        } else {
            drop(pump);
        }
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn payload_chunks_preserve_order_and_terminal_closes() {
        let chunks = drive(
            &[
                r#"data: {"type":"response.output_text.delta","delta":"a"}"#,
                r#"data: {"type":"response.output_text.delta","delta":"b"}"#,
                r#"data: {"type":"response.completed","response":{}}"#,
            ],
            true,
        )
        .await;
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.is_ok()));
        let first = String::from_utf8(chunks[0].as_ref().unwrap().clone()).unwrap();
        assert!(first.contains(r#""delta":"a""#));
    }

    #[tokio::test]
    async fn failed_event_maps_code_to_status_and_copies_retry_keys() {
        let chunks = drive(
            &[
                r#"data: {"type":"response.failed","response":{"error":{"code":"rate_limit_exceeded","message":"slow down","resets_in_seconds":18000}}}"#,
            ],
            true,
        )
        .await;
        assert_eq!(chunks.len(), 1);
        let err = chunks[0].as_ref().unwrap_err();
        assert_eq!(err.http_status, 429);
        let body: Value = serde_json::from_str(&err.message).unwrap();
        assert_eq!(body["error"]["resets_in_seconds"], 18000);
        assert_eq!(body["error"]["code"], "rate_limit_exceeded");
    }

    #[tokio::test]
    async fn incomplete_event_maps_to_408() {
        let chunks = drive(
            &[
                r#"data: {"type":"response.incomplete","response":{"incomplete_details":{"reason":"max_output_tokens"}}}"#,
            ],
            true,
        )
        .await;
        let err = chunks[0].as_ref().unwrap_err();
        assert_eq!(err.http_status, 408);
        assert!(err.message.contains("max_output_tokens"));
    }

    #[tokio::test]
    async fn close_without_terminal_synthesizes_disconnect() {
        let chunks = drive(
            &[r#"data: {"type":"response.output_text.delta","delta":"a"}"#],
            true,
        )
        .await;
        assert_eq!(chunks.len(), 2);
        let err = chunks[1].as_ref().unwrap_err();
        assert_eq!(err.code, "stream_disconnected_before_completion");
        assert_eq!(err.http_status, 408);
        let body: Value = serde_json::from_str(&err.message).unwrap();
        assert_eq!(body["error"]["chunks_seen"], 1);
        assert_eq!(body["error"]["last_event_type"], "response.output_text.delta");
    }

    #[tokio::test]
    async fn event_header_lines_classify_payloads_without_type_field() {
        let chunks = drive(
            &[
                "event: response.output_text.delta",
                r#"data: {"delta":"a"}"#,
                "event: response.completed",
                r#"data: {"response":{}}"#,
            ],
            true,
        )
        .await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.is_ok()));
    }

    #[test]
    fn failed_code_table() {
        assert_eq!(status_from_failed_code("rate_limit_exceeded"), 429);
        assert_eq!(status_from_failed_code("insufficient_quota"), 429);
        assert_eq!(status_from_failed_code("workspace_deactivated"), 402);
        assert_eq!(status_from_failed_code("unauthorized"), 401);
        assert_eq!(status_from_failed_code("token_invalidated"), 401);
        assert_eq!(status_from_failed_code("server_overloaded"), 503);
        assert_eq!(status_from_failed_code("invalid_request"), 400);
        assert_eq!(status_from_failed_code("something_else"), 502);
    }

    #[tokio::test]
    async fn openai_done_sentinel_terminates() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut pump = SsePump::new(OpenAiProtocol, tx);
        assert!(pump.feed_line(r#"data: {"choices":[]}"#).await);
        assert!(!pump.feed_line("data: [DONE]").await);
        pump.finish().await;
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_ok());
    }

    #[tokio::test]
    async fn claude_error_event_maps_rate_limit() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut pump = SsePump::new(ClaudeProtocol, tx);
        assert!(
            !pump
                .feed_line(
                    r#"data: {"type":"error","error":{"type":"rate_limit_error","message":"limit"}}"#
                )
                .await
        );
        drop(pump);
        let chunk = rx.recv().await.unwrap();
        assert_eq!(chunk.unwrap_err().http_status, 429);
    }

    #[tokio::test]
    async fn gemini_finish_reason_is_terminal() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut pump = SsePump::new(GeminiProtocol, tx);
        assert!(pump.feed_line(r#"data: {"candidates":[{"content":{}}]}"#).await);
        assert!(
            !pump
                .feed_line(r#"data: {"candidates":[{"finishReason":"STOP"}]}"#)
                .await
        );
        pump.finish().await;
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.is_ok()));
    }

    #[tokio::test]
    async fn split_bytes_across_chunk_boundaries() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut pump = SsePump::new(CodexProtocol, tx);
        let full = "data: {\"type\":\"response.output_text.delta\",\"delta\":\"a\"}\n";
        let (a, b) = full.split_at(17);
        assert!(pump.feed_bytes(a.as_bytes()).await);
        assert!(pump.feed_bytes(b.as_bytes()).await);
        drop(pump);
        assert!(rx.recv().await.unwrap().is_ok());
    }
}
