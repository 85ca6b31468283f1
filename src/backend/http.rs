use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::conversation_store::{ConversationRef, Message};

use super::{AnalysisError, AnalysisResult, ChunkSink, DeliveryError, MessageBackend};

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8787";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 180;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BACKEND_URL.to_string(),
            api_key: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl HttpBackendConfig {
    pub fn from_env() -> Self {
        Self::from_env_with_base_url(None)
    }

    /// Like `from_env`, with `base_url` taking the place of the built-in
    /// default. `CHAT_BACKEND_URL` still wins when set.
    pub fn from_env_with_base_url(base_url: Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(base_url) = base_url {
            config.base_url = base_url;
        }

        if let Some(base_url) = read_non_empty_env("CHAT_BACKEND_URL") {
            config.base_url = base_url;
        }

        config.api_key = read_non_empty_env("CHAT_BACKEND_API_KEY");

        if let Some(timeout_secs) = read_u64_env("CHAT_BACKEND_TIMEOUT_SECS") {
            config.request_timeout_secs = timeout_secs.max(1);
        }

        if let Some(timeout_secs) = read_u64_env("CHAT_BACKEND_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout_secs = timeout_secs.max(1);
        }

        debug!(
            base_url = %config.base_url,
            has_api_key = config.api_key.is_some(),
            request_timeout_secs = config.request_timeout_secs,
            "loaded chat backend config"
        );
        config
    }
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self, String> {
        let base_url = Url::parse(config.base_url.trim())
            .map_err(|error| format!("Invalid chat backend URL `{}`: {error}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            return Err(format!(
                "Chat backend URL `{}` cannot be used as a base",
                config.base_url
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
            .build()
            .map_err(|error| format!("Failed to build chat backend HTTP client: {error}"))?;

        info!(
            base_url = %base_url,
            request_timeout_secs = config.request_timeout_secs,
            "chat backend client initialized"
        );

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(api_key) => request.bearer_auth(api_key),
            None => request,
        }
    }
}

#[derive(Debug, Serialize)]
struct TextRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    Delta {
        text: String,
    },
    Done,
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ErrorBody>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

#[async_trait]
impl MessageBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send_message_stream(
        &self,
        text: &str,
        target: &ConversationRef,
        on_chunk: ChunkSink<'_>,
    ) -> Result<(), DeliveryError> {
        let url = self.endpoint(&["conversations", target.as_str(), "messages"]);
        debug!(conversation = %target, chars = text.chars().count(), "opening reply stream");

        let response = self
            .authorized(self.client.post(url))
            .json(&TextRequest { text })
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            return Err(map_http_error(response).await);
        }

        let mut body = response.bytes_stream();
        let mut decoder = LineDecoder::default();
        let mut chunk_count = 0_usize;

        while let Some(next) = body.next().await {
            let bytes = next.map_err(map_transport_error)?;
            for line in decoder.push(&bytes) {
                if apply_stream_line(&line, on_chunk, &mut chunk_count)? {
                    debug!(conversation = %target, chunk_count, "reply stream completed");
                    return Ok(());
                }
            }
        }

        if let Some(line) = decoder.finish() {
            if apply_stream_line(&line, on_chunk, &mut chunk_count)? {
                debug!(conversation = %target, chunk_count, "reply stream completed");
                return Ok(());
            }
        }

        warn!(conversation = %target, chunk_count, "reply stream closed before completion");
        Err(DeliveryError::NetworkInterrupted(
            "Reply stream closed before completion".to_string(),
        ))
    }

    async fn analyze_message(&self, text: &str) -> Result<AnalysisResult, AnalysisError> {
        let response = self
            .authorized(self.client.post(self.endpoint(&["analyze"])))
            .json(&TextRequest { text })
            .send()
            .await
            .map_err(|error| AnalysisError::Unavailable(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AnalysisError::Unavailable(format!(
                "Analysis request failed with status {}",
                status.as_u16()
            )));
        }

        response
            .json::<AnalysisResult>()
            .await
            .map_err(|error| AnalysisError::InvalidResponse(error.to_string()))
    }

    async fn fetch_messages(&self, target: &ConversationRef) -> Result<Vec<Message>, DeliveryError> {
        let url = self.endpoint(&["conversations", target.as_str(), "messages"]);
        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            return Err(map_http_error(response).await);
        }

        let messages = response
            .json::<Vec<Message>>()
            .await
            .map_err(|error| DeliveryError::Unknown(format!("Invalid history payload: {error}")))?;
        debug!(conversation = %target, count = messages.len(), "fetched conversation history");
        Ok(messages)
    }
}

/// Returns `Ok(true)` once the terminating event has been seen.
fn apply_stream_line(
    line: &str,
    on_chunk: ChunkSink<'_>,
    chunk_count: &mut usize,
) -> Result<bool, DeliveryError> {
    let event = serde_json::from_str::<StreamEvent>(line).map_err(|error| {
        DeliveryError::Unknown(format!("Malformed reply stream event: {error}"))
    })?;

    match event {
        StreamEvent::Delta { text } => {
            if !text.is_empty() {
                *chunk_count += 1;
                on_chunk(&text);
            }
            Ok(false)
        }
        StreamEvent::Done => Ok(true),
        StreamEvent::Error { message } => Err(DeliveryError::Unknown(
            normalize_optional_string(message)
                .unwrap_or_else(|| "Backend aborted the reply".to_string()),
        )),
        StreamEvent::Ignored => Ok(false),
    }
}

/// Splits a byte stream into newline-terminated lines. Bytes are buffered until
/// a full line arrives so multi-byte characters split across reads survive.
#[derive(Debug, Default)]
struct LineDecoder {
    buffer: BytesMut,
}

impl LineDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(newline_index) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw_line = self.buffer.split_to(newline_index + 1);
            if let Some(line) = decode_line(&raw_line) {
                lines.push(line);
            }
        }

        lines
    }

    fn finish(&mut self) -> Option<String> {
        let remainder = self.buffer.split();
        decode_line(&remainder)
    }
}

fn decode_line(raw_line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(raw_line);
    let trimmed = line.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn map_transport_error(error: reqwest::Error) -> DeliveryError {
    if error.is_builder() || error.is_redirect() {
        DeliveryError::Unknown(error.to_string())
    } else {
        DeliveryError::NetworkInterrupted(error.to_string())
    }
}

async fn map_http_error(response: Response) -> DeliveryError {
    let status = response.status();
    let response_body = response.text().await.unwrap_or_default();
    let message = parse_error_message(&response_body)
        .unwrap_or_else(|| format!("Backend request failed with status {}", status.as_u16()));
    debug!(status = status.as_u16(), "mapped chat backend HTTP error response");

    if status.is_client_error() && status != StatusCode::REQUEST_TIMEOUT {
        DeliveryError::Rejected(message)
    } else {
        DeliveryError::Unknown(message)
    }
}

fn parse_error_message(raw_body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ErrorEnvelope>(raw_body).ok()?;

    parsed
        .error
        .and_then(|body| normalize_optional_string(body.message))
        .or_else(|| normalize_optional_string(parsed.message))
}

fn normalize_optional_string(value: Option<String>) -> Option<String> {
    value.and_then(|content| {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use mockito::{Matcher, Server};
    use serde_json::json;

    use crate::backend::IntentCategory;

    use super::*;

    fn backend_for_test(server: &Server, api_key: Option<&str>) -> HttpBackend {
        HttpBackend::new(HttpBackendConfig {
            base_url: server.url(),
            api_key: api_key.map(ToString::to_string),
            request_timeout_secs: 5,
            connect_timeout_secs: 5,
        })
        .expect("backend should build for tests")
    }

    async fn collect_stream(
        backend: &HttpBackend,
        text: &str,
    ) -> (Result<(), DeliveryError>, Vec<String>) {
        let chunks = Mutex::new(Vec::new());
        let sink = |chunk: &str| {
            chunks
                .lock()
                .expect("chunk lock should not be poisoned")
                .push(chunk.to_string());
        };

        let result = backend
            .send_message_stream(text, &ConversationRef::new("conv-7"), &sink)
            .await;
        let chunks = chunks
            .into_inner()
            .expect("chunk lock should not be poisoned");

        (result, chunks)
    }

    #[tokio::test]
    async fn streams_delta_events_in_order_until_done() {
        let mut server = Server::new_async().await;
        let request_mock = server
            .mock("POST", "/conversations/conv-7/messages")
            .match_header("authorization", "Bearer test-key")
            .match_body(Matcher::Json(json!({ "text": "hi there" })))
            .with_status(200)
            .with_header("content-type", "application/x-ndjson")
            .with_body(
                "{\"type\":\"delta\",\"text\":\"Hel\"}\n\
                 {\"type\":\"ping\"}\n\
                 {\"type\":\"delta\",\"text\":\"lo\"}\n\
                 {\"type\":\"done\"}\n",
            )
            .create_async()
            .await;

        let backend = backend_for_test(&server, Some("test-key"));
        let (result, chunks) = collect_stream(&backend, "hi there").await;

        request_mock.assert_async().await;
        assert_eq!(result, Ok(()));
        assert_eq!(chunks, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn stream_without_done_event_is_a_network_interruption() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/conversations/conv-7/messages")
            .with_status(200)
            .with_body("{\"type\":\"delta\",\"text\":\"partial\"}\n")
            .create_async()
            .await;

        let backend = backend_for_test(&server, None);
        let (result, chunks) = collect_stream(&backend, "hello").await;

        assert!(matches!(result, Err(DeliveryError::NetworkInterrupted(_))));
        assert_eq!(chunks, vec!["partial".to_string()]);
    }

    #[tokio::test]
    async fn client_errors_are_rejections_with_backend_message() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/conversations/conv-7/messages")
            .with_status(422)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":{"message":"Message too long"}}"#)
            .create_async()
            .await;

        let backend = backend_for_test(&server, None);
        let (result, chunks) = collect_stream(&backend, "hello").await;

        assert_eq!(
            result,
            Err(DeliveryError::Rejected("Message too long".to_string()))
        );
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn server_errors_and_error_events_are_unknown_failures() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/conversations/conv-7/messages")
            .with_status(503)
            .create_async()
            .await;

        let backend = backend_for_test(&server, None);
        let (result, _) = collect_stream(&backend, "hello").await;
        assert_eq!(
            result,
            Err(DeliveryError::Unknown(
                "Backend request failed with status 503".to_string()
            ))
        );

        let mut server = Server::new_async().await;
        server
            .mock("POST", "/conversations/conv-7/messages")
            .with_status(200)
            .with_body("{\"type\":\"error\",\"message\":\"model overloaded\"}\n")
            .create_async()
            .await;

        let backend = backend_for_test(&server, None);
        let (result, _) = collect_stream(&backend, "hello").await;
        assert_eq!(
            result,
            Err(DeliveryError::Unknown("model overloaded".to_string()))
        );
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_network_interruption() {
        let backend = HttpBackend::new(HttpBackendConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: None,
            request_timeout_secs: 2,
            connect_timeout_secs: 2,
        })
        .expect("backend should build");

        let (result, chunks) = collect_stream(&backend, "hello").await;

        assert!(matches!(result, Err(DeliveryError::NetworkInterrupted(_))));
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn analyze_message_parses_intent_and_hint() {
        let mut server = Server::new_async().await;
        let request_mock = server
            .mock("POST", "/analyze")
            .match_body(Matcher::Json(json!({ "text": "my pipe burst" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"intent":"urgent","hint":"Finding quick steps"}"#)
            .create_async()
            .await;

        let backend = backend_for_test(&server, None);
        let result = backend
            .analyze_message("my pipe burst")
            .await
            .expect("analysis should succeed");

        request_mock.assert_async().await;
        assert_eq!(result.intent_category, IntentCategory::Urgent);
        assert_eq!(result.contextual_hint, "Finding quick steps");
    }

    #[tokio::test]
    async fn analyze_message_reports_unavailable_on_http_failure() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/analyze")
            .with_status(500)
            .create_async()
            .await;

        let backend = backend_for_test(&server, None);
        let error = backend
            .analyze_message("hello")
            .await
            .expect_err("analysis should fail");

        assert!(matches!(error, AnalysisError::Unavailable(_)));
    }

    #[tokio::test]
    async fn fetch_messages_returns_history_in_backend_order() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/conversations/conv-7/messages")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[
                    {"id":"m1","authorIsUser":true,"content":"hi","conversationId":"conv-7","createdAt":"2026-01-01T09:00:00Z"},
                    {"id":"m2","authorIsUser":false,"content":"hello!","conversationId":"conv-7","createdAt":"2026-01-01T09:00:02Z"}
                ]"#,
            )
            .create_async()
            .await;

        let backend = backend_for_test(&server, None);
        let messages = backend
            .fetch_messages(&ConversationRef::new("conv-7"))
            .await
            .expect("history should load");

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id.as_str(), "m1");
        assert!(messages[0].author_is_user);
        assert_eq!(messages[1].content, "hello!");
    }

    #[test]
    fn line_decoder_reassembles_lines_split_across_reads() {
        let mut decoder = LineDecoder::default();
        let payload = "{\"text\":\"caf\u{e9}\"}\r\n\n{\"b\":1}".as_bytes();
        let (first, rest) = payload.split_at(13);

        assert!(decoder.push(first).is_empty());
        assert_eq!(decoder.push(rest), vec!["{\"text\":\"caf\u{e9}\"}".to_string()]);
        assert_eq!(decoder.finish(), Some("{\"b\":1}".to_string()));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let error = HttpBackend::new(HttpBackendConfig {
            base_url: "not a url".to_string(),
            ..HttpBackendConfig::default()
        })
        .expect_err("invalid URL should fail");

        assert!(error.contains("Invalid chat backend URL"));
    }
}
