// HTTP/SSE client for the running agent server.
// Session creation, prompt delivery, abort, and the /event push stream.
// Request/response calls share a circuit breaker so a wedged server degrades
// fast instead of stacking up timeouts.

use crate::config::ModelRef;
use crate::error::{Result, TaskwingError};
use crate::protocol::{decode_agent_event, AgentEvent};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const OPERATION_TIMEOUT: Duration = Duration::from_secs(300);
const ABORT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_FAILURES: u32 = 3;
const COOLDOWN: Duration = Duration::from_secs(30);

/// One conversational run held by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub directory: Option<String>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    directory: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct TextPartInput<'a> {
    #[serde(rename = "type")]
    part_type: &'static str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct PromptRequest<'a> {
    parts: Vec<TextPartInput<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a ModelRef>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Trips open after consecutive remote failures, blocking further calls for
/// a cooldown, then lets one probe through half-open.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
        }
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        if self.failure_count >= MAX_FAILURES {
            tracing::warn!(
                "Agent client circuit opened after {} failures",
                self.failure_count
            );
            self.state = CircuitState::Open;
        }
    }

    pub fn can_execute(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if let Some(last_failure) = self.last_failure {
                    if last_failure.elapsed() >= COOLDOWN {
                        tracing::info!("Agent client circuit entering half-open state");
                        self.state = CircuitState::HalfOpen;
                        return true;
                    }
                }
                false
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AgentClient {
    base_url: String,
    http: Client,
    /// No global timeout; used for the long-lived event stream.
    stream: Client,
    breaker: Mutex<CircuitBreaker>,
}

impl AgentClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = Client::builder()
            .timeout(OPERATION_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");
        let stream = Client::builder()
            .http1_only()
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .expect("Failed to create stream client");
        Self {
            base_url,
            http,
            stream,
            breaker: Mutex::new(CircuitBreaker::new()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check_breaker(&self) -> Result<()> {
        if self.breaker.lock().await.can_execute() {
            Ok(())
        } else {
            Err(TaskwingError::Server(
                "Agent server circuit breaker is open (cooling down after repeated failures)"
                    .to_string(),
            ))
        }
    }

    async fn record_success(&self) {
        self.breaker.lock().await.record_success();
    }

    async fn record_failure(&self) {
        self.breaker.lock().await.record_failure();
    }

    /// Create a new session, optionally scoped to a working directory.
    pub async fn create_session(&self, directory: Option<&str>) -> Result<Session> {
        self.check_breaker().await?;

        let url = format!("{}/session", self.base_url);
        tracing::debug!("Creating session at {}", url);
        let response = self
            .http
            .post(&url)
            .json(&CreateSessionRequest { directory })
            .send()
            .await
            .map_err(|e| TaskwingError::Server(format!("Failed to create session: {}", e)))?;

        let created: CreateSessionResponse = self.handle_response(response).await?;
        Ok(Session {
            id: created.id,
            directory: directory.map(str::to_string),
            created: Utc::now(),
        })
    }

    /// Inject a user turn into the session. The server accepts the prompt
    /// and streams the resulting activity over `/event`; this call returns
    /// on acceptance.
    pub async fn send_prompt(
        &self,
        session_id: &str,
        text: &str,
        model: Option<&ModelRef>,
    ) -> Result<()> {
        self.check_breaker().await?;

        let url = format!("{}/session/{}/message", self.base_url, session_id);
        let request = PromptRequest {
            parts: vec![TextPartInput {
                part_type: "text",
                text,
            }],
            model,
        };
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| TaskwingError::Server(format!("Failed to send prompt: {}", e)))?;

        if response.status().is_success() {
            self.record_success().await;
            Ok(())
        } else {
            self.record_failure().await;
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(TaskwingError::Server(format!(
                "Prompt rejected ({}): {}",
                status, body
            )))
        }
    }

    /// Request abort of any in-flight generation in the session. Cancel
    /// paths treat failures here as best-effort, so this never trips the
    /// circuit breaker.
    pub async fn abort_session(&self, session_id: &str) -> Result<()> {
        let url = format!("{}/session/{}/abort", self.base_url, session_id);
        let response = self
            .http
            .post(&url)
            .timeout(ABORT_TIMEOUT)
            .send()
            .await
            .map_err(|e| TaskwingError::Server(format!("Failed to abort session: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(TaskwingError::Server(format!(
                "Abort rejected ({})",
                response.status()
            )))
        }
    }

    /// Subscribe to the server's push event stream (`GET /event`, SSE).
    /// Carries events for every session the server multiplexes; callers
    /// filter by session id.
    pub async fn subscribe_events(&self) -> Result<impl futures::Stream<Item = Result<AgentEvent>>> {
        self.check_breaker().await?;

        let url = format!("{}/event", self.base_url);
        tracing::debug!("Subscribing to events at {}", url);
        let response = self
            .stream
            .get(&url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| TaskwingError::Server(format!("Failed to subscribe to events: {}", e)))?;

        if !response.status().is_success() {
            self.record_failure().await;
            return Err(TaskwingError::Server(format!(
                "Event subscription failed: {}",
                response.status()
            )));
        }
        self.record_success().await;

        let byte_stream = response.bytes_stream();

        Ok(async_stream::stream! {
            let mut buffer = String::new();
            futures::pin_mut!(byte_stream);

            while let Some(chunk_result) = byte_stream.next().await {
                match chunk_result {
                    Ok(chunk) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(data) = parse_sse_data(&mut buffer) {
                            if data == "[DONE]" {
                                continue;
                            }
                            match serde_json::from_str::<serde_json::Value>(&data) {
                                Ok(value) => {
                                    if let Some(event) = decode_agent_event(&value) {
                                        yield Ok(event);
                                    }
                                }
                                Err(e) => {
                                    tracing::debug!("Dropping undecodable SSE payload: {} - {}", e, data);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Event stream error: {}", e);
                        yield Err(TaskwingError::Server(format!("Stream error: {}", e)));
                        break;
                    }
                }
            }
            tracing::debug!("Event stream ended");
        })
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let url = response.url().to_string();

        if status.is_success() {
            self.record_success().await;
            let body = response
                .text()
                .await
                .map_err(|e| TaskwingError::Server(format!("Failed to read response: {}", e)))?;
            serde_json::from_str(&body).map_err(|e| {
                tracing::error!("Failed to parse response from {}: {}", url, e);
                TaskwingError::Server(format!(
                    "Failed to parse response: {}. Body: {}",
                    e,
                    &body[..body.len().min(200)]
                ))
            })
        } else {
            self.record_failure().await;
            let body = response.text().await.unwrap_or_default();
            Err(TaskwingError::Server(format!(
                "Request to {} failed ({}): {}",
                url, status, body
            )))
        }
    }
}

/// Extract the next data payload from an SSE byte buffer.
///
/// Handles `\n\n` and `\r\n\r\n` frame delimiters, the optional space after
/// `data:`, and multi-line data fields (concatenated with `\n`). Frames with
/// no data field (comments, heartbeats) are consumed and skipped.
pub(crate) fn parse_sse_data(buffer: &mut String) -> Option<String> {
    loop {
        let (end, delim_len) = if let Some(i) = buffer.find("\r\n\r\n") {
            (i, 4)
        } else if let Some(i) = buffer.find("\n\n") {
            (i, 2)
        } else {
            return None;
        };

        let frame = buffer[..end].to_string();
        buffer.drain(..end + delim_len);

        let mut data_lines: Vec<String> = Vec::new();
        for raw_line in frame.lines() {
            let line = raw_line.trim_end_matches('\r');
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start().to_string());
            }
        }
        if !data_lines.is_empty() {
            return Some(data_lines.join("\n"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PartKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_single_response_server(
        expected_path: &'static str,
        response_status: &'static str,
        response_body: &'static str,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 4096];
            let n = socket.read(&mut buf).await.expect("read");
            let req = String::from_utf8_lossy(&buf[..n]);
            let first_line = req.lines().next().unwrap_or("");
            assert!(
                first_line.contains(expected_path),
                "expected path {}, got request line {}",
                expected_path,
                first_line
            );
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                response_status,
                response_body.len(),
                response_body
            );
            socket.write_all(response.as_bytes()).await.expect("write");
        });
        format!("http://{}", addr)
    }

    #[test]
    fn sse_data_single_frame() {
        let mut buffer = String::from("data: {\"type\":\"session.idle\"}\n\n");
        assert_eq!(
            parse_sse_data(&mut buffer).as_deref(),
            Some("{\"type\":\"session.idle\"}")
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn sse_data_multi_line_concatenated() {
        let mut buffer = String::from("data: first\ndata: second\n\n");
        assert_eq!(parse_sse_data(&mut buffer).as_deref(), Some("first\nsecond"));
    }

    #[test]
    fn sse_data_crlf_and_no_space() {
        let mut buffer = String::from("event: update\r\ndata:{\"a\":1}\r\n\r\n");
        assert_eq!(parse_sse_data(&mut buffer).as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn sse_comment_frames_are_skipped() {
        let mut buffer = String::from(": keep-alive\n\ndata: real\n\n");
        assert_eq!(parse_sse_data(&mut buffer).as_deref(), Some("real"));
    }

    #[test]
    fn sse_partial_frame_waits_for_more() {
        let mut buffer = String::from("data: incompl");
        assert_eq!(parse_sse_data(&mut buffer), None);
        assert_eq!(buffer, "data: incompl");
    }

    #[test]
    fn circuit_breaker_opens_and_recovers() {
        let mut breaker = CircuitBreaker::new();
        assert!(breaker.can_execute());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.can_execute());
        breaker.record_failure();
        assert!(!breaker.can_execute());
        breaker.state = CircuitState::HalfOpen;
        breaker.record_success();
        assert!(breaker.can_execute());
    }

    #[tokio::test]
    async fn create_session_parses_id() {
        let base = spawn_single_response_server(
            "POST /session",
            "200 OK",
            r#"{"id":"ses_abc","title":"ignored"}"#,
        )
        .await;
        let client = AgentClient::new(base);
        let session = client.create_session(Some("/tmp/work")).await.expect("session");
        assert_eq!(session.id, "ses_abc");
        assert_eq!(session.directory.as_deref(), Some("/tmp/work"));
    }

    #[tokio::test]
    async fn send_prompt_accepts_success_status() {
        let base =
            spawn_single_response_server("POST /session/ses_1/message", "204 No Content", "").await;
        let client = AgentClient::new(base);
        client
            .send_prompt("ses_1", "do the thing", None)
            .await
            .expect("prompt accepted");
    }

    #[tokio::test]
    async fn send_prompt_surfaces_rejection() {
        let base = spawn_single_response_server(
            "POST /session/ses_1/message",
            "500 Internal Server Error",
            "boom",
        )
        .await;
        let client = AgentClient::new(base);
        let err = client
            .send_prompt("ses_1", "do the thing", None)
            .await
            .expect_err("rejection");
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn subscribe_events_decodes_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let head =
                "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";
            socket.write_all(head.as_bytes()).await.expect("head");
            let frames = concat!(
                "data: {\"type\":\"message.part.updated\",\"properties\":{\"part\":{\"id\":\"p1\",\"sessionID\":\"s1\",\"messageID\":\"m1\",\"type\":\"text\",\"text\":\"hi\",\"time\":{\"start\":1,\"end\":2}}}}\n\n",
                "data: {\"type\":\"server.heartbeat\",\"properties\":{}}\n\n",
                "data: {\"type\":\"session.idle\",\"properties\":{\"sessionID\":\"s1\"}}\n\n",
            );
            socket.write_all(frames.as_bytes()).await.expect("frames");
        });

        let client = AgentClient::new(format!("http://{}", addr));
        let stream = client.subscribe_events().await.expect("subscribe");
        futures::pin_mut!(stream);

        let mut events = Vec::new();
        while let Some(item) = stream.next().await {
            events.push(item.expect("event"));
        }
        // The heartbeat is filtered out at the decode boundary.
        assert_eq!(events.len(), 2);
        match &events[0] {
            AgentEvent::PartUpdated { part } => {
                assert_eq!(part.session_id, "s1");
                assert!(matches!(part.kind, PartKind::Text { .. }));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(&events[1], AgentEvent::SessionIdle { session_id } if session_id == "s1"));
    }
}
