//! HTTP plumbing shared by the backends

use bytes::{Buf, BytesMut};
use futures::StreamExt;
use rago_core::{CancellationToken, Component, ErrorKind, RagoError, RagoResult};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Markers backends use to report a prompt that does not fit the context window
const CONTEXT_OVERFLOW_MARKERS: &[&str] = &[
    "context_length_exceeded",
    "maximum context length",
    "context window",
    "too many tokens",
    "prompt is too long",
];

pub(crate) fn build_client(timeout: Duration) -> RagoResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| {
            RagoError::config(format!("failed to build HTTP client: {}", e))
                .at(Component::Llm, "build_client")
                .with_source(e)
        })
}

/// Effective timeout: the provider's own, capped by the caller's remaining budget
pub(crate) fn effective_timeout(provider: Duration, budget: Option<Duration>) -> Duration {
    match budget {
        Some(b) => provider.min(b),
        None => provider,
    }
}

/// Maps a non-success status and its body to an error kind
pub(crate) fn classify_status(status: StatusCode, body: &str, operation: &str) -> RagoError {
    let lower = body.to_lowercase();
    let snippet: String = body.chars().take(300).collect();
    let message = format!("HTTP {}: {}", status.as_u16(), snippet);

    let kind = if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        ErrorKind::Transient
    } else if status == StatusCode::PAYLOAD_TOO_LARGE {
        ErrorKind::InputTooLarge
    } else if status == StatusCode::BAD_REQUEST
        && CONTEXT_OVERFLOW_MARKERS.iter().any(|m| lower.contains(m))
    {
        ErrorKind::InputTooLarge
    } else {
        ErrorKind::BadRequest
    };

    RagoError::new(kind, message).at(Component::Llm, operation)
}

pub(crate) fn map_transport_error(err: reqwest::Error, operation: &str) -> RagoError {
    let message = if err.is_timeout() {
        format!("request timed out: {}", err)
    } else if err.is_connect() {
        format!("connection failed: {}", err)
    } else {
        format!("request failed: {}", err)
    };
    let kind = if err.is_builder() {
        ErrorKind::BadRequest
    } else {
        ErrorKind::Transient
    };
    RagoError::new(kind, message)
        .at(Component::Llm, operation)
        .with_source(err)
}

/// Sends a request, racing it against cancellation, and checks the status
pub(crate) async fn send(
    builder: reqwest::RequestBuilder,
    cancel: &CancellationToken,
    operation: &str,
) -> RagoResult<reqwest::Response> {
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(RagoError::cancelled().at(Component::Llm, operation));
        }
        result = builder.send() => result.map_err(|e| map_transport_error(e, operation))?,
    };

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!(status = status.as_u16(), "Provider returned error body: {}", body);
    Err(classify_status(status, &body, operation))
}

/// Sends a request and decodes the JSON body
pub(crate) async fn send_json(
    builder: reqwest::RequestBuilder,
    cancel: &CancellationToken,
    operation: &str,
) -> RagoResult<Value> {
    let response = send(builder, cancel, operation).await?;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RagoError::cancelled().at(Component::Llm, operation)),
        body = response.json::<Value>() => body.map_err(|e| map_transport_error(e, operation)),
    }
}

/// Line reader over a streamed response body
pub(crate) struct BodyLines {
    body: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    lines: LineBuffer,
    done: bool,
}

impl BodyLines {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            body: response.bytes_stream().boxed(),
            lines: LineBuffer::default(),
            done: false,
        }
    }

    /// Next complete non-blank line; `None` once the body is exhausted
    pub async fn next(
        &mut self,
        cancel: &CancellationToken,
        operation: &str,
    ) -> RagoResult<Option<String>> {
        loop {
            if let Some(line) = self.lines.next_line() {
                return Ok(Some(line));
            }
            if self.done {
                return Ok(self.lines.finish());
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RagoError::cancelled().at(Component::Llm, operation));
                }
                next = self.body.next() => next,
            };

            match next {
                Some(Ok(bytes)) => self.lines.push(&bytes),
                Some(Err(e)) => return Err(map_transport_error(e, operation)),
                None => self.done = true,
            }
        }
    }
}

/// Splits a byte stream into lines, holding partial lines across pushes
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete, non-blank line without its terminator
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let pos = self.buf.iter().position(|b| *b == b'\n')?;
            let line = self.buf.split_to(pos);
            self.buf.advance(1);
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches('\r');
            if !text.trim().is_empty() {
                return Some(text.to_string());
            }
        }
    }

    /// Trailing data without a final newline
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

/// Tool-call arguments arrive as a JSON string (chat-completions) or an object
pub(crate) fn parse_arguments(raw: &Value) -> Value {
    match raw {
        Value::String(s) if s.trim().is_empty() => Value::Object(Default::default()),
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())),
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    }
}
