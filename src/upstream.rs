//! Upstream Chat Completions caller.
//!
//! Single-shot and streaming entry points over one reqwest stack. Retries
//! apply to whole non-stream calls and to stream connection attempts; once a
//! stream has produced bytes, failures surface to the bridge instead.

use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use http::StatusCode;
use rand::Rng;
use serde_json::Value;

use crate::config::Settings;
use crate::error::{BridgeError, ErrorBody, ErrorDetail};

const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

/// Backoff schedule for upstream retries: exponential with jitter, capped by
/// attempts and total wall time.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_seconds: f64,
    pub backoff: f64,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.retry_max_attempts.max(1),
            max_seconds: settings.retry_max_seconds,
            backoff: settings.retry_backoff,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.backoff * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max_seconds);
        let jitter = rand::thread_rng().gen_range(0.0..self.backoff.max(0.001));
        Duration::from_secs_f64(capped + jitter)
    }
}

/// A completed single-shot upstream exchange.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub body: Bytes,
    /// Upstream request id, for log correlation only.
    pub request_id: Option<String>,
}

impl UpstreamResponse {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn error_detail(&self) -> ErrorDetail {
        error_detail_from_body(&self.body)
    }
}

/// An established upstream SSE connection. `frames` yields the payload of
/// each `data:` frame, terminating with `[DONE]`.
pub struct SseConnection {
    pub request_id: Option<String>,
    pub frames: BoxStream<'static, Result<String, BridgeError>>,
}

pub struct UpstreamClient {
    client: reqwest::Client,
    streaming_client: reqwest::Client,
    base_url: String,
    api_key: String,
    http_referer: Option<String>,
    x_title: Option<String>,
}

impl UpstreamClient {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs_f64(settings.request_timeout_s);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        // Streams outlive the single-shot deadline; only the headers-received
        // phase is bounded (see connect_stream).
        let streaming_client = reqwest::Client::builder()
            .connect_timeout(timeout.min(Duration::from_secs(30)))
            .build()?;
        Ok(Self {
            client,
            streaming_client,
            base_url: settings.upstream_base_url.trim_end_matches('/').to_string(),
            api_key: settings.upstream_api_key.clone(),
            http_referer: settings.http_referer.clone(),
            x_title: settings.x_title.clone(),
        })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request(&self, streaming: bool) -> reqwest::RequestBuilder {
        let client = if streaming {
            &self.streaming_client
        } else {
            &self.client
        };
        let mut builder = client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .header(http::header::CONTENT_TYPE, "application/json");
        if streaming {
            builder = builder.header(http::header::ACCEPT, "text/event-stream");
        }
        if let Some(referer) = &self.http_referer {
            builder = builder.header("HTTP-Referer", referer);
        }
        if let Some(title) = &self.x_title {
            builder = builder.header("X-Title", title);
        }
        builder
    }

    async fn chat_completions(&self, payload: &Value) -> Result<UpstreamResponse, reqwest::Error> {
        let response = self.request(false).json(payload).send().await?;
        let status = response.status();
        let request_id = header_string(response.headers(), "x-request-id");
        let body = response.bytes().await?;
        Ok(UpstreamResponse {
            status,
            body,
            request_id,
        })
    }

    /// Single-shot call with the retry policy applied. Retryable statuses
    /// that survive every attempt are returned for the caller to surface.
    pub async fn call_with_retry(
        &self,
        payload: &Value,
        policy: &RetryPolicy,
    ) -> Result<UpstreamResponse, BridgeError> {
        let started = Instant::now();
        let mut attempt = 0u32;
        let mut last: Option<Result<UpstreamResponse, reqwest::Error>> = None;

        loop {
            attempt += 1;
            match self.chat_completions(payload).await {
                Ok(response) if !RETRYABLE_STATUS.contains(&response.status.as_u16()) => {
                    return Ok(response)
                }
                other => {
                    if let Err(err) = &other {
                        tracing::warn!(error = %err, attempt, "upstream call failed");
                    }
                    last = Some(other);
                }
            }

            if attempt >= policy.max_attempts
                || started.elapsed().as_secs_f64() >= policy.max_seconds
            {
                return match last.expect("at least one attempt recorded") {
                    Ok(response) => Ok(response),
                    Err(err) => Err(map_transport_error(err)),
                };
            }
            tokio::time::sleep(policy.delay(attempt)).await;
        }
    }

    /// Open an SSE stream, retrying connection failures and retryable
    /// statuses until headers arrive. A non-retryable upstream status is
    /// returned as an error with its body intact, before any event reaches
    /// the client.
    pub async fn connect_stream(
        &self,
        payload: &Value,
        policy: &RetryPolicy,
        headers_timeout: Duration,
    ) -> Result<SseConnection, BridgeError> {
        let started = Instant::now();
        let mut attempt = 0u32;
        let mut last: Option<BridgeError> = None;

        loop {
            attempt += 1;
            let send = self.request(true).json(payload).send();
            match tokio::time::timeout(headers_timeout, send).await {
                Err(_) => last = Some(BridgeError::Timeout),
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, attempt, "upstream stream connect failed");
                    last = Some(map_transport_error(err));
                }
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() {
                        let request_id = header_string(response.headers(), "x-request-id");
                        return Ok(SseConnection {
                            request_id,
                            frames: sse_frames(response),
                        });
                    }
                    let body = response.bytes().await.unwrap_or_default();
                    let err = BridgeError::Upstream {
                        status: status.as_u16(),
                        detail: error_detail_from_body(&body),
                    };
                    if !RETRYABLE_STATUS.contains(&status.as_u16()) {
                        return Err(err);
                    }
                    last = Some(err);
                }
            }

            if attempt >= policy.max_attempts
                || started.elapsed().as_secs_f64() >= policy.max_seconds
            {
                return Err(last.expect("at least one attempt recorded"));
            }
            tokio::time::sleep(policy.delay(attempt)).await;
        }
    }
}

fn header_string(headers: &http::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn map_transport_error(err: reqwest::Error) -> BridgeError {
    if err.is_timeout() {
        return BridgeError::Timeout;
    }
    BridgeError::Upstream {
        status: 502,
        detail: ErrorDetail {
            message: err.to_string(),
            kind: "upstream_error".into(),
            param: None,
            code: None,
        },
    }
}

/// Parse an upstream error body, falling back to the raw text.
pub fn error_detail_from_body(body: &[u8]) -> ErrorDetail {
    if let Ok(parsed) = serde_json::from_slice::<ErrorBody>(body) {
        return parsed.error;
    }
    let message = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned()),
        _ => String::from_utf8_lossy(body).into_owned(),
    };
    ErrorDetail {
        message,
        kind: "invalid_request_error".into(),
        param: None,
        code: None,
    }
}

/// If the error text names one of the configured fragile fields present in
/// the payload, return the payload without it and the field that was dropped.
pub fn apply_degrade_fields(
    payload: &Value,
    fields: &[String],
    error_message: &str,
) -> Option<(Value, String)> {
    let obj = payload.as_object()?;
    for field in fields {
        if obj.contains_key(field) && error_message.contains(field.as_str()) {
            let mut degraded = obj.clone();
            degraded.remove(field);
            return Some((Value::Object(degraded), field.clone()));
        }
    }
    None
}

// ============================================================================
// SSE framing
// ============================================================================

/// Incremental splitter for `text/event-stream` bytes: buffers chunks and
/// pops the joined `data:` payload of each complete frame.
#[derive(Debug, Default)]
pub(crate) struct SseFraming {
    buffer: Vec<u8>,
}

impl SseFraming {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete frame's data payload, if one is buffered.
    pub fn next_data(&mut self) -> Option<String> {
        loop {
            let (frame_end, rest_start) = find_frame_boundary(&self.buffer)?;
            let frame = String::from_utf8_lossy(&self.buffer[..frame_end]).into_owned();
            self.buffer.drain(..rest_start);
            if let Some(data) = extract_data(&frame) {
                return Some(data);
            }
            // Comment-only or event-only frame; keep scanning.
        }
    }

    /// Flush a trailing unterminated frame at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let frame = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        extract_data(&frame)
    }
}

fn find_frame_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < buffer.len() {
        if buffer[i] == b'\n' {
            if buffer.get(i + 1) == Some(&b'\n') {
                return Some((i, i + 2));
            }
            if buffer.get(i + 1) == Some(&b'\r') && buffer.get(i + 2) == Some(&b'\n') {
                return Some((i, i + 3));
            }
        }
        i += 1;
    }
    None
}

fn extract_data(frame: &str) -> Option<String> {
    let mut lines: Vec<&str> = Vec::new();
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn sse_frames(response: reqwest::Response) -> BoxStream<'static, Result<String, BridgeError>> {
    struct State {
        inner: BoxStream<'static, reqwest::Result<Bytes>>,
        framing: SseFraming,
        done: bool,
    }

    let state = State {
        inner: response.bytes_stream().boxed(),
        framing: SseFraming::default(),
        done: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(data) = state.framing.next_data() {
                return Some((Ok(data), state));
            }
            if state.done {
                let trailing = state.framing.finish();
                return trailing.map(|data| (Ok(data), state));
            }
            match state.inner.next().await {
                Some(Ok(chunk)) => state.framing.push(&chunk),
                Some(Err(err)) => {
                    state.done = true;
                    return Some((Err(map_transport_error(err)), state));
                }
                None => state.done = true,
            }
        }
    })
    .boxed()
}
