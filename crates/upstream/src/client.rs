//! HTTP client for the upstream service
//!
//! Every call presents the leased secret in the `token` header and mimics
//! the upstream's own web client headers. The client never decides what a
//! failure means for the credential; it only reports it.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::{Result, UpstreamError};
use crate::frame::{Frame, parse_frame};
use crate::sse::SseDecoder;

const STREAM_PATH: &str = "/api/v1/ai/message/stream";
const TASK_PATH: &str = "/api/v1/draw/task";
const ASSET_CONFIG_PATH: &str = "/api/v1/asset/config";
const ASSET_ADD_PATH: &str = "/api/v1/asset/add";

const TOKEN_HEADER: &str = "token";
const DEFAULT_UPLOAD_REGION: &str = "z2";

const ORIGIN: &str = "https://www.zaiwenai.com";
const REFERER: &str = "https://www.zaiwenai.com/";
const CHANNEL: &str = "web.zaiwenai.com";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36";

/// Per-request timeout for the small JSON calls (polls, asset calls).
const SHORT_CALL_TIMEOUT: Duration = Duration::from_secs(15);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Time an image job can spend in calls the whole-call timeout and the poll
/// timeout do not cover: the three reference-upload calls plus the poll that
/// is still running when the poll deadline passes.
pub const IMAGE_JOB_OVERHEAD: Duration =
    Duration::from_secs(3 * SHORT_CALL_TIMEOUT.as_secs() + UPLOAD_TIMEOUT.as_secs());

/// Error bodies are truncated before they reach logs and error messages.
const MAX_ERROR_BODY: usize = 512;

/// An open upstream response.
pub struct UpstreamStream {
    /// Replacement secret announced in the response headers
    pub rotated_secret: Option<String>,
    /// Raw body bytes, as they arrive
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for UpstreamStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamStream")
            .field("rotated", &self.rotated_secret.is_some())
            .finish_non_exhaustive()
    }
}

/// Result of submitting a draw request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawSubmission {
    pub task_id: String,
    /// Last replacement secret seen in headers or frames
    pub rotated_secret: Option<String>,
}

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    /// Fixed reference-image upload endpoint, instead of the region-derived one
    upload_url: Option<String>,
}

impl UpstreamClient {
    /// Build a client for `base_url`.
    ///
    /// `timeout` bounds a whole call including the streamed body;
    /// `read_timeout` bounds the gap between two reads of the body.
    pub fn new(base_url: &str, timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_static(ORIGIN));
        headers.insert(header::REFERER, HeaderValue::from_static(REFERER));
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
        );
        headers.insert("channel", HeaderValue::from_static(CHANNEL));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .read_timeout(read_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| UpstreamError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            upload_url: None,
        })
    }

    /// Send reference uploads to a fixed endpoint.
    pub fn with_upload_url(mut self, url: impl Into<String>) -> Self {
        self.upload_url = Some(url.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// POST a chat or draw body and return the response body as a stream.
    ///
    /// Fails before any body byte is read when the upstream answers with a
    /// non-success status.
    pub async fn open_stream(&self, secret: &str, body: &Value) -> Result<UpstreamStream> {
        let response = self
            .http
            .post(self.url(STREAM_PATH))
            .header(TOKEN_HEADER, secret)
            .header(header::ACCEPT, "text/event-stream")
            .json(body)
            .send()
            .await?;

        let response = check_status(response).await?;
        let rotated_secret = header_secret(response.headers(), secret);
        if rotated_secret.is_some() {
            debug!("upstream announced a replacement secret in response headers");
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(UpstreamError::from))
            .boxed();
        Ok(UpstreamStream {
            rotated_secret,
            body,
        })
    }

    /// Submit a draw body and read the response until the task id shows up.
    pub async fn submit_draw(&self, secret: &str, body: &Value) -> Result<DrawSubmission> {
        let UpstreamStream {
            mut rotated_secret,
            body: mut stream,
        } = self.open_stream(secret, body).await?;

        let mut decoder = SseDecoder::new();
        while let Some(bytes) = stream.next().await {
            for payload in decoder.push(&bytes?)? {
                let Frame::Chunk(chunk) = parse_frame(&payload) else {
                    return Err(UpstreamError::Malformed("draw response ended without a task id".into()));
                };
                if let Some(s) = chunk.rotated_secret.filter(|s| s != secret) {
                    rotated_secret = Some(s);
                }
                if let Some(task_id) = chunk.draw_task {
                    info!(task_id = %task_id, "draw task submitted");
                    return Ok(DrawSubmission {
                        task_id,
                        rotated_secret,
                    });
                }
            }
        }
        if let Some(payload) = decoder.finish()? {
            if let Frame::Chunk(chunk) = parse_frame(&payload) {
                if let Some(task_id) = chunk.draw_task {
                    return Ok(DrawSubmission {
                        task_id,
                        rotated_secret,
                    });
                }
            }
        }
        Err(UpstreamError::Malformed("draw response ended without a task id".into()))
    }

    /// Poll a draw task until it completes, fails, or `timeout` elapses.
    ///
    /// Transient poll errors are retried on the next tick. A rejected secret
    /// ends polling immediately.
    pub async fn poll_task(
        &self,
        secret: &str,
        task_id: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut polls = 0u32;

        loop {
            polls += 1;
            match self.poll_once(secret, task_id).await {
                Ok(PollState::Completed(urls)) => {
                    info!(task_id, polls, images = urls.len(), "draw task completed");
                    return Ok(urls);
                }
                Ok(PollState::Failed(message)) => return Err(UpstreamError::TaskFailed(message)),
                Ok(PollState::Pending) => {
                    if polls % 5 == 0 {
                        debug!(task_id, polls, "draw task still running");
                    }
                }
                Err(UpstreamError::Status { status, body }) if matches!(status, 401 | 403) => {
                    return Err(UpstreamError::Status { status, body });
                }
                Err(e) => warn!(task_id, error = %e, "draw task poll failed"),
            }

            if tokio::time::Instant::now() + interval > deadline {
                return Err(UpstreamError::TaskTimeout(task_id.to_string()));
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn poll_once(&self, secret: &str, task_id: &str) -> Result<PollState> {
        let response = self
            .http
            .get(self.url(TASK_PATH))
            .query(&[("task", task_id)])
            .header(TOKEN_HEADER, secret)
            .timeout(SHORT_CALL_TIMEOUT)
            .send()
            .await?;
        let body: Value = check_status(response).await?.json().await?;
        Ok(PollState::from_response(&body))
    }

    /// Upload a reference image and register it, returning the asset id.
    pub async fn upload_reference(&self, secret: &str, image: &[u8], filename: &str) -> Result<String> {
        let config: Value = check_status(
            self.http
                .get(self.url(ASSET_CONFIG_PATH))
                .header(TOKEN_HEADER, secret)
                .timeout(SHORT_CALL_TIMEOUT)
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;

        let upload_token = config
            .pointer("/data/token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| UpstreamError::Malformed("asset config has no upload token".into()))?;
        let region = config
            .pointer("/data/region")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_UPLOAD_REGION);
        let upload_url = self
            .upload_url
            .clone()
            .unwrap_or_else(|| format!("https://upload-{region}.qiniup.com/"));

        let mime = image_mime(filename);
        let part = reqwest::multipart::Part::bytes(image.to_vec())
            .file_name(filename.to_string())
            .mime_str(mime)?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("token", upload_token.to_string());

        debug!(bytes = image.len(), region, "uploading reference image");
        let uploaded: Value = check_status(
            self.http
                .post(&upload_url)
                .multipart(form)
                .timeout(UPLOAD_TIMEOUT)
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;
        let key = uploaded.get("key").and_then(Value::as_str).unwrap_or_default();

        let registered: Value = check_status(
            self.http
                .post(self.url(ASSET_ADD_PATH))
                .header(TOKEN_HEADER, secret)
                .timeout(SHORT_CALL_TIMEOUT)
                .json(&json!({
                    "name": filename,
                    "format": mime,
                    "size": image.len(),
                    "url": key,
                    "thumbnail": key,
                }))
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;

        let asset_id = match registered.pointer("/data/id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => return Err(UpstreamError::Malformed("asset registration returned no id".into())),
        };
        info!(asset_id = %asset_id, "reference image registered");
        Ok(asset_id)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PollState {
    Pending,
    Completed(Vec<String>),
    Failed(String),
}

impl PollState {
    fn from_response(body: &Value) -> Self {
        let data = body.get("data").unwrap_or(&Value::Null);
        match data.get("status").and_then(Value::as_str) {
            Some("completed" | "success") => PollState::Completed(image_urls(data)),
            Some("failed" | "error") => {
                let message = data
                    .get("error")
                    .or_else(|| body.get("msg"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                PollState::Failed(message.to_string())
            }
            _ => PollState::Pending,
        }
    }
}

/// Image URLs of a finished task; `url` preferred over `thumbnail`.
fn image_urls(data: &Value) -> Vec<String> {
    let Some(images) = data.get("images").and_then(Value::as_array) else {
        return Vec::new();
    };
    images
        .iter()
        .filter_map(|image| match image {
            Value::String(url) => Some(url.as_str()),
            Value::Object(_) => ["url", "thumbnail"]
                .iter()
                .find_map(|k| image.get(k).and_then(Value::as_str).filter(|u| !u.is_empty())),
            _ => None,
        })
        .filter(|url| !url.is_empty())
        .map(String::from)
        .collect()
}

fn image_mime(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

/// Replacement secret from the `token` response header, when it differs.
fn header_secret(headers: &HeaderMap, current: &str) -> Option<String> {
    headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != current)
        .map(String::from)
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    if body.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        body.truncate(cut);
    }
    Err(UpstreamError::Status {
        status: status.as_u16(),
        body,
    })
}
