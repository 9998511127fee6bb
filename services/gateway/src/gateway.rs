//! OpenAI-compatible request handling
//!
//! Each request runs `acquire → call → release` cycles driven by its
//! `RequestPhase`: a failure before anything reached the caller is retried
//! with a fresh credential up to `max_attempts`, pool exhaustion never is.
//! Answers are cleaned for the model's output mode: non-streaming ones once
//! collected, streaming ones line by line as they arrive.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use credential_pool::{Lease, Pool};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use upstream::{
    ImageModel, ModelSpec, UpstreamClient, UpstreamError, catalog, chat_payload, flatten_prompt,
    parse_model,
};

use crate::config::Config;
use crate::error::{ApiError, new_request_id};
use crate::filter::{OutputFilter, StreamFilter};
use crate::metrics;
use crate::openai::{self, ChatCompletionRequest, ImageEditRequest, ImageGenerationRequest, ReferenceImage};
use crate::phase::{Phase, PhaseEvent, RequestPhase};
use crate::relay::{self, ImageJob, RelayStream};

/// Reference images arrive base64-encoded inside JSON bodies or as
/// multipart file parts.
const MAX_BODY_BYTES: usize = 20 * 1024 * 1024;

/// Request handling knobs taken from the config file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub reference_weight: u8,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.upstream.max_attempts,
            poll_interval: Duration::from_millis(config.images.poll_interval_ms),
            poll_timeout: Duration::from_secs(config.images.poll_timeout_secs),
            reference_weight: config.images.reference_weight,
        }
    }
}

/// Shared state of the public API
pub struct GatewayState {
    pub pool: Arc<Pool>,
    pub client: UpstreamClient,
    pub settings: Settings,
    /// Root token; cancelled on shutdown
    pub shutdown: CancellationToken,
}

/// Public OpenAI-compatible routes.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/images/generations", post(generate_images))
        .route("/v1/images/edits", post(edit_images))
        .route("/v1/images/edits/upload", post(upload_edit_images))
        .route("/v1/models", get(list_models))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidRequest(format!("invalid JSON body: {e}")))
}

fn json_response(value: &Value) -> Response {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        value.to_string(),
    )
        .into_response()
}

/// Run a request body to a response, recording metrics and rendering errors
/// with the request's id.
async fn respond<F>(endpoint: &'static str, request_id: String, work: F) -> Response
where
    F: Future<Output = Result<Response, ApiError>>,
{
    let started = Instant::now();
    let response = match work.await {
        Ok(response) => response,
        Err(e) => {
            if e.status().is_server_error() {
                warn!(request_id, error_type = e.kind(), error = %e, "request failed");
            } else {
                info!(request_id, error_type = e.kind(), error = %e, "request rejected");
            }
            e.into_response_with(&request_id)
        }
    };
    metrics::record_request(endpoint, response.status().as_u16(), started.elapsed().as_secs_f64());
    response
}

/// Race `work` against shutdown. Dropping `work` drops any lease it holds.
async fn until_shutdown<T>(
    token: &CancellationToken,
    work: impl Future<Output = Result<T, ApiError>>,
) -> Result<T, ApiError> {
    tokio::select! {
        result = work => result,
        _ = token.cancelled() => Err(ApiError::ShuttingDown),
    }
}

pub async fn chat_completions(State(state): State<Arc<GatewayState>>, body: Bytes) -> Response {
    let request_id = new_request_id();
    respond("chat", request_id.clone(), handle_chat(state, body, request_id)).await
}

#[instrument(skip_all, fields(request_id = %request_id))]
async fn handle_chat(state: Arc<GatewayState>, body: Bytes, request_id: String) -> Result<Response, ApiError> {
    let req: ChatCompletionRequest = parse_body(&body)?;
    if req.messages.is_empty() {
        return Err(ApiError::InvalidRequest("messages must not be empty".into()));
    }
    if state.shutdown.is_cancelled() {
        return Err(ApiError::ShuttingDown);
    }
    let token = state.shutdown.child_token();
    let mut phase = RequestPhase::new(&request_id, state.settings.max_attempts);
    info!(model = req.model, stream = req.stream, messages = req.messages.len(), "chat completion");

    match parse_model(&req.model) {
        ModelSpec::Image(model) => {
            let prompt = req
                .last_user_text()
                .ok_or_else(|| ApiError::InvalidRequest("no user prompt for image generation".into()))?;
            let reference = req.reference_image();
            let urls = until_shutdown(
                &token,
                run_images(&state, &model, &prompt, reference.as_ref(), &mut phase),
            )
            .await?;
            let content = openai::image_markdown(&urls, &prompt, &model.base);
            if req.stream {
                Ok(sse_response(single_answer(&req.model, &content)))
            } else {
                Ok(json_response(&openai::chat_completion(
                    &openai::completion_id(),
                    &req.model,
                    &content,
                )))
            }
        }
        ModelSpec::Chat(model) => {
            let messages = req.flattened_messages();
            let prompt = flatten_prompt(messages.iter().map(|(r, c)| (r.as_str(), c.as_str())));
            let payload = chat_payload(&prompt, &model.base);

            if req.stream {
                let (first, stream) = until_shutdown(&token, open_first_chunk(&state, &payload, &mut phase)).await?;
                let events = SseEvents {
                    relay: Some(stream),
                    first,
                    filter: StreamFilter::new(model.mode),
                    id: openai::completion_id(),
                    model: req.model.clone(),
                    request_id,
                    token,
                    phase,
                    queued: VecDeque::new(),
                    started: false,
                };
                return Ok(sse_response(events.into_stream()));
            }

            let raw = until_shutdown(&token, collect_answer(&state, &payload, &mut phase)).await?;
            let content = OutputFilter::new(model.mode).clean(&raw);
            phase.advance(PhaseEvent::Cleaned);
            info!(
                mode = model.mode.as_str(),
                raw_chars = raw.chars().count(),
                chars = content.chars().count(),
                "chat completion finished"
            );
            Ok(json_response(&openai::chat_completion(
                &openai::completion_id(),
                &req.model,
                &content,
            )))
        }
    }
}

/// Claim a credential for the phase's current attempt.
fn acquire(pool: &Arc<Pool>, phase: &mut RequestPhase) -> Result<Lease, ApiError> {
    match pool.acquire() {
        Ok(lease) => {
            phase.advance(PhaseEvent::Acquired);
            Ok(lease)
        }
        Err(e @ credential_pool::Error::PoolExhausted(_)) => {
            phase.advance(PhaseEvent::Exhausted);
            warn!(request_id = phase.request_id(), "no credential available");
            Err(e.into())
        }
        Err(e) => {
            phase.advance(PhaseEvent::Rejected);
            Err(e.into())
        }
    }
}

/// Whether another attempt follows a failure; logs the retry.
fn retry_after(phase: &mut RequestPhase, err: &UpstreamError) -> bool {
    phase.advance(PhaseEvent::UpstreamFailed);
    match phase.retry_attempt() {
        Some(attempt) => {
            warn!(
                request_id = phase.request_id(),
                attempt,
                error_type = err.kind(),
                "retrying with another credential"
            );
            true
        }
        None => false,
    }
}

/// Open relays until one is healthy, then read the whole answer. A failure
/// at any point is retried, since nothing has reached the caller yet.
async fn collect_answer(
    state: &GatewayState,
    payload: &Value,
    phase: &mut RequestPhase,
) -> Result<String, ApiError> {
    phase.advance(PhaseEvent::Accepted);
    loop {
        let lease = acquire(&state.pool, phase)?;
        let attempt = match phase.current() {
            Phase::Streaming { attempt, .. } => attempt,
            _ => 1,
        };
        let outcome = match relay::open(&state.client, lease, payload).await {
            Ok(mut stream) => {
                let mut text = String::new();
                let mut failure = None;
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(chunk) => text.push_str(&chunk),
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                failure.map_or(Ok(text), Err)
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(text) => {
                phase.advance(PhaseEvent::UpstreamDone);
                info!(request_id = phase.request_id(), attempt, "upstream answer collected");
                return Ok(text);
            }
            Err(e) if retry_after(phase, &e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Open relays until one produces its first chunk. Once that chunk exists
/// it will be sent, so retries stop here.
async fn open_first_chunk(
    state: &GatewayState,
    payload: &Value,
    phase: &mut RequestPhase,
) -> Result<(Option<String>, RelayStream), ApiError> {
    phase.advance(PhaseEvent::Accepted);
    loop {
        let lease = acquire(&state.pool, phase)?;
        let mut stream = match relay::open(&state.client, lease, payload).await {
            Ok(stream) => stream,
            Err(e) if retry_after(phase, &e) => continue,
            Err(e) => return Err(e.into()),
        };
        match stream.next().await {
            Some(Ok(first)) => {
                phase.advance(PhaseEvent::Delivered);
                info!(
                    request_id = phase.request_id(),
                    credential_id = stream.credential_id(),
                    "streaming to caller"
                );
                return Ok((Some(first), stream));
            }
            None => return Ok((None, stream)),
            Some(Err(e)) if retry_after(phase, &e) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Run an image job with retries. A task the upstream rejected or never
/// finished is final: it was already accepted for this request.
async fn run_images(
    state: &GatewayState,
    model: &ImageModel,
    prompt: &str,
    reference: Option<&ReferenceImage>,
    phase: &mut RequestPhase,
) -> Result<Vec<String>, ApiError> {
    phase.advance(PhaseEvent::Accepted);
    loop {
        let lease = acquire(&state.pool, phase)?;
        let job = ImageJob {
            prompt,
            model,
            reference,
            reference_weight: state.settings.reference_weight,
            poll_interval: state.settings.poll_interval,
            poll_timeout: state.settings.poll_timeout,
        };
        match relay::run_image_job(&state.client, lease, job).await {
            Ok(urls) => {
                phase.advance(PhaseEvent::UpstreamDone);
                phase.advance(PhaseEvent::Cleaned);
                info!(request_id = phase.request_id(), images = urls.len(), "image generation finished");
                return Ok(urls);
            }
            Err(e @ (UpstreamError::TaskFailed(_) | UpstreamError::TaskTimeout(_))) => {
                phase.advance(PhaseEvent::Rejected);
                return Err(e.into());
            }
            Err(e) if retry_after(phase, &e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

pub async fn generate_images(State(state): State<Arc<GatewayState>>, body: Bytes) -> Response {
    let request_id = new_request_id();
    respond("images", request_id.clone(), handle_generation(state, body, request_id)).await
}

#[instrument(skip_all, fields(request_id = %request_id))]
async fn handle_generation(state: Arc<GatewayState>, body: Bytes, request_id: String) -> Result<Response, ApiError> {
    let req: ImageGenerationRequest = parse_body(&body)?;
    let model = image_model(&req.model, req.size.as_deref())?;
    let prompt = required_prompt(&req.prompt)?;
    log_image_options(req.n, req.response_format.as_deref());
    info!(model = model.base, ratio = model.ratio, quality = ?req.quality, "image generation");
    generate(&state, &request_id, &model, prompt, None).await
}

pub async fn edit_images(State(state): State<Arc<GatewayState>>, body: Bytes) -> Response {
    let request_id = new_request_id();
    respond("image_edits", request_id.clone(), handle_edit(state, body, request_id)).await
}

#[instrument(skip_all, fields(request_id = %request_id))]
async fn handle_edit(state: Arc<GatewayState>, body: Bytes, request_id: String) -> Result<Response, ApiError> {
    let req: ImageEditRequest = parse_body(&body)?;
    let model = image_model(&req.model, req.size.as_deref())?;
    let prompt = required_prompt(&req.prompt)?;
    let reference = openai::decode_image(&req.image)
        .ok_or_else(|| ApiError::InvalidRequest("image must be base64 or a data:image URL".into()))?;
    log_image_options(req.n, req.response_format.as_deref());
    info!(model = model.base, ratio = model.ratio, bytes = reference.bytes.len(), "image edit");
    generate(&state, &request_id, &model, prompt, Some(&reference)).await
}

pub async fn upload_edit_images(
    State(state): State<Arc<GatewayState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let request_id = new_request_id();
    respond("image_uploads", request_id.clone(), handle_upload_edit(state, multipart, request_id)).await
}

#[instrument(skip_all, fields(request_id = %request_id))]
async fn handle_upload_edit(
    state: Arc<GatewayState>,
    multipart: Result<Multipart, MultipartRejection>,
    request_id: String,
) -> Result<Response, ApiError> {
    let multipart = multipart.map_err(|e| ApiError::InvalidRequest(format!("invalid multipart body: {e}")))?;
    let form = read_edit_form(multipart).await?;
    let model = image_model(&form.model, form.size.as_deref())?;
    let prompt = required_prompt(&form.prompt)?;
    let reference = form
        .image
        .ok_or_else(|| ApiError::InvalidRequest("image file part is required".into()))?;
    info!(model = model.base, ratio = model.ratio, bytes = reference.bytes.len(), "image edit upload");
    generate(&state, &request_id, &model, prompt, Some(&reference)).await
}

/// Fields of a multipart image edit.
struct EditForm {
    model: String,
    prompt: String,
    size: Option<String>,
    image: Option<ReferenceImage>,
}

async fn read_edit_form(mut multipart: Multipart) -> Result<EditForm, ApiError> {
    let invalid = |e: axum::extract::multipart::MultipartError| {
        ApiError::InvalidRequest(format!("invalid multipart body: {e}"))
    };
    let mut form = EditForm {
        model: upstream::model::DEFAULT_IMAGE_MODEL.to_string(),
        prompt: String::new(),
        size: None,
        image: None,
    };

    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let filename = field
                    .file_name()
                    .filter(|f| !f.is_empty())
                    .unwrap_or("reference.png")
                    .to_string();
                let bytes = field.bytes().await.map_err(invalid)?;
                if !bytes.is_empty() {
                    form.image = Some(ReferenceImage {
                        bytes: bytes.to_vec(),
                        filename,
                    });
                }
            }
            "prompt" => form.prompt = field.text().await.map_err(invalid)?,
            "model" => {
                let model = field.text().await.map_err(invalid)?;
                if !model.trim().is_empty() {
                    form.model = model.trim().to_string();
                }
            }
            "size" => form.size = Some(field.text().await.map_err(invalid)?),
            other => debug!(field = other, "ignoring multipart field"),
        }
    }
    Ok(form)
}

async fn generate(
    state: &GatewayState,
    request_id: &str,
    model: &ImageModel,
    prompt: &str,
    reference: Option<&ReferenceImage>,
) -> Result<Response, ApiError> {
    if state.shutdown.is_cancelled() {
        return Err(ApiError::ShuttingDown);
    }
    let token = state.shutdown.child_token();
    let mut phase = RequestPhase::new(request_id, state.settings.max_attempts);
    let urls = until_shutdown(&token, run_images(state, model, prompt, reference, &mut phase)).await?;
    Ok(json_response(&openai::image_response(&urls, prompt)))
}

fn image_model(name: &str, size: Option<&str>) -> Result<ImageModel, ApiError> {
    match parse_model(name) {
        ModelSpec::Image(model) => Ok(model.with_size(size)),
        ModelSpec::Chat(_) => Err(ApiError::InvalidRequest(format!("{name} is not an image model"))),
    }
}

fn required_prompt(prompt: &str) -> Result<&str, ApiError> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(ApiError::InvalidRequest("prompt must not be empty".into()));
    }
    Ok(prompt)
}

/// The upstream draws one task per request and only hands out URLs.
fn log_image_options(n: Option<u32>, response_format: Option<&str>) {
    if n.is_some_and(|n| n > 1) {
        info!(n, "only one draw task is submitted per request");
    }
    if response_format.is_some_and(|f| f != "url") {
        info!(response_format, "only url responses are supported");
    }
}

pub async fn list_models() -> Response {
    let started = Instant::now();
    let response = json_response(&json!({ "object": "list", "data": catalog() }));
    metrics::record_request("models", 200, started.elapsed().as_secs_f64());
    response
}

fn sse_response<S>(events: S) -> Response
where
    S: futures_util::Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/event-stream"), (CACHE_CONTROL, "no-cache")],
        Body::from_stream(events),
    )
        .into_response()
}

fn event(value: &Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

const DONE_EVENT: &str = "data: [DONE]\n\n";

/// A complete answer as one streamed response.
fn single_answer(model: &str, content: &str) -> impl futures_util::Stream<Item = Result<Bytes, Infallible>> + use<> {
    let id = openai::completion_id();
    let events = vec![
        event(&openai::chat_chunk(&id, model, json!({ "role": "assistant", "content": "" }), None)),
        event(&openai::chat_chunk(&id, model, json!({ "content": content }), None)),
        event(&openai::chat_chunk(&id, model, json!({}), Some("stop"))),
        Bytes::from_static(DONE_EVENT.as_bytes()),
    ];
    futures_util::stream::iter(events.into_iter().map(Ok))
}

/// Chunk events of a committed streaming answer.
///
/// Upstream text goes through the output mode's `StreamFilter` before it is
/// sent. The relay is dropped as soon as forwarding stops, whether the
/// answer is complete, the upstream failed, or the service is shutting down;
/// the caller going away drops the whole value.
struct SseEvents {
    relay: Option<RelayStream>,
    first: Option<String>,
    filter: StreamFilter,
    id: String,
    model: String,
    request_id: String,
    token: CancellationToken,
    phase: RequestPhase,
    queued: VecDeque<Bytes>,
    started: bool,
}

impl SseEvents {
    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Bytes {
        event(&openai::chat_chunk(&self.id, &self.model, delta, finish_reason))
    }

    fn content(&self, text: &str) -> Bytes {
        self.chunk(json!({ "content": text }), None)
    }

    fn error(&self, err: ApiError) -> Bytes {
        event(&json!({ "error": err.body(&self.request_id) }))
    }

    /// Queue the filtered part of one upstream chunk.
    fn forward(&mut self, text: &str) {
        let cleaned = self.filter.push(text);
        if !cleaned.is_empty() {
            let frame = self.content(&cleaned);
            self.queued.push_back(frame);
        }
        if self.filter.is_done() {
            self.complete();
        }
    }

    /// Close a successful answer. Stops reading the upstream when the filter
    /// finished before the upstream did.
    fn complete(&mut self) {
        if self.relay.take().is_some() && !self.filter.is_done() {
            let tail = self.filter.finish();
            if !tail.is_empty() {
                let frame = self.content(&tail);
                self.queued.push_back(frame);
            }
        }
        self.phase.advance(PhaseEvent::UpstreamDone);
        self.phase.advance(PhaseEvent::Cleaned);
        let stop = self.chunk(json!({}), Some("stop"));
        self.queued.push_back(stop);
        self.queued.push_back(Bytes::from_static(DONE_EVENT.as_bytes()));
        info!(request_id = self.request_id, "chat stream finished");
    }

    /// Queue the next events; false once the stream is over.
    async fn advance(&mut self) -> bool {
        if !self.started {
            self.started = true;
            let role = self.chunk(json!({ "role": "assistant", "content": "" }), None);
            self.queued.push_back(role);
            if let Some(first) = self.first.take() {
                self.forward(&first);
            }
            return true;
        }

        let Some(relay) = self.relay.as_mut() else {
            return false;
        };
        let item = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            item = relay.next() => Some(item),
        };
        let Some(item) = item else {
            self.relay = None;
            self.phase.advance(PhaseEvent::Cancelled);
            warn!(request_id = self.request_id, "stream stopped for shutdown");
            let frame = self.error(ApiError::ShuttingDown);
            self.queued.push_back(frame);
            return true;
        };

        match item {
            Some(Ok(text)) => self.forward(&text),
            Some(Err(e)) => {
                self.relay = None;
                self.phase.advance(PhaseEvent::UpstreamFailed);
                let frame = self.error(ApiError::Upstream(e));
                self.queued.push_back(frame);
            }
            None => self.complete(),
        }
        true
    }

    fn into_stream(self) -> impl futures_util::Stream<Item = Result<Bytes, Infallible>> {
        futures_util::stream::unfold(self, |mut events| async move {
            loop {
                if let Some(bytes) = events.queued.pop_front() {
                    return Some((Ok(bytes), events));
                }
                if !events.advance().await {
                    return None;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::tests::{draw_router, serve, sse, test_client, test_pool};
    use axum::http::Request;
    use credential_store::CredentialStatus;
    use std::sync::Mutex;
    use tower::ServiceExt;

    fn state(pool: Arc<Pool>, client: UpstreamClient) -> Arc<GatewayState> {
        Arc::new(GatewayState {
            pool,
            client,
            settings: Settings {
                max_attempts: 3,
                poll_interval: Duration::from_millis(10),
                poll_timeout: Duration::from_secs(2),
                reference_weight: 50,
            },
            shutdown: CancellationToken::new(),
        })
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 10 * 1024 * 1024)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Upstream that answers with `body` for secrets in `good` and 401 otherwise.
    async fn chat_upstream(good: &'static [&'static str], body: String) -> String {
        serve(Router::new().route(
            "/api/v1/ai/message/stream",
            post(move |headers: axum::http::HeaderMap| {
                let body = body.clone();
                async move {
                    let token = headers.get("token").and_then(|v| v.to_str().ok()).unwrap_or_default();
                    if good.iter().any(|g| *g == token) {
                        (StatusCode::OK, body)
                    } else {
                        (StatusCode::UNAUTHORIZED, "rejected".to_string())
                    }
                }
            }),
        ))
        .await
    }

    fn report_transcript() -> String {
        sse(&[
            r#"{"type":"conversation","id":"c1"}"#,
            r#"{"content":"*Thinking...*\n> planning\n"}"#,
            r#"{"content":"Rust is fast.\n\n\n"}"#,
            r##"{"content":"# 详细专业报告\nLong report."}"##,
            "[DONE]",
        ])
    }

    #[tokio::test]
    async fn non_streaming_chat_is_cleaned_for_its_mode() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["good"]);
        let base = chat_upstream(&["good"], report_transcript()).await;
        let app = router(state(pool, test_client(&base)));

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({ "model": "Gemini-3.0-Flash", "messages": [{ "role": "user", "content": "hi" }] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["choices"][0]["message"]["content"], "Rust is fast.");

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({ "model": "Gemini-3.0-Flash (专业报告)", "messages": [{ "role": "user", "content": "hi" }] }),
            ))
            .await
            .unwrap();
        let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["choices"][0]["message"]["content"], "Rust is fast.\n\nLong report.");
    }

    #[tokio::test]
    async fn rejected_credential_is_retried_with_another() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["bad", "good"]);
        let base = chat_upstream(&["good"], report_transcript()).await;
        let app = router(state(pool.clone(), test_client(&base)));

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({ "messages": [{ "role": "user", "content": "hi" }] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let rows = pool.credentials().unwrap();
        let bad = rows.iter().find(|c| c.secret.expose() == "bad").unwrap();
        let good = rows.iter().find(|c| c.secret.expose() == "good").unwrap();
        assert_eq!(bad.status, CredentialStatus::Cooldown);
        assert_eq!(good.status, CredentialStatus::Active);
        assert!(good.last_success_at > 0);
    }

    #[tokio::test]
    async fn retries_stop_at_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["a", "b", "c", "d"]);
        let base = chat_upstream(&[], String::new()).await;
        let app = router(state(pool.clone(), test_client(&base)));

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({ "messages": [{ "role": "user", "content": "hi" }] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["error"]["type"], "upstream_error");
        assert!(json["error"]["request_id"].as_str().unwrap().starts_with("req_"));

        let cooled = pool
            .credentials()
            .unwrap()
            .iter()
            .filter(|c| c.status == CredentialStatus::Cooldown)
            .count();
        assert_eq!(cooled, 3);
    }

    #[tokio::test]
    async fn empty_pool_is_service_unavailable_with_report() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &[]);
        let app = router(state(pool, test_client("http://127.0.0.1:9")));

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({ "messages": [{ "role": "user", "content": "hi" }] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["error"]["type"], "pool_exhausted");
        assert!(json["error"]["pool"].is_object());
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_acquiring() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["tok"]);
        let app = router(state(pool.clone(), test_client("http://127.0.0.1:9")));

        for body in [json!({ "messages": [] }), json!({ "model": "x" })] {
            let response = app
                .clone()
                .oneshot(post_json("/v1/chat/completions", body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
        let response = app
            .oneshot(post_json("/v1/images/generations", json!({ "model": "gpt-4o", "prompt": "cat" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(pool.credentials().unwrap()[0].use_count, 0);
    }

    #[tokio::test]
    async fn streaming_chat_sends_deltas_and_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["good"]);
        let base = chat_upstream(&["good"], sse(&[r#"{"content":"Hel"}"#, r#"{"content":"lo"}"#, "[DONE]"])).await;
        let app = router(state(pool.clone(), test_client(&base)));

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({ "stream": true, "messages": [{ "role": "user", "content": "hi" }] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/event-stream");

        let text = body_text(response).await;
        let frames: Vec<&str> = text
            .split("\n\n")
            .filter(|f| !f.is_empty())
            .map(|f| f.strip_prefix("data: ").unwrap())
            .collect();
        assert_eq!(frames.last(), Some(&"[DONE]"));

        let chunks: Vec<Value> = frames[..frames.len() - 1]
            .iter()
            .map(|f| serde_json::from_str(f).unwrap())
            .collect();
        assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
        let content: String = chunks
            .iter()
            .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
            .collect();
        assert_eq!(content, "Hello");
        assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "stop");

        let row = &pool.credentials().unwrap()[0];
        assert_eq!(row.status, CredentialStatus::Active);
        assert!(row.last_success_at > 0);
    }

    /// Concatenated delta text of an SSE answer, checking it ends with a stop
    /// chunk followed by `[DONE]`.
    fn streamed_content(text: &str) -> String {
        let frames: Vec<&str> = text
            .split("\n\n")
            .filter(|f| !f.is_empty())
            .map(|f| f.strip_prefix("data: ").unwrap())
            .collect();
        assert_eq!(frames.last(), Some(&"[DONE]"));
        let chunks: Vec<Value> = frames[..frames.len() - 1]
            .iter()
            .map(|f| serde_json::from_str(f).unwrap())
            .collect();
        assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "stop");
        chunks
            .iter()
            .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
            .collect()
    }

    #[tokio::test]
    async fn streaming_concise_chat_stops_before_the_report() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["good"]);
        let base = chat_upstream(&["good"], report_transcript()).await;
        let app = router(state(pool.clone(), test_client(&base)));

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({
                    "model": "Gemini-3.0-Flash",
                    "stream": true,
                    "messages": [{ "role": "user", "content": "hi" }],
                }),
            ))
            .await
            .unwrap();
        let content = streamed_content(&body_text(response).await);
        assert_eq!(content, "Rust is fast.");

        let row = &pool.credentials().unwrap()[0];
        assert_eq!(row.status, CredentialStatus::Active);
        assert!(row.last_success_at > 0);
    }

    #[tokio::test]
    async fn streaming_report_chat_drops_thinking_lines() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["good"]);
        let base = chat_upstream(&["good"], report_transcript()).await;
        let app = router(state(pool, test_client(&base)));

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({
                    "model": "Gemini-3.0-Flash (专业报告)",
                    "stream": true,
                    "messages": [{ "role": "user", "content": "hi" }],
                }),
            ))
            .await
            .unwrap();
        let content = streamed_content(&body_text(response).await);
        assert_eq!(content, "Rust is fast.\n\nLong report.");
    }

    #[tokio::test]
    async fn streaming_markup_chat_sends_only_the_fenced_block() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["good"]);
        let base = chat_upstream(
            &["good"],
            sse(&[
                r#"{"content":"*Thinking...*\n> planning\n"}"#,
                r#"{"content":"```html\n<p>rend"}"#,
                r#"{"content":"ered</p>\n```\nNotes after the page."}"#,
                "[DONE]",
            ]),
        )
        .await;
        let app = router(state(pool, test_client(&base)));

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({
                    "model": "Gemini-3.0-Flash (HTML)",
                    "stream": true,
                    "messages": [{ "role": "user", "content": "hi" }],
                }),
            ))
            .await
            .unwrap();
        let content = streamed_content(&body_text(response).await);
        assert_eq!(content, "<p>rendered</p>");
    }

    #[tokio::test]
    async fn mid_stream_failure_ends_with_error_event() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["good"]);
        let base = serve(Router::new().route(
            "/api/v1/ai/message/stream",
            post(|| async {
                let mut body = b"data: {\"content\":\"partial\"}\n\n".to_vec();
                body.extend_from_slice(b"data: \xff\xff\n\n");
                body
            }),
        ))
        .await;
        let app = router(state(pool.clone(), test_client(&base)));

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({ "stream": true, "messages": [{ "role": "user", "content": "hi" }] }),
            ))
            .await
            .unwrap();
        let text = body_text(response).await;
        assert!(!text.contains("[DONE]"));
        assert!(text.contains("\"error\""));
        assert_eq!(pool.credentials().unwrap()[0].status, CredentialStatus::Cooldown);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_requests() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["tok"]);
        let state = state(pool, test_client("http://127.0.0.1:9"));
        state.shutdown.cancel();

        let response = router(state)
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({ "messages": [{ "role": "user", "content": "hi" }] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["error"]["type"], "shutting_down");
    }

    #[tokio::test]
    async fn image_generation_returns_urls() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["tok"]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let base = serve(draw_router(seen.clone(), "completed")).await;
        let app = router(state(pool, test_client(&base)));

        let response = app
            .oneshot(post_json(
                "/v1/images/generations",
                json!({ "prompt": "a fox", "size": "1080x1920" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["data"][0]["url"], "https://img.example/1.png");
        assert_eq!(json["data"][0]["revised_prompt"], "a fox");

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0]["data"]["draw"]["ratio"], "9:16");
        assert!(seen[0]["data"]["draw"].get("original_image").is_none());
    }

    #[tokio::test]
    async fn image_model_through_chat_answers_with_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["tok"]);
        let base = serve(draw_router(Arc::new(Mutex::new(Vec::new())), "completed")).await;
        let app = router(state(pool, test_client(&base)));

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({ "model": "Nano-Banana (1:1)", "messages": [{ "role": "user", "content": "a fox" }] }),
            ))
            .await
            .unwrap();
        let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
        let content = json["choices"][0]["message"]["content"].as_str().unwrap();
        assert!(content.starts_with("![Generated Image](https://img.example/1.png)"));
    }

    #[tokio::test]
    async fn failed_image_task_is_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["tok"]);
        let base = serve(draw_router(Arc::new(Mutex::new(Vec::new())), "failed")).await;
        let app = router(state(pool, test_client(&base)));

        let response = app
            .oneshot(post_json("/v1/images/generations", json!({ "prompt": "a fox" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["error"]["type"], "image_task_failed");
    }

    #[tokio::test]
    async fn image_edit_requires_decodable_image() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["tok"]);
        let app = router(state(pool, test_client("http://127.0.0.1:9")));

        let response = app
            .oneshot(post_json(
                "/v1/images/edits",
                json!({ "prompt": "bluer", "image": "data:image/png;base64,@@@" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    fn multipart_edit(parts: &[(&str, Option<&str>, &str)]) -> Request<Body> {
        let boundary = "edit-boundary";
        let mut body = Vec::new();
        for (name, filename, value) in parts {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            match filename {
                Some(filename) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(value.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/v1/images/edits/upload")
            .header("content-type", format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn uploaded_image_edit_draws_from_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["tok"]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let base = serve(draw_router(seen.clone(), "completed")).await;
        let client = test_client(&base).with_upload_url(format!("{base}/upload"));
        let app = router(state(pool.clone(), client));

        let response = app
            .oneshot(multipart_edit(&[
                ("prompt", None, "make it blue"),
                ("size", None, "1920x1080"),
                ("image", Some("fox.png"), "png-bytes"),
            ]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["data"][0]["url"], "https://img.example/1.png");
        assert_eq!(json["data"][0]["revised_prompt"], "make it blue");

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0]["url"], "uploads/ref.png");
        let draw = &seen[1]["data"]["draw"];
        assert_eq!(draw["ratio"], "16:9");
        assert_eq!(draw["original_image"]["asset"], "77");
        assert_eq!(draw["original_image"]["weight"], 50);
        assert_eq!(pool.credentials().unwrap()[0].status, CredentialStatus::Active);
    }

    #[tokio::test]
    async fn uploaded_image_edit_requires_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["tok"]);
        let app = router(state(pool.clone(), test_client("http://127.0.0.1:9")));

        let response = app
            .clone()
            .oneshot(multipart_edit(&[("prompt", None, "make it blue"), ("image", Some("empty.png"), "")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["error"]["type"], "invalid_request_error");

        let response = app
            .oneshot(post_json("/v1/images/edits/upload", json!({ "prompt": "make it blue" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(pool.credentials().unwrap()[0].use_count, 0);
    }

    #[tokio::test]
    async fn models_lists_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &[]);
        let app = router(state(pool, test_client("http://127.0.0.1:9")));

        let response = app
            .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["object"], "list");
        let ids: Vec<&str> = json["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"Gemini-3.0-Flash (HTML)"));
        assert!(ids.contains(&"FLUX-2-Pro (16:9)"));
    }
}
