//! Upstream relay
//!
//! Binds one `Lease` to one upstream call. Text chunks flow out in order,
//! rotated secrets are written through the lease as soon as a frame
//! announces them, and the lease is released exactly once: `Success` when
//! the upstream finishes, `Failure` when it errors, or from the lease's own
//! `Drop` when the caller stops reading.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use credential_pool::{Lease, Outcome};
use futures_util::Stream;
use futures_util::stream::{BoxStream, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};
use upstream::{
    Frame, ImageModel, Reference, SseDecoder, UpstreamClient, UpstreamError, UpstreamStream,
    draw_payload, parse_frame,
};

use crate::metrics;
use crate::openai::ReferenceImage;

/// Release a lease after a failed upstream call.
fn fail(mut lease: Lease, err: &UpstreamError) {
    lease.mark_upstream_failed();
    metrics::record_upstream_error(err.kind());
    warn!(
        credential_id = lease.id(),
        error_type = err.kind(),
        error = %err,
        "upstream call failed"
    );
    if let Err(e) = lease.release(Outcome::Failure) {
        warn!(error = %e, "failed to release credential after upstream failure");
    }
}

fn succeed(lease: Lease) {
    let id = lease.id().to_string();
    if let Err(e) = lease.release(Outcome::Success) {
        warn!(credential_id = id, error = %e, "failed to release credential");
    }
}

/// Open a chat stream with the leased credential.
///
/// A failure here happens before any byte reaches the caller, so the lease
/// is already released as `Failure` when the error is returned.
pub async fn open(
    client: &UpstreamClient,
    mut lease: Lease,
    body: &Value,
) -> Result<RelayStream, UpstreamError> {
    match client.open_stream(lease.secret(), body).await {
        Ok(UpstreamStream {
            rotated_secret,
            body,
        }) => {
            if let Some(secret) = rotated_secret {
                lease.refresh(&secret);
            }
            debug!(credential_id = lease.id(), "upstream stream opened");
            Ok(RelayStream::new(lease, body))
        }
        Err(e) => {
            fail(lease, &e);
            Err(e)
        }
    }
}

/// Text chunks of one upstream answer.
///
/// Yields `Err` at most once, after which the stream is over. Dropping the
/// stream early drops the lease, which settles itself from what it saw.
pub struct RelayStream {
    lease: Option<Lease>,
    body: BoxStream<'static, upstream::Result<Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    upstream_done: bool,
}

impl RelayStream {
    fn new(lease: Lease, body: BoxStream<'static, upstream::Result<Bytes>>) -> Self {
        Self {
            lease: Some(lease),
            body,
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            upstream_done: false,
        }
    }

    /// Id of the credential serving this stream, while it is still held.
    pub fn credential_id(&self) -> Option<&str> {
        self.lease.as_ref().map(Lease::id)
    }

    /// Queue the text of each payload; returns true once `[DONE]` is seen.
    fn absorb(&mut self, payloads: Vec<String>) -> bool {
        for payload in payloads {
            match parse_frame(&payload) {
                Frame::Done => return true,
                Frame::Chunk(chunk) => {
                    if let (Some(secret), Some(lease)) = (&chunk.rotated_secret, self.lease.as_mut()) {
                        lease.refresh(secret);
                    }
                    if !chunk.text.is_empty() {
                        self.pending.push_back(chunk.text);
                    }
                }
            }
        }
        false
    }

    fn fail(&mut self, err: UpstreamError) -> Poll<Option<Result<String, UpstreamError>>> {
        self.upstream_done = true;
        self.pending.clear();
        if let Some(lease) = self.lease.take() {
            fail(lease, &err);
        }
        Poll::Ready(Some(Err(err)))
    }
}

impl Stream for RelayStream {
    type Item = Result<String, UpstreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(text) = this.pending.pop_front() {
                if let Some(lease) = this.lease.as_mut() {
                    lease.mark_delivered();
                }
                return Poll::Ready(Some(Ok(text)));
            }
            if this.upstream_done {
                if let Some(lease) = this.lease.take() {
                    succeed(lease);
                }
                return Poll::Ready(None);
            }

            match this.body.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(bytes))) => match this.decoder.push(&bytes) {
                    Ok(payloads) => this.upstream_done = this.absorb(payloads),
                    Err(e) => return this.fail(e),
                },
                Poll::Ready(Some(Err(e))) => return this.fail(e),
                Poll::Ready(None) => match this.decoder.finish() {
                    Ok(tail) => {
                        this.absorb(tail.into_iter().collect());
                        this.upstream_done = true;
                    }
                    Err(e) => return this.fail(e),
                },
            }
        }
    }
}

/// One text-to-image or image-to-image job.
#[derive(Debug)]
pub struct ImageJob<'a> {
    pub prompt: &'a str,
    pub model: &'a ImageModel,
    pub reference: Option<&'a ReferenceImage>,
    pub reference_weight: u8,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

/// Run an image job to completion with the leased credential.
///
/// Upload, submission and polling all present the lease's current secret,
/// so a rotation announced at submission is used for the polls. A task the
/// upstream reports as failed is an answer, not a credential failure.
pub async fn run_image_job(
    client: &UpstreamClient,
    mut lease: Lease,
    job: ImageJob<'_>,
) -> Result<Vec<String>, UpstreamError> {
    match drive_image_job(client, &mut lease, &job).await {
        Ok(urls) if urls.is_empty() => {
            succeed(lease);
            metrics::record_upstream_error("task_failed");
            Err(UpstreamError::TaskFailed("task completed without images".into()))
        }
        Ok(urls) => {
            lease.mark_delivered();
            succeed(lease);
            Ok(urls)
        }
        Err(e @ UpstreamError::TaskFailed(_)) => {
            metrics::record_upstream_error(e.kind());
            warn!(credential_id = lease.id(), error = %e, "image task failed upstream");
            succeed(lease);
            Err(e)
        }
        Err(e) => {
            fail(lease, &e);
            Err(e)
        }
    }
}

async fn drive_image_job(
    client: &UpstreamClient,
    lease: &mut Lease,
    job: &ImageJob<'_>,
) -> Result<Vec<String>, UpstreamError> {
    let reference = match job.reference {
        Some(image) => {
            let asset_id = client
                .upload_reference(lease.secret(), &image.bytes, &image.filename)
                .await?;
            Some(Reference {
                asset_id,
                weight: job.reference_weight,
            })
        }
        None => None,
    };

    let body = draw_payload(job.prompt, &job.model.upstream, job.model.ratio, reference.as_ref());
    let submission = client.submit_draw(lease.secret(), &body).await?;
    if let Some(secret) = submission.rotated_secret {
        lease.refresh(&secret);
    }
    info!(
        credential_id = lease.id(),
        task_id = %submission.task_id,
        model = job.model.upstream,
        ratio = job.model.ratio,
        image_to_image = reference.is_some(),
        "polling draw task"
    );

    client
        .poll_task(lease.secret(), &submission.task_id, job.poll_interval, job.poll_timeout)
        .await
}
