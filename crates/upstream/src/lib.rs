//! Wire protocol for the upstream chat/image service
//!
//! Everything the gateway needs to talk to the upstream without knowing
//! about credentials or pooling:
//!
//! - `model`: public model names → upstream model, output mode, aspect ratio
//! - `payload`: request bodies for chat and draw calls
//! - `sse`: line framing of the `text/event-stream` response body
//! - `frame`: one `data:` payload → `RawChunk` (text, rotated secret, task id)
//! - `client`: the HTTP calls themselves

pub mod client;
pub mod error;
pub mod frame;
pub mod model;
pub mod payload;
pub mod sse;

pub use client::{DrawSubmission, IMAGE_JOB_OVERHEAD, UpstreamClient, UpstreamStream};
pub use error::{FailureKind, Result, UpstreamError, classify_status};
pub use frame::{Frame, RawChunk, parse_frame};
pub use model::{CatalogEntry, ChatModel, ImageModel, ModelSpec, OutputMode, catalog, is_image_model, parse_model};
pub use payload::{Reference, chat_payload, draw_payload, flatten_prompt};
pub use sse::SseDecoder;
