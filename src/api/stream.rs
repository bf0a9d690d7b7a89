// src/api/stream.rs
// SSE streaming endpoint: one request-owned event queue drained to the
// client as data: frames. Client disconnect drops the body stream, which
// cancels the pipeline task at its next suspension point.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::error::ApiError;
use crate::events::EventSender;
use crate::router::{SendMessageRequest, run_query_stream};
use crate::state::AppState;

pub async fn stream_message_tokens(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Response {
    if state.storage.get(&id).is_none() {
        return ApiError::not_found("Conversation not found").into_response();
    }

    info!(conversation = id, "starting token stream");

    let (events, rx) = EventSender::channel();
    let cancel = CancellationToken::new();
    let pipeline_cancel = cancel.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = run_query_stream(state, id, request, events) => {}
            _ = pipeline_cancel.cancelled() => {
                debug!("client disconnected, pipeline torn down");
            }
        }
    });

    // The drop guard cancels the pipeline when the client goes away and the
    // body stream is dropped.
    let guard = cancel.drop_guard();
    let body_stream = UnboundedReceiverStream::new(rx).map(move |event| {
        let _ = &guard;
        Ok::<_, Infallible>(event.to_sse_frame())
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| ApiError::internal("failed to build stream response").into_response())
}
