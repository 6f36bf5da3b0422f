//! SSE shaping for streamed completions.
//!
//! Upstream chunks are re-framed as OpenAI-style deltas. Cost finalization,
//! deduction, and usage recording all happen after the upstream final chunk
//! but before the usage frame is flushed, so the credit numbers the client
//! sees are authoritative. On client disconnect the upstream call is
//! canceled and any partial usage already reported is charged with
//! `finish_reason=canceled`; with no usage observed, nothing is charged.

use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::Orchestrator;
use crate::api::types::{CompletionStreamFrame, UsageInfo};
use crate::auth::AuthContext;
use crate::domain::{ModelRecord, Operation};
use crate::providers::{FinishReason, NormalizedUsage, ProviderStream, StreamChunk};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const CHANNEL_CAPACITY: usize = 64;

pub(crate) fn serve(
    orchestrator: Arc<Orchestrator>,
    ctx: AuthContext,
    model: ModelRecord,
    operation: Operation,
    chat: bool,
    upstream: ProviderStream,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(CHANNEL_CAPACITY);
    let timeout = orchestrator.stream_timeout();

    let frame_id = if chat {
        format!("chatcmpl-{}", Uuid::new_v4().simple())
    } else {
        format!("cmpl-{}", Uuid::new_v4().simple())
    };

    tokio::spawn(run(
        orchestrator,
        ctx,
        model,
        operation,
        chat,
        upstream,
        tx,
        frame_id,
        timeout,
    ));

    let events = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    });

    let mut response = Sse::new(events)
        .keep_alive(
            KeepAlive::new()
                .interval(KEEP_ALIVE_INTERVAL)
                .text("keep-alive"),
        )
        .into_response();

    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
    response
}

struct Observed {
    usage: Option<NormalizedUsage>,
    finish_reason: Option<FinishReason>,
    disconnected: bool,
    timed_out: bool,
    upstream_error: Option<crate::domain::GatewayError>,
}

#[allow(clippy::too_many_arguments)]
async fn run(
    orchestrator: Arc<Orchestrator>,
    ctx: AuthContext,
    model: ModelRecord,
    operation: Operation,
    chat: bool,
    mut upstream: ProviderStream,
    tx: mpsc::Sender<Result<Event, Infallible>>,
    frame_id: String,
    timeout: Duration,
) {
    let started = Instant::now();
    let mut observed = Observed {
        usage: None,
        finish_reason: None,
        disconnected: false,
        timed_out: false,
        upstream_error: None,
    };

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                warn!(user_id = %ctx.user_id, model_id = %model.id, "stream hit timeout ceiling");
                observed.timed_out = true;
                break;
            }
            item = upstream.next() => match item {
                Some(Ok(chunk)) => {
                    if !forward_chunk(&tx, &frame_id, &model.id, chat, &chunk, &mut observed).await {
                        observed.disconnected = true;
                        break;
                    }
                }
                Some(Err(e)) => {
                    observed.upstream_error = Some(e);
                    break;
                }
                None => break,
            }
        }
    }

    // Dropping the upstream stream cancels the in-flight provider call.
    drop(upstream);

    finalize(
        orchestrator,
        ctx,
        model,
        operation,
        chat,
        tx,
        frame_id,
        observed,
        started.elapsed().as_millis() as u64,
    )
    .await;
}

/// Returns false when the client has gone away.
async fn forward_chunk(
    tx: &mpsc::Sender<Result<Event, Infallible>>,
    frame_id: &str,
    model_id: &str,
    chat: bool,
    chunk: &StreamChunk,
    observed: &mut Observed,
) -> bool {
    if let Some(usage) = chunk.usage {
        observed.usage = Some(usage);
    }
    if let Some(reason) = chunk.finish_reason {
        observed.finish_reason = Some(reason);
    }

    if chunk.delta.is_empty() {
        return true;
    }

    let frame = CompletionStreamFrame::delta(frame_id, model_id, chat, chunk.delta.clone());
    send_json(tx, &frame).await
}

async fn send_json<T: serde::Serialize>(
    tx: &mpsc::Sender<Result<Event, Infallible>>,
    payload: &T,
) -> bool {
    let data = match serde_json::to_string(payload) {
        Ok(data) => data,
        Err(e) => {
            error!(error = %e, "failed to serialize stream frame");
            return true;
        }
    };
    tx.send(Ok(Event::default().data(data))).await.is_ok()
}

#[allow(clippy::too_many_arguments)]
async fn finalize(
    orchestrator: Arc<Orchestrator>,
    ctx: AuthContext,
    model: ModelRecord,
    operation: Operation,
    chat: bool,
    tx: mpsc::Sender<Result<Event, Infallible>>,
    frame_id: String,
    observed: Observed,
    duration_ms: u64,
) {
    let canceled = observed.disconnected || observed.timed_out;

    if let Some(e) = observed.upstream_error {
        // Mid-stream upstream failure: nothing was charged (no usage was
        // observed), surface an error frame and close without [DONE].
        warn!(user_id = %ctx.user_id, model_id = %model.id, error = %e, "upstream stream failed");
        if observed.usage.is_none() {
            let frame = json!({
                "error": {
                    "code": "service_unavailable",
                    "message": "upstream provider interrupted the stream",
                }
            });
            send_json(&tx, &frame).await;
            return;
        }
    }

    let Some(usage) = observed.usage else {
        if canceled {
            // Canceled before the provider reported anything: no deduction,
            // no usage record.
            debug!(user_id = %ctx.user_id, "stream canceled before usage, nothing charged");
        } else {
            error!(
                user_id = %ctx.user_id,
                model_id = %model.id,
                "stream ended without usage, cannot bill"
            );
        }
        return;
    };

    let finish_reason = if canceled {
        FinishReason::Canceled
    } else {
        observed.finish_reason.unwrap_or(FinishReason::Stop)
    };

    match orchestrator
        .finalize_and_charge(&ctx, &model, operation, &usage, finish_reason, duration_ms)
        .await
    {
        Ok(outcome) => {
            if !canceled {
                let info = UsageInfo::build(&usage, &outcome);
                let frame = CompletionStreamFrame::finish(
                    &frame_id,
                    &model.id,
                    chat,
                    finish_reason,
                    info,
                );
                if send_json(&tx, &frame).await {
                    let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
                }
            }
        }
        Err(e) => {
            error!(
                user_id = %ctx.user_id,
                model_id = %model.id,
                error = %e,
                "stream cost finalization failed"
            );
        }
    }
}
