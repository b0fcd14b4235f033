use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::estimator::WaitSample;
use crate::normalize::normalize_response;
use crate::providers::build_upstream_request;
use crate::queue::{EnqueueError, QueueGuard, QueuedEntry, Resume};
use crate::sse;
use crate::ticket::Ticket;
use crate::tokens;
use axum::http::StatusCode;
use axum::response::sse::Event;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

pub const STALL_TIMEOUT_MESSAGE: &str =
    "Your request has been terminated by the proxy because it sat in the queue for too long.";

/// How an upstream failure is handled, per the classification table.
#[derive(Debug)]
enum UpstreamFailure {
    /// Permanent credential failure: disable the key, rebind to another.
    KeyRevoked(String),
    /// Transient: lock the key out of the family and reenqueue.
    RateLimited(Option<Duration>),
    /// The key's quota or billing is gone; terminal for the client.
    QuotaExhausted,
    /// Non-retryable client error; forward the upstream body.
    Terminal(StatusCode, Value),
}

pub fn stall_timeout_error() -> AppError {
    AppError::proxy(StatusCode::INTERNAL_SERVER_ERROR, STALL_TIMEOUT_MESSAGE)
}

/// A ticket that has been admitted to the queue but not yet resumed. Holds
/// the abort guard so dropping the waiter removes the ticket.
pub struct PendingDispatch {
    rx: oneshot::Receiver<Resume>,
    guard: QueueGuard,
}

/// Admission: pushes the ticket onto the shared queue, enforcing the
/// identity-concurrency cap. Returns a 429 on rejection, before any response
/// bytes have gone to the client.
pub async fn enqueue_ticket(state: &AppState, ticket: &Ticket) -> AppResult<PendingDispatch> {
    let (tx, rx) = oneshot::channel();
    let entry = QueuedEntry {
        id: ticket.id,
        identity: ticket.identity.clone(),
        family: ticket.family,
        deprioritized: ticket.deprioritized(),
        retry: ticket.retry_count > 0,
        started_at: ticket.started_at,
        resume: tx,
    };
    state.queue.enqueue(entry).await.map_err(|err| match err {
        EnqueueError::TooManyQueued { .. } => {
            AppError::proxy(StatusCode::TOO_MANY_REQUESTS, err.to_string())
        }
        EnqueueError::Duplicate => AppError::proxy(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ticket was enqueued twice",
        ),
    })?;
    Ok(PendingDispatch {
        rx,
        guard: QueueGuard::new(state.queue.clone(), ticket.id),
    })
}

/// Suspends until the dispatcher resumes the ticket or the stall sweep
/// expires it.
async fn await_dispatch(ticket: &mut Ticket, pending: PendingDispatch) -> AppResult<()> {
    let PendingDispatch { rx, mut guard } = pending;
    let resume = rx.await;
    guard.disarm();
    match resume {
        Ok(Resume::Dispatch) => {
            ticket.queue_out_at = Some(Instant::now());
            Ok(())
        }
        Ok(Resume::Expired) | Err(_) => Err(stall_timeout_error()),
    }
}

fn retry_after_from(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn body_mentions(body: &Value, needles: &[&str]) -> bool {
    let text = body.to_string().to_lowercase();
    needles.iter().any(|n| text.contains(n))
}

fn classify_failure(
    status: StatusCode,
    body: Value,
    retry_after: Option<Duration>,
) -> UpstreamFailure {
    match status {
        StatusCode::UNAUTHORIZED => UpstreamFailure::KeyRevoked("401 from upstream".to_string()),
        StatusCode::FORBIDDEN => {
            if body_mentions(
                &body,
                &["permission_denied", "invalid", "disabled", "deactivated"],
            ) {
                UpstreamFailure::KeyRevoked("403 permanent-invalid from upstream".to_string())
            } else {
                UpstreamFailure::Terminal(status, body)
            }
        }
        StatusCode::TOO_MANY_REQUESTS => {
            if body_mentions(
                &body,
                &["insufficient_quota", "billing", "exceeded your current quota"],
            ) {
                UpstreamFailure::QuotaExhausted
            } else {
                UpstreamFailure::RateLimited(retry_after)
            }
        }
        s if s.is_server_error() => UpstreamFailure::RateLimited(retry_after),
        s => UpstreamFailure::Terminal(s, body),
    }
}

fn terminal_error(status: StatusCode, body: Value) -> AppError {
    let message = body
        .get("error")
        .and_then(|e| e.get("message"))
        .or_else(|| body.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| body.to_string());
    AppError::new(status, "upstream_error", message)
}

enum Attempt {
    Success(reqwest::Response),
    /// Retryable failure already absorbed; caller loops.
    Reenqueue,
    Fatal(AppError),
}

/// One dispatch cycle: wait for a resume, lease a key, fire the request, and
/// absorb retryable failures by reenqueueing. A lease miss (another handler
/// won the race for the last key) goes back to the queue without counting as
/// a retry. Streaming tickets pass their SSE sender so heartbeats run for
/// exactly the span of the queue wait, never alongside real output.
async fn attempt_once(
    state: &AppState,
    ticket: &mut Ticket,
    pending: Option<PendingDispatch>,
    heartbeat_tx: Option<&mpsc::Sender<Event>>,
) -> AppResult<(Attempt, String)> {
    let pending = match pending {
        Some(pending) => pending,
        None => enqueue_ticket(state, ticket).await?,
    };
    let heartbeat = heartbeat_tx.map(|tx| spawn_heartbeat(state, ticket, tx.clone()));
    let resumed = await_dispatch(ticket, pending).await;
    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }
    resumed?;
    let Some(key) = state.keys.lease(ticket.family).await else {
        return Ok((Attempt::Reenqueue, String::new()));
    };

    let request = build_upstream_request(
        &state.http,
        &state.runtime,
        ticket.provider,
        &ticket.model,
        &ticket.body,
        &ticket.forward_headers,
        &key,
        state.runtime.upstream_timeout,
    )?;
    let response = match state.http.execute(request).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!("upstream socket error for {}: {}", ticket.family, err);
            state
                .keys
                .mark_rate_limited(&key.id, ticket.family, None)
                .await;
            ticket.retry_count += 1;
            metrics::counter!("keymux_retries_total", "family" => ticket.family.as_str())
                .increment(1);
            return Ok((Attempt::Reenqueue, key.id));
        }
    };

    let status = response.status();
    if status.is_success() {
        return Ok((Attempt::Success(response), key.id));
    }

    let retry_after = retry_after_from(response.headers());
    let text = response.text().await.unwrap_or_default();
    let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));
    tracing::warn!(
        "upstream returned {} for {} (retry {})",
        status,
        ticket.family,
        ticket.retry_count
    );
    match classify_failure(status, body, retry_after) {
        UpstreamFailure::KeyRevoked(reason) => {
            state.keys.disable(&key.id, &reason).await;
            ticket.retry_count += 1;
            Ok((Attempt::Reenqueue, key.id))
        }
        UpstreamFailure::RateLimited(retry_after) => {
            state
                .keys
                .mark_rate_limited(&key.id, ticket.family, retry_after)
                .await;
            ticket.retry_count += 1;
            metrics::counter!("keymux_retries_total", "family" => ticket.family.as_str())
                .increment(1);
            Ok((Attempt::Reenqueue, key.id))
        }
        UpstreamFailure::QuotaExhausted => {
            state.keys.disable(&key.id, "quota exhausted").await;
            Ok((
                Attempt::Fatal(AppError::proxy(
                    StatusCode::TOO_MANY_REQUESTS,
                    "the assigned upstream key has exhausted its quota",
                )),
                key.id,
            ))
        }
        UpstreamFailure::Terminal(status, body) => {
            Ok((Attempt::Fatal(terminal_error(status, body)), key.id))
        }
    }
}

async fn finish_success(state: &AppState, ticket: &Ticket, key_id: &str) {
    let end = ticket.queue_out_at.unwrap_or_else(Instant::now);
    state
        .estimator
        .record(WaitSample {
            family: ticket.family,
            start: ticket.started_at,
            end,
            deprioritized: ticket.deprioritized(),
        })
        .await;
    state
        .keys
        .record_usage(
            key_id,
            ticket.family,
            ticket.prompt_tokens + ticket.output_tokens,
        )
        .await;
    metrics::counter!(
        "keymux_proxied_requests_total",
        "provider" => ticket.provider.route_prefix(),
        "family" => ticket.family.as_str()
    )
    .increment(1);
}

/// Buffered mode: read the whole upstream response, normalize, hand back one
/// JSON body.
pub async fn execute_buffered(state: &AppState, ticket: &mut Ticket) -> AppResult<Value> {
    loop {
        let (attempt, key_id) = attempt_once(state, ticket, None, None).await?;
        match attempt {
            Attempt::Reenqueue => continue,
            Attempt::Fatal(err) => return Err(err),
            Attempt::Success(response) => {
                let upstream: Value = response.json().await.map_err(|err| {
                    AppError::new(
                        StatusCode::BAD_GATEWAY,
                        "upstream_error",
                        format!("upstream returned unparseable JSON: {}", err),
                    )
                })?;
                let client_body = normalize_response(ticket, upstream, &state.runtime);
                finish_success(state, ticket, &key_id).await;
                return Ok(client_body);
            }
        }
    }
}

/// Streaming mode: the SSE channel to the client is already open (heartbeats
/// went out during the queue wait), so retries are only possible while no
/// model output has been forwarded yet. The whole loop races against the
/// client hanging up.
pub async fn execute_streaming(
    state: &AppState,
    ticket: &mut Ticket,
    pending: PendingDispatch,
    tx: &mpsc::Sender<Event>,
) -> AppResult<()> {
    let ticket_id = ticket.id;
    tokio::select! {
        result = streaming_attempts(state, ticket, pending, tx) => result,
        _ = tx.closed() => {
            state.queue.remove(ticket_id).await;
            tracing::debug!("client aborted ticket {} during queue wait", ticket_id);
            Ok(())
        }
    }
}

async fn streaming_attempts(
    state: &AppState,
    ticket: &mut Ticket,
    pending: PendingDispatch,
    tx: &mpsc::Sender<Event>,
) -> AppResult<()> {
    let mut pending = Some(pending);
    loop {
        let (attempt, key_id) = attempt_once(state, ticket, pending.take(), Some(tx)).await?;
        match attempt {
            Attempt::Reenqueue => continue,
            Attempt::Fatal(err) => return Err(err),
            Attempt::Success(response) => {
                if ticket.provider.streams_natively() {
                    forward_native_stream(ticket, response, tx).await?;
                } else {
                    emit_synthetic_stream(state, ticket, response, tx).await?;
                }
                finish_success(state, ticket, &key_id).await;
                return Ok(());
            }
        }
    }
}

fn spawn_heartbeat(
    state: &AppState,
    ticket: &Ticket,
    tx: mpsc::Sender<Event>,
) -> tokio::task::JoinHandle<()> {
    let queue = state.queue.clone();
    let estimator = state.estimator.clone();
    let family = ticket.family;
    let model = ticket.model.clone();
    let interval = state.runtime.heartbeat_interval;
    let diagnostic = state.runtime.heartbeat_diagnostics;
    let bad_sse_parser = ticket.bad_sse_parser;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let depth = queue.depth(family).await;
            let wait = estimator.estimate(family).await;
            let Some(event) = sse::heartbeat_event(&model, depth, wait, diagnostic, bad_sse_parser)
            else {
                continue;
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
    })
}

/// OpenAI chunks pass through untouched; Anthropic completion events are
/// rewritten into OpenAI chunks on the fly.
async fn forward_native_stream(
    ticket: &mut Ticket,
    response: reqwest::Response,
    tx: &mpsc::Sender<Event>,
) -> AppResult<()> {
    let chunk_id = format!("chatcmpl-{}", ticket.id.simple());
    let mut collected = String::new();
    let mut sent_role = false;
    let mut stream = response.bytes_stream().eventsource();
    while let Some(event) = stream.next().await {
        let Ok(event) = event else { continue };
        if event.data.trim() == "[DONE]" {
            break;
        }
        let data: Value = match serde_json::from_str(&event.data) {
            Ok(value) => value,
            Err(_) => continue,
        };
        match ticket.outbound {
            crate::providers::ApiDialect::OpenAi => {
                if let Some(delta) = data
                    .pointer("/choices/0/delta/content")
                    .and_then(|v| v.as_str())
                {
                    collected.push_str(delta);
                }
                if tx.send(sse::chunk_event(&data)).await.is_err() {
                    break;
                }
            }
            _ => {
                // Anthropic: each event carries a completion delta.
                let Some(delta) = data.get("completion").and_then(|v| v.as_str()) else {
                    continue;
                };
                if !sent_role {
                    let role = sse::openai_chunk(
                        &chunk_id,
                        &ticket.model,
                        json!({"role": "assistant"}),
                        None,
                    );
                    if tx.send(sse::chunk_event(&role)).await.is_err() {
                        break;
                    }
                    sent_role = true;
                }
                collected.push_str(delta);
                let chunk =
                    sse::openai_chunk(&chunk_id, &ticket.model, json!({"content": delta}), None);
                if tx.send(sse::chunk_event(&chunk)).await.is_err() {
                    break;
                }
            }
        }
    }
    // Even if the client went away mid-stream, usage is still recorded by
    // the caller; the upstream body was dropped, which aborts the transfer.
    ticket.output_tokens = tokens::estimate_text_tokens(&collected);
    if ticket.outbound != crate::providers::ApiDialect::OpenAi {
        let last = sse::openai_chunk(&chunk_id, &ticket.model, json!({}), Some("stop"));
        let _ = tx.send(sse::chunk_event(&last)).await;
    }
    let _ = tx.send(sse::done_event()).await;
    Ok(())
}

/// PaLM and Bedrock do not stream SSE to us: buffer the upstream response,
/// normalize it, then replay it to the client as a short synthetic stream.
async fn emit_synthetic_stream(
    state: &AppState,
    ticket: &mut Ticket,
    response: reqwest::Response,
    tx: &mpsc::Sender<Event>,
) -> AppResult<()> {
    let upstream: Value = response.json().await.map_err(|err| {
        AppError::new(
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            format!("upstream returned unparseable JSON: {}", err),
        )
    })?;
    let normalized = normalize_response(ticket, upstream, &state.runtime);
    let content = normalized
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let chunk_id = normalized
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or("chatcmpl-proxy")
        .to_string();

    let role = sse::openai_chunk(&chunk_id, &ticket.model, json!({"role": "assistant"}), None);
    let body = sse::openai_chunk(&chunk_id, &ticket.model, json!({"content": content}), None);
    let last = sse::openai_chunk(&chunk_id, &ticket.model, json!({}), Some("stop"));
    for event in [
        sse::chunk_event(&role),
        sse::chunk_event(&body),
        sse::chunk_event(&last),
        sse::done_event(),
    ] {
        if tx.send(event).await.is_err() {
            break;
        }
    }
    Ok(())
}
