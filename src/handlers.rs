use crate::app::AppState;
use crate::auth;
use crate::error::{AppError, AppResult};
use crate::families::{partition, ModelFamily};
use crate::preprocess::{self, RewriteContext};
use crate::providers::Provider;
use crate::proxy;
use crate::sse;
use crate::ticket::Ticket;
use crate::tokens;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::Json;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const MODEL_LIST_CACHE_TTL: Duration = Duration::from_secs(60);

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn info(State(state): State<AppState>) -> impl IntoResponse {
    let mut queues = serde_json::Map::new();
    for family in ModelFamily::ALL {
        queues.insert(
            family.as_str().to_string(),
            json!({
                "queued": state.queue.depth(family).await,
                "usable_keys": state.keys.usable_count(family).await,
                "estimated_wait_ms": state.estimator.estimate(family).await.as_millis() as u64,
                "recent_completions": state.estimator.sample_count(family).await,
            }),
        );
    }
    Json(json!({
        "title": state.runtime.server_title,
        "uptime_sec": state.started_at.elapsed().as_secs(),
        "queues": queues,
    }))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "queued": state.queue.total_depth().await,
    }))
}

fn resolve_provider(prefix: &str) -> AppResult<Provider> {
    Provider::from_route_prefix(prefix).ok_or_else(|| {
        AppError::proxy(
            StatusCode::NOT_FOUND,
            format!("unknown provider route: {}", prefix),
        )
    })
}

pub async fn list_models(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> AppResult<Response> {
    let provider = resolve_provider(&provider)?;
    {
        let cache = state.model_cache.lock().await;
        if let Some((cached_at, payload)) = cache.get(&provider) {
            if cached_at.elapsed() < MODEL_LIST_CACHE_TTL {
                return Ok(Json(payload.clone()).into_response());
            }
        }
    }

    let mut data = Vec::new();
    let created = chrono::Utc::now().timestamp();
    for family in ModelFamily::ALL {
        if family.provider() != provider
            || !state.runtime.family_allowed(family)
            || state.keys.usable_count(family).await == 0
        {
            continue;
        }
        for model in family_models(family) {
            data.push(json!({
                "id": model,
                "object": "model",
                "created": created,
                "owned_by": provider.route_prefix(),
            }));
        }
    }
    let payload = json!({ "object": "list", "data": data });
    state
        .model_cache
        .lock()
        .await
        .insert(provider, (Instant::now(), payload.clone()));
    Ok(Json(payload).into_response())
}

fn family_models(family: ModelFamily) -> &'static [&'static str] {
    match family {
        ModelFamily::Turbo => &["gpt-3.5-turbo", "gpt-3.5-turbo-0613", "gpt-3.5-turbo-16k"],
        ModelFamily::Gpt4 => &["gpt-4", "gpt-4-0613"],
        ModelFamily::Gpt4_32k => &["gpt-4-32k", "gpt-4-32k-0613"],
        ModelFamily::Claude => &["claude-v1", "claude-instant-v1", "claude-2"],
        ModelFamily::Bison => &["text-bison-001"],
        ModelFamily::AwsClaude => &[
            "anthropic.claude-v1",
            "anthropic.claude-v2",
            "anthropic.claude-instant-v1",
        ],
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    #[serde(default, rename = "badSseParser")]
    bad_sse_parser: Option<String>,
    #[serde(default, rename = "proxyDebug")]
    proxy_debug: Option<String>,
}

fn flag(value: &Option<String>) -> bool {
    matches!(value.as_deref(), Some("true") | Some("1"))
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<ChatQuery>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let provider = resolve_provider(&provider)?;
    let identity = auth::identify(&state.runtime, &headers)?;
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let family = partition(provider, &model);
    if !state.runtime.family_allowed(family) {
        return Err(AppError::proxy(
            StatusCode::FORBIDDEN,
            format!("model family {} is not served by this proxy", family),
        ));
    }
    let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    let mut ticket = Ticket::new(identity, provider, family, model, body, stream);
    ticket.bad_sse_parser = flag(&query.bad_sse_parser);
    ticket.debug = flag(&query.proxy_debug);
    ticket.prompt_tokens = tokens::estimate_prompt_tokens(&ticket.body);
    ticket.forward_headers = headers.clone();

    let mut ctx = RewriteContext {
        config: &state.runtime,
        ticket: &mut ticket,
        inbound_headers: &headers,
    };
    preprocess::run(&mut ctx)
        .map_err(|err| AppError::proxy(err.status(), err.to_string()))?;

    if stream {
        // Admission happens before the SSE channel opens so a queue
        // rejection still surfaces as a plain 429.
        let pending = proxy::enqueue_ticket(&state, &ticket).await?;
        let (tx, rx) = mpsc::channel::<Event>(64);
        let worker_state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = proxy::execute_streaming(&worker_state, &mut ticket, pending, &tx).await
            {
                let _ = tx.send(sse::error_event(&err)).await;
                let _ = tx.send(sse::done_event()).await;
            }
        });
        let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok::<_, Infallible>);
        Ok(Sse::new(stream).into_response())
    } else {
        let value = proxy::execute_buffered(&state, &mut ticket).await?;
        Ok(Json(value).into_response())
    }
}

/// Anything else under a provider prefix: browsers get bounced to the info
/// page, API clients get a 404. Paths outside the provider routes are a
/// plain 404 either way.
pub async fn fallback(headers: HeaderMap, uri: Uri) -> Response {
    let provider_prefixed = uri
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .and_then(Provider::from_route_prefix)
        .is_some();
    let is_browser = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|ua| ua.to_lowercase().contains("mozilla"))
        .unwrap_or(false);
    if provider_prefixed && is_browser {
        return (StatusCode::FOUND, [(axum::http::header::LOCATION, "/")]).into_response();
    }
    AppError::proxy(StatusCode::NOT_FOUND, format!("no route for {}", uri.path()))
        .into_response()
}
