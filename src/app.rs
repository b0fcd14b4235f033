use crate::config::RuntimeConfig;
use crate::dispatcher;
use crate::error::{AppError, AppResult};
use crate::estimator::WaitTimeEstimator;
use crate::keys::KeyPool;
use crate::providers::Provider;
use crate::queue::RequestQueue;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Once, OnceLock};
use std::time::Instant;
use tokio::sync::Mutex;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub http: reqwest::Client,
    pub keys: Arc<KeyPool>,
    pub queue: Arc<RequestQueue>,
    pub estimator: Arc<WaitTimeEstimator>,
    pub metrics: PrometheusHandle,
    pub started_at: Instant,
    pub model_cache: Arc<Mutex<HashMap<Provider, (Instant, Value)>>>,
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

/// Builds the shared state and spawns the dispatcher and stall-sweep loops.
pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("keymux/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proxy_error",
                format!("http client init failed: {}", err),
            )
        })?;

    let metrics = init_metrics()?;
    let runtime = Arc::new(runtime);
    let keys = Arc::new(KeyPool::from_config(&runtime));
    let queue = Arc::new(RequestQueue::new());
    let estimator = Arc::new(WaitTimeEstimator::new(runtime.sample_retention));

    dispatcher::spawn_dispatcher(queue.clone(), keys.clone(), runtime.dispatch_tick);
    dispatcher::spawn_stall_sweep(
        queue.clone(),
        estimator.clone(),
        runtime.sweep_interval,
        runtime.stall_timeout,
    );

    Ok(AppState {
        runtime,
        http,
        keys,
        queue,
        estimator,
        metrics,
        started_at: Instant::now(),
        model_cache: Arc::new(Mutex::new(HashMap::new())),
    })
}

pub fn build_app(state: AppState) -> Router {
    Router::<AppState>::new()
        .route("/", get(crate::handlers::info))
        .route("/health", get(crate::handlers::health))
        .route("/metrics", get(crate::handlers::metrics))
        .route(
            "/{provider}/v1/chat/completions",
            post(crate::handlers::chat_completions),
        )
        // Clients that drop the /v1 prefix get it back implicitly.
        .route(
            "/{provider}/chat/completions",
            post(crate::handlers::chat_completions),
        )
        .route("/{provider}/v1/models", get(crate::handlers::list_models))
        .route("/{provider}/models", get(crate::handlers::list_models))
        .fallback(crate::handlers::fallback)
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "proxy_error",
                    format!("metrics init failed: {}", err),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "proxy_error",
            "metrics recorder not available",
        )
    })
}
