use crate::config::{AppConfig, ConfigHandle, ConfigSnapshot, config_path_from_env, load_config};
use crate::error::{AppError, AppResult};
use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: ConfigHandle,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

pub async fn load_state() -> AppResult<AppState> {
    let config = load_config(&config_path_from_env())?;
    load_state_with_config(config)
}

pub fn load_state_with_config(config: AppConfig) -> AppResult<AppState> {
    let snapshot = ConfigSnapshot::new(config);
    tracing::info!(
        services = snapshot.services().len(),
        client_keys = snapshot.config.client_authentication.allowed_keys.len(),
        models = snapshot.visible_models().len(),
        "configuration loaded"
    );

    let http = reqwest::Client::builder()
        .user_agent("toolgate/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let metrics = init_metrics()?;

    Ok(AppState {
        config: ConfigHandle::new(snapshot),
        http,
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    Router::<AppState>::new()
        .route("/", get(crate::handlers::service_status))
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route("/metrics", get(crate::handlers::metrics))
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
