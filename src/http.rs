use crate::config::Endpoints;
use crate::gauges::DerivedGauges;
use crate::settings::ConfigUpdate;
use crate::state::{GaugeSource, InferenceRecord, ModelStatus, NodeStatus};
use crate::tasks::{self, AppContext};
use crate::upstream::UpstreamError;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::SystemTime;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    pub model_service_url: String,
    pub node_exporter_url: String,
    pub node_name: String,
    pub api_base_url: String,
}

impl From<Endpoints> for ApiConfig {
    fn from(value: Endpoints) -> Self {
        Self {
            model_service_url: value.model_service_url,
            node_exporter_url: value.node_exporter_url,
            node_name: value.node_name,
            api_base_url: value.api_base_url,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiNode {
    pub node_name: String,
    pub online: bool,
    pub source: GaugeSource,
    pub cpu_usage_percent: Option<f64>,
    pub memory_usage_percent: Option<f64>,
    pub cpu_display: u8,
    pub memory_display: u8,
    pub fallback_reason: Option<String>,
    pub updated_at_unix: Option<i64>,
}

impl ApiNode {
    fn new(node_name: String, node: &NodeStatus) -> Self {
        let gauges: &DerivedGauges = &node.gauges;
        Self {
            node_name,
            online: node.online,
            source: node.source,
            cpu_usage_percent: gauges.cpu_usage_percent,
            memory_usage_percent: gauges.memory_usage_percent,
            cpu_display: gauges.display_cpu(),
            memory_display: gauges.display_memory(),
            fallback_reason: node.fallback_reason.clone(),
            updated_at_unix: node.updated_at_unix,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiModel {
    pub ready: bool,
    pub service_status: Option<u16>,
    pub error: Option<String>,
    pub checked_at_unix: Option<i64>,
}

impl From<&ModelStatus> for ApiModel {
    fn from(value: &ModelStatus) -> Self {
        Self {
            ready: value.ready,
            service_status: value.service_status,
            error: value.error.clone(),
            checked_at_unix: value.checked_at_unix,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiHistory {
    pub infer_count: u64,
    pub records: Vec<InferenceRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PredictRequest {
    image_url: Option<String>,
    image_id: Option<Value>,
}

pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/health", get(model_health))
        .route("/api/metrics", get(node_metrics))
        .route("/api/predict", post(predict))
        .route("/api/config", get(get_config))
        .route("/api/config/update", post(update_config))
        .route("/api/oapis/*path", get(oapis_get).post(oapis_post))
        .route("/api/node", get(node_handler))
        .route("/api/model", get(model_handler))
        .route("/api/history", get(history_handler))
        .with_state(ctx)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(ctx): State<AppContext>) -> Response {
    ctx.metrics.inc_scrape_count();
    {
        let guard = ctx.state.read().await;
        ctx.metrics.update_from_state(&guard);
    }
    match ctx.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn model_health(State(ctx): State<AppContext>) -> Response {
    ctx.metrics.inc_proxy_request("health");
    let result = ctx.upstream.check_model_health().await;
    let response = match &result {
        Ok(status) => (
            StatusCode::OK,
            Json(json!({
                "status": "online",
                "serviceStatus": status,
                "message": "Model service is reachable",
            })),
        )
            .into_response(),
        Err(err) => {
            ctx.metrics.inc_upstream_error("model_service");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "offline",
                    "message": "Model service is not reachable",
                    "error": err.to_string(),
                })),
            )
                .into_response()
        }
    };

    let mut guard = ctx.state.write().await;
    guard.record_health(result.map_err(|err| err.to_string()), tasks::now_unix());
    response
}

async fn node_metrics(State(ctx): State<AppContext>) -> Response {
    ctx.metrics.inc_proxy_request("metrics");
    match ctx.upstream.fetch_node_metrics().await {
        Ok(text) => {
            let mut response = Response::new(Body::from(text.body));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            response
        }
        Err(err) => {
            ctx.metrics.inc_upstream_error("node_exporter");
            error!(error = %err, "failed to fetch node metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to fetch metrics from node exporter" })),
            )
                .into_response()
        }
    }
}

async fn predict(
    State(ctx): State<AppContext>,
    payload: Result<Json<PredictRequest>, JsonRejection>,
) -> Response {
    ctx.metrics.inc_proxy_request("predict");
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return processing_failed(rejection.body_text()),
    };

    let Some(image_url) = request.image_url.filter(|u| !u.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "imageUrl is required" })),
        )
            .into_response();
    };
    let image_id = request.image_id.map(|id| match id {
        Value::String(s) => s,
        other => other.to_string(),
    });

    match ctx.upstream.predict(&image_url, image_id.as_deref()).await {
        Ok(prediction) => {
            let timestamp = humantime::format_rfc3339_seconds(SystemTime::now()).to_string();
            let id = {
                let mut guard = ctx.state.write().await;
                guard.record_prediction(
                    prediction.file_name.clone(),
                    &prediction.body,
                    prediction.elapsed_ms,
                    timestamp,
                )
            };
            info!(id, file = %prediction.file_name, "prediction completed");
            Json(prediction.body).into_response()
        }
        Err(UpstreamError::Rejected { status, body, .. }) => {
            ctx.metrics.inc_upstream_error("model_service");
            let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (
                code,
                Json(json!({
                    "error": "Prediction failed",
                    "status": status,
                    "message": body,
                })),
            )
                .into_response()
        }
        Err(err) => {
            ctx.metrics.inc_upstream_error("model_service");
            error!(error = %err, "failed to process prediction request");
            processing_failed(err.to_string())
        }
    }
}

fn processing_failed(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": "Failed to process prediction request",
            "message": message,
        })),
    )
        .into_response()
}

async fn get_config(State(ctx): State<AppContext>) -> Json<ApiConfig> {
    Json(ApiConfig::from(ctx.upstream.settings().current().await))
}

async fn update_config(
    State(ctx): State<AppContext>,
    payload: Result<Json<ConfigUpdate>, JsonRejection>,
) -> Response {
    let update = match payload {
        Ok(Json(update)) => update,
        Err(rejection) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Failed to update configuration",
                    "message": rejection.body_text(),
                })),
            )
                .into_response()
        }
    };

    match ctx.upstream.settings().update(update).await {
        Ok(saved) => {
            info!(
                model_service_url = %saved.model_service_url,
                node_exporter_url = %saved.node_exporter_url,
                node_name = %saved.node_name,
                "configuration updated"
            );
            // refresh right away instead of waiting for the next ticks
            let refresh = ctx.clone();
            tokio::spawn(async move {
                tasks::sample_node(&refresh).await;
                tasks::check_model(&refresh).await;
            });
            Json(json!({
                "success": true,
                "config": ApiConfig::from(saved),
            }))
            .into_response()
        }
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn oapis_get(
    State(ctx): State<AppContext>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    ctx.metrics.inc_proxy_request("oapis");
    match ctx.upstream.oapis_get(&path, query.as_deref()).await {
        Ok(resp) => passthrough(resp.status, resp.body),
        Err(err) => {
            ctx.metrics.inc_upstream_error("api");
            error!(error = %err, path = %path, "api proxy error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to fetch from API" })),
            )
                .into_response()
        }
    }
}

async fn oapis_post(
    State(ctx): State<AppContext>,
    Path(path): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    ctx.metrics.inc_proxy_request("oapis");
    let result = match payload {
        Ok(Json(body)) => ctx.upstream.oapis_post(&path, &body).await.map_err(|e| e.to_string()),
        Err(rejection) => Err(rejection.body_text()),
    };
    match result {
        Ok(resp) => passthrough(resp.status, resp.body),
        Err(err) => {
            ctx.metrics.inc_upstream_error("api");
            error!(error = %err, path = %path, "api proxy error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to post to API" })),
            )
                .into_response()
        }
    }
}

fn passthrough(status: u16, body: Value) -> Response {
    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (code, Json(body)).into_response()
}

async fn node_handler(State(ctx): State<AppContext>) -> Json<ApiNode> {
    let node_name = ctx.upstream.settings().current().await.node_name;
    let guard = ctx.state.read().await;
    Json(ApiNode::new(node_name, &guard.node))
}

async fn model_handler(State(ctx): State<AppContext>) -> Json<ApiModel> {
    let guard = ctx.state.read().await;
    Json(ApiModel::from(&guard.model))
}

async fn history_handler(State(ctx): State<AppContext>) -> Json<ApiHistory> {
    let guard = ctx.state.read().await;
    Json(ApiHistory {
        infer_count: guard.inference_count,
        records: guard.history.iter().cloned().collect(),
    })
}
