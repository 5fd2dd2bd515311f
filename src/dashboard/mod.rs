use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

use crate::models::{FeatureRequest, Record};
use crate::pipeline::FeaturePipeline;
use crate::registry::LatencyClass;
use crate::stream::SportEvent;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: FeaturePipeline,
}

/// Build the Axum router for the feature API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/metrics", get(metrics_handler))
        .route("/api/features", get(features_handler))
        .route("/api/compute", post(compute_handler))
        .route("/api/batch", post(batch_handler))
        .route("/api/events", post(events_handler))
        .route("/api/cache", delete(clear_cache_handler))
        .route("/api/cache/:feature", delete(invalidate_feature_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

type ApiError = (StatusCode, String);

/// Wire form of a single compute request.
#[derive(Debug, Deserialize)]
pub struct ComputeBody {
    pub feature_name: String,
    pub rows: Vec<Record>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl ComputeBody {
    fn into_request(self) -> Result<FeatureRequest, ApiError> {
        let mut request = FeatureRequest::new(self.feature_name, self.rows);
        if let Some(id) = self.request_id {
            request = request.with_request_id(id);
        }
        match self.timeout_ms {
            Some(0) => Err((
                StatusCode::BAD_REQUEST,
                "timeout_ms must be positive".to_string(),
            )),
            Some(ms) => Ok(request.with_timeout(Duration::from_millis(ms))),
            None => Ok(request),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchBody {
    pub requests: Vec<ComputeBody>,
}

#[derive(Debug, Serialize)]
struct FeatureInfo {
    name: String,
    min: f64,
    max: f64,
    nullable: bool,
    latency_class: LatencyClass,
    required_columns: Vec<String>,
    tags: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Invalidated {
    feature: Option<String>,
    removed: u64,
}

/// GET /api/health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.pipeline.health().await)
}

/// GET /api/metrics
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.pipeline.metrics_snapshot())
}

/// GET /api/features
async fn features_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let features: Vec<FeatureInfo> = state
        .pipeline
        .registry()
        .definitions()
        .iter()
        .map(|d| FeatureInfo {
            name: d.name.clone(),
            min: d.valid_range.0,
            max: d.valid_range.1,
            nullable: d.nullable,
            latency_class: d.latency_class,
            required_columns: d.required_columns.iter().cloned().collect(),
            tags: d.tags.clone(),
        })
        .collect();
    Json(features)
}

/// POST /api/compute
async fn compute_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ComputeBody>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body.into_request()?;
    Ok(Json(state.pipeline.dispatch(request).await))
}

/// POST /api/batch
async fn batch_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BatchBody>,
) -> Result<impl IntoResponse, ApiError> {
    let requests = body
        .requests
        .into_iter()
        .map(ComputeBody::into_request)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(state.pipeline.dispatch_batch(requests).await))
}

/// POST /api/events
async fn events_handler(
    State(state): State<Arc<AppState>>,
    Json(event): Json<SportEvent>,
) -> Result<impl IntoResponse, ApiError> {
    if event.event_id.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "event_id is required".to_string()));
    }
    Ok(Json(state.pipeline.compute_for_event(event).await))
}

/// DELETE /api/cache
async fn clear_cache_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let removed = state.pipeline.cache().invalidate_all().await;
    Json(Invalidated {
        feature: None,
        removed,
    })
}

/// DELETE /api/cache/:feature
async fn invalidate_feature_handler(
    State(state): State<Arc<AppState>>,
    Path(feature): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.pipeline.registry().contains(&feature) {
        return Err((
            StatusCode::NOT_FOUND,
            format!("feature '{}' is not registered", feature),
        ));
    }
    let removed = state.pipeline.cache().invalidate_feature(&feature).await;
    Ok(Json(Invalidated {
        feature: Some(feature),
        removed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FeatureCache;
    use crate::pipeline::{ClassPolicy, PipelinePolicy};
    use crate::registry::FeatureRegistry;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value as JsonValue};
    use tower::ServiceExt;

    fn app() -> Router {
        let relaxed = ClassPolicy {
            cache_ttl: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
        };
        let pipeline = FeaturePipeline::new(
            FeatureRegistry::builtin().unwrap(),
            FeatureCache::in_memory(),
            PipelinePolicy {
                real_time: relaxed,
                near_real_time: relaxed,
                batch: relaxed,
                ..PipelinePolicy::default()
            },
        );
        router(AppState { pipeline })
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<JsonValue>) -> (StatusCode, JsonValue) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_compute_roundtrip_and_cache_hit() {
        let app = app();
        let body = json!({
            "feature_name": "woba",
            "request_id": "r-1",
            "rows": [{"ab": 4, "single": 1, "hr": 1}, {"ab": 0}]
        });

        let (status, first) = call(&app, "POST", "/api/compute", Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["request_id"], "r-1");
        assert_eq!(first["cache_hit"], false);
        assert_eq!(first["output_values"].as_array().unwrap().len(), 2);
        assert!(first["output_values"][1].is_null());
        assert!(first["error"].is_null());

        let (_, second) = call(&app, "POST", "/api/compute", Some(body)).await;
        assert_eq!(second["cache_hit"], true);
        assert_eq!(second["output_values"], first["output_values"]);
    }

    #[tokio::test]
    async fn test_feature_errors_are_200_with_error_body() {
        let app = app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/compute",
            Some(json!({"feature_name": "nope", "rows": [{"a": 1}]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error"]["kind"], "not_found");

        let (status, _) = call(
            &app,
            "POST",
            "/api/compute",
            Some(json!({"feature_name": "woba", "rows": [], "timeout_ms": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let app = app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/batch",
            Some(json!({"requests": [
                {"feature_name": "fip", "request_id": "a", "rows": [{"ip": 6, "k": 9}]},
                {"feature_name": "missing", "request_id": "b", "rows": [{"x": 1}]},
                {"feature_name": "epa", "request_id": "c", "rows": [{"down": 1, "yard_line": 20}]}
            ]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["request_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(body[1]["error"]["kind"], "not_found");
        assert!(body[2]["error"].is_null());
    }

    #[tokio::test]
    async fn test_events_health_and_features() {
        let app = app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/events",
            Some(json!({
                "event_id": "g1",
                "sport": "basketball",
                "rows": [{"lineup_id": "L1", "player_id": "ja", "game_no": 1, "ts": "2025-01-01"}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["responses"].as_array().unwrap().len(), 3);
        assert_eq!(body["responses"][0]["request_id"], "g1:lineup_net_rating_5g");

        let (status, health) = call(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["cache_backend"], "memory");

        let (_, features) = call(&app, "GET", "/api/features", None).await;
        let woba = features
            .as_array()
            .unwrap()
            .iter()
            .find(|f| f["name"] == "woba")
            .unwrap();
        assert_eq!(woba["latency_class"], "real_time");

        let (_, metrics) = call(&app, "GET", "/api/metrics", None).await;
        assert_eq!(metrics["requests_total"], 3);
    }

    #[tokio::test]
    async fn test_cache_invalidation_routes() {
        let app = app();
        let body = json!({"feature_name": "fip", "rows": [{"ip": 6, "k": 9}]});
        call(&app, "POST", "/api/compute", Some(body.clone())).await;

        let (status, out) = call(&app, "DELETE", "/api/cache/fip", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(out["removed"], 1);

        let (status, _) = call(&app, "DELETE", "/api/cache/unknown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        call(&app, "POST", "/api/compute", Some(body)).await;
        let (_, out) = call(&app, "DELETE", "/api/cache", None).await;
        assert_eq!(out["removed"], 1);
    }
}
