use crate::features::instance_lifecycle::controller::InstanceController;
use crate::features::observability::controller::ObservabilityController;
use crate::features::policy::controller::PolicyController;
use crate::shared::error::status_code_for;
use crate::shared::types::{
    CreateInstanceRequest, Health, HealthIntervalRequest, Instance, LifecycleEvent,
    ListOperationsQuery, Operation, PolicyDecision, PolicyRequest, RenameInstanceRequest,
};
use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use conduit_core::ErrorResponse;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

/// Everything a request handler can reach. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub instances: InstanceController,
    pub policy: Arc<PolicyController>,
    pub metrics: Arc<ObservabilityController>,
}

/// An `ErrorResponse` paired with its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl From<ErrorResponse> for ApiError {
    fn from(body: ErrorResponse) -> Self {
        let status = StatusCode::from_u16(status_code_for(&body.error_code))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self { status, body }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/instances", post(create_instance).get(list_instances))
        .route(
            "/instances/:id",
            get(get_instance)
                .patch(rename_instance)
                .delete(remove_instance),
        )
        .route("/instances/:id/install", post(install_instance))
        .route("/instances/:id/start", post(start_instance))
        .route("/instances/:id/stop", post(stop_instance))
        .route("/instances/:id/health", get(check_health))
        .route("/instances/:id/events", get(instance_events))
        .route("/operations", get(list_operations))
        .route("/operations/:id", get(get_operation))
        .route("/operations/:id/cancel", post(cancel_operation))
        .route("/policy/evaluate", post(evaluate_policy))
        .route("/settings/health-interval", put(set_health_interval))
        .route("/metrics", get(render_metrics))
        .route_layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn track_requests(
    State(state): State<AppState>,
    matched: Option<MatchedPath>,
    request: Request,
    next: Next,
) -> Response {
    let endpoint = format!(
        "{} {}",
        request.method(),
        matched.as_ref().map_or("unmatched", |m| m.as_str())
    );
    let started = Instant::now();
    let response = next.run(request).await;
    state.metrics.record_api_request(
        &endpoint,
        response.status().as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn create_instance(
    State(state): State<AppState>,
    Json(request): Json<CreateInstanceRequest>,
) -> ApiResult<(StatusCode, Json<Instance>)> {
    let instance = state.instances.create_instance(request).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn list_instances(State(state): State<AppState>) -> ApiResult<Json<Vec<Instance>>> {
    Ok(Json(state.instances.list_instances().await?))
}

async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Instance>> {
    Ok(Json(state.instances.get_instance(&id).await?))
}

async fn rename_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RenameInstanceRequest>,
) -> ApiResult<Json<Instance>> {
    Ok(Json(state.instances.rename_instance(&id, request).await?))
}

async fn remove_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.instances.remove_instance(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn install_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Operation>)> {
    let operation = state.instances.install_instance(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(operation)))
}

async fn start_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Operation>)> {
    let operation = state.instances.start_instance(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(operation)))
}

async fn stop_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Operation>)> {
    let operation = state.instances.stop_instance(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(operation)))
}

async fn check_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Health>> {
    Ok(Json(state.instances.check_health(&id).await?))
}

async fn instance_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<LifecycleEvent>>> {
    Ok(Json(state.instances.instance_events(&id).await?))
}

async fn list_operations(
    State(state): State<AppState>,
    Query(query): Query<ListOperationsQuery>,
) -> ApiResult<Json<Vec<Operation>>> {
    Ok(Json(state.instances.list_operations(query).await?))
}

async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Operation>> {
    Ok(Json(state.instances.get_operation(&id).await?))
}

async fn cancel_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Operation>)> {
    let operation = state.instances.cancel_operation(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(operation)))
}

async fn evaluate_policy(
    State(state): State<AppState>,
    Json(request): Json<PolicyRequest>,
) -> ApiResult<Json<PolicyDecision>> {
    Ok(Json(state.policy.evaluate(request)?))
}

async fn set_health_interval(
    State(state): State<AppState>,
    Json(request): Json<HealthIntervalRequest>,
) -> ApiResult<StatusCode> {
    state.instances.set_health_interval(request)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn render_metrics(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let body = state
        .metrics
        .render_metrics()
        .map_err(|e| ErrorResponse::new("INTERNAL_ERROR", e))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::instance_lifecycle::repo::InMemoryStore;
    use crate::features::instance_lifecycle::service::{LifecycleManager, ManagerOptions};
    use crate::features::policy::repo::PolicyRules;
    use crate::features::policy::service::PolicyEngine;
    use crate::features::provisioning::repo::InMemoryProvisioner;
    use axum::body::{to_bytes, Body};
    use axum::http::Method;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_app() -> (Router, LifecycleManager) {
        let metrics = ObservabilityController::build().unwrap();
        let engine = Arc::new(PolicyEngine::with_home(PolicyRules::default(), None).unwrap());
        let manager = LifecycleManager::new(
            Arc::new(InMemoryStore::new()),
            engine.clone(),
            Arc::new(InMemoryProvisioner::new()),
            metrics.clone(),
            ManagerOptions::default(),
        );
        let state = AppState {
            instances: InstanceController::new(manager.clone()),
            policy: Arc::new(PolicyController::new(engine)),
            metrics,
        };
        (router(state), manager)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn create_body() -> Value {
        json!({
            "package_id": "acme/files",
            "version": "1.0.0",
            "image_ref": "ghcr.io/acme/files:1.0.0",
            "permissions": {"filesystem": {"readonly_paths": ["/srv/docs"]}}
        })
    }

    #[tokio::test]
    async fn test_create_and_fetch_instance() {
        let (app, _) = test_app();

        let (status, created) = send(&app, Method::POST, "/instances", Some(create_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "created");
        let id = created["instance_id"].as_str().unwrap().to_string();

        let (status, fetched) = send(&app, Method::GET, &format!("/instances/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["display_name"], "acme/files");

        let (status, listed) = send(&app, Method::GET, "/instances", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_install_returns_pending_operation() {
        let (app, manager) = test_app();
        let (_, created) = send(&app, Method::POST, "/instances", Some(create_body())).await;
        let id = created["instance_id"].as_str().unwrap();

        let (status, operation) =
            send(&app, Method::POST, &format!("/instances/{id}/install"), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(operation["operation_type"], "install");
        let op_id = operation["operation_id"].as_str().unwrap();

        manager.wait_for_operations().await;
        let (status, operation) = send(&app, Method::GET, &format!("/operations/{op_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(operation["status"], "succeeded");
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (app, _) = test_app();

        let (status, body) = send(&app, Method::GET, "/instances/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_code"], "INSTANCE_NOT_FOUND");

        let (status, body) = send(
            &app,
            Method::POST,
            "/instances",
            Some(json!({"package_id": "", "version": "1.0.0", "image_ref": "img"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "VALIDATION_ERROR");

        let (_, created) = send(&app, Method::POST, "/instances", Some(create_body())).await;
        let id = created["instance_id"].as_str().unwrap();
        let (status, body) = send(&app, Method::POST, &format!("/instances/{id}/start"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error_code"], "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_remove_then_not_found() {
        let (app, _) = test_app();
        let (_, created) = send(&app, Method::POST, "/instances", Some(create_body())).await;
        let uri = format!("/instances/{}", created["instance_id"].as_str().unwrap());

        let (status, _) = send(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_policy_dry_run() {
        let (app, _) = test_app();

        let (status, decision) = send(
            &app,
            Method::POST,
            "/policy/evaluate",
            Some(json!({
                "scope": "install",
                "instance_id": "dry-run",
                "package_id": "acme/files",
                "requested": {"filesystem": {"read_write_paths": ["/etc/ssh"]}}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decision["decision"], "deny");
        assert!(decision["block_reasons"][0].as_str().unwrap().contains("/etc"));
    }

    #[tokio::test]
    async fn test_health_interval_and_metrics() {
        let (app, manager) = test_app();

        let (status, _) = send(
            &app,
            Method::PUT,
            "/settings/health-interval",
            Some(json!({"interval_secs": 7})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(manager.health_interval().as_secs(), 7);

        let (status, _) = send(
            &app,
            Method::PUT,
            "/settings/health-interval",
            Some(json!({"interval_secs": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let request = axum::http::Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("conduit_api_request_total"));
    }
}
