//! REST API Handlers
//!
//! Implements the `/v1` endpoints for load balancers, listeners, pools,
//! members, health monitors, templates and instance observation.

use crate::controlplane::fields::{
    present, HealthMonitorFields, ListenerFields, LoadBalancerFields, MemberFields, PoolFields,
};
use crate::controlplane::service::{InstanceRegistration, LbaasService};
use crate::controlplane::template::{template_schema, TemplateApplier, TemplateDocument};
use crate::controlplane::views::{self, InstanceView};
use crate::error::{Error, Result};
use crate::model::{HealthMonitor, Listener, LoadBalancer, Member, Pool, PublicId};
use axum::{
    extract::{rejection::JsonRejection, Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Status tag write
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagValueRequest {
    pub value: String,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

type Payload<T> = std::result::Result<Json<T>, JsonRejection>;

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    service: Arc<LbaasService>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(service: Arc<LbaasService>) -> Self {
        Self { service }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            templates: Arc::new(TemplateApplier::new(self.service.clone())),
            service: self.service,
        };

        Router::new()
            // Load balancer endpoints
            .route("/v1/loadbalancers", get(list_loadbalancers).post(create_loadbalancer))
            .route(
                "/v1/loadbalancers/:id",
                get(get_loadbalancer)
                    .put(update_loadbalancer)
                    .delete(delete_loadbalancer),
            )
            .route("/v1/loadbalancers/:id/statuses", get(loadbalancer_statuses))
            .route("/v1/loadbalancers/:id/check", get(check_loadbalancer))
            // Listener endpoints
            .route("/v1/listeners", get(list_listeners).post(create_listener))
            .route(
                "/v1/listeners/:id",
                get(get_listener).put(update_listener).delete(delete_listener),
            )
            // Pool and member endpoints
            .route("/v1/pools", get(list_pools).post(create_pool))
            .route("/v1/pools/:id", get(get_pool).put(update_pool).delete(delete_pool))
            .route("/v1/pools/:id/members", get(list_members).post(create_member))
            .route(
                "/v1/pools/:id/members/:member_id",
                get(get_member).put(update_member).delete(delete_member),
            )
            // Health monitor endpoints
            .route(
                "/v1/healthmonitors",
                get(list_health_monitors).post(create_health_monitor),
            )
            .route(
                "/v1/healthmonitors/:id",
                get(get_health_monitor)
                    .put(update_health_monitor)
                    .delete(delete_health_monitor),
            )
            // Declarative templates
            .route("/v1/templates", post(apply_template))
            .route("/v1/templates/schema", get(get_template_schema))
            // Instance observation
            .route("/v1/instances", get(list_instances))
            .route("/v1/instances/:id", put(register_instance))
            .route("/v1/instances/:id/tags/:name", put(put_instance_tag))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    service: Arc<LbaasService>,
    templates: Arc<TemplateApplier>,
}

impl AppState {
    async fn loadbalancer_json(&self, lb: &LoadBalancer) -> Result<Value> {
        let view = views::loadbalancer_view(self.service.repos(), lb).await?;
        Ok(json!({ "loadbalancer": view }))
    }

    async fn listener_json(&self, listener: &Listener) -> Result<Value> {
        let view = views::listener_view(self.service.repos(), listener).await?;
        Ok(json!({ "listener": view }))
    }

    async fn pool_json(&self, pool: &Pool) -> Result<Value> {
        let view = views::pool_view(self.service.repos(), pool).await?;
        Ok(json!({ "pool": view }))
    }

    async fn member_json(&self, member: &Member) -> Result<Value> {
        let view = views::member_view(self.service.repos(), member).await?;
        Ok(json!({ "member": view }))
    }

    async fn health_monitor_json(&self, monitor: &HealthMonitor) -> Result<Value> {
        let view = views::health_monitor_view(self.service.repos(), monitor).await?;
        Ok(json!({ "health_monitor": view }))
    }
}

// =============================================================================
// Response Helpers
// =============================================================================

fn error_body(status: StatusCode, code: &str, message: String) -> Response {
    (
        status,
        Json(ApiErrorResponse {
            error: code.into(),
            message,
            details: None,
        }),
    )
        .into_response()
}

/// Map a control-plane error onto an HTTP response
fn error_response(err: Error) -> Response {
    let (status, code) = match &err {
        e if e.is_validation() => (StatusCode::BAD_REQUEST, "validation_failed"),
        Error::ResourceNotFound { .. }
        | Error::UnresolvedReference { .. }
        | Error::InstanceNotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        Error::ResourceInUse { .. } => (StatusCode::CONFLICT, "resource_in_use"),
        Error::ResourceExists { .. } => (StatusCode::CONFLICT, "already_exists"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Request failed: {}", err);
    } else {
        debug!("Request rejected ({}): {}", status, err);
    }
    error_body(status, code, err.to_string())
}

fn respond(status: StatusCode, result: Result<Value>) -> Response {
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(e) => error_response(e),
    }
}

fn respond_empty(result: Result<()>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

/// Unwrap a JSON body, turning malformed or unknown-field payloads into 400
fn accept<T>(payload: Payload<T>) -> std::result::Result<T, Response> {
    payload.map(|Json(body)| body).map_err(|rejection| {
        debug!("Rejected payload: {}", rejection.body_text());
        error_body(StatusCode::BAD_REQUEST, "invalid_payload", rejection.body_text())
    })
}

// =============================================================================
// Load Balancer Handlers
// =============================================================================

async fn list_loadbalancers(State(state): State<AppState>) -> Response {
    let result = async {
        let records = state.service.list_loadbalancers().await?;
        let repos = state.service.repos();
        let items = try_join_all(records.iter().map(|lb| views::loadbalancer_view(repos, lb))).await?;
        Ok::<_, Error>(json!({ "loadbalancers": items }))
    }
    .await;
    respond(StatusCode::OK, result)
}

async fn create_loadbalancer(
    State(state): State<AppState>,
    payload: Payload<LoadBalancerFields>,
) -> Response {
    let fields = match accept(payload) {
        Ok(fields) => fields,
        Err(rejection) => return rejection,
    };
    info!("Creating load balancer {:?}", fields.name);

    let result = async {
        let lb = state.service.create_loadbalancer(fields).await?;
        state.loadbalancer_json(&lb).await
    }
    .await;
    respond(StatusCode::CREATED, result)
}

async fn get_loadbalancer(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let result = async {
        let lb = state.service.get_loadbalancer(&PublicId::from(id)).await?;
        state.loadbalancer_json(&lb).await
    }
    .await;
    respond(StatusCode::OK, result)
}

async fn update_loadbalancer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<LoadBalancerFields>,
) -> Response {
    let fields = match accept(payload) {
        Ok(fields) => fields,
        Err(rejection) => return rejection,
    };

    let result = async {
        let lb = state
            .service
            .update_loadbalancer(&PublicId::from(id), fields)
            .await?;
        state.loadbalancer_json(&lb).await
    }
    .await;
    respond(StatusCode::ACCEPTED, result)
}

async fn delete_loadbalancer(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    info!("Deleting load balancer {}", id);
    respond_empty(state.service.delete_loadbalancer(&PublicId::from(id)).await)
}

async fn loadbalancer_statuses(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let result = state
        .service
        .statuses(&PublicId::from(id))
        .await
        .map(|tree| json!({ "statuses": tree }));
    respond(StatusCode::OK, result)
}

async fn check_loadbalancer(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let result = state
        .service
        .check(&PublicId::from(id))
        .await
        .map(|report| json!(report));
    respond(StatusCode::OK, result)
}

// =============================================================================
// Listener Handlers
// =============================================================================

async fn list_listeners(State(state): State<AppState>) -> Response {
    let result = async {
        let records = state.service.list_listeners().await?;
        let repos = state.service.repos();
        let items = try_join_all(records.iter().map(|listener| views::listener_view(repos, listener))).await?;
        Ok::<_, Error>(json!({ "listeners": items }))
    }
    .await;
    respond(StatusCode::OK, result)
}

async fn create_listener(State(state): State<AppState>, payload: Payload<ListenerFields>) -> Response {
    let fields = match accept(payload) {
        Ok(fields) => fields,
        Err(rejection) => return rejection,
    };

    let result = async {
        let listener = state.service.create_listener(fields).await?;
        state.listener_json(&listener).await
    }
    .await;
    respond(StatusCode::CREATED, result)
}

async fn get_listener(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let result = async {
        let listener = state.service.get_listener(&PublicId::from(id)).await?;
        state.listener_json(&listener).await
    }
    .await;
    respond(StatusCode::OK, result)
}

async fn update_listener(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<ListenerFields>,
) -> Response {
    let fields = match accept(payload) {
        Ok(fields) => fields,
        Err(rejection) => return rejection,
    };

    let result = async {
        let listener = state.service.update_listener(&PublicId::from(id), fields).await?;
        state.listener_json(&listener).await
    }
    .await;
    respond(StatusCode::ACCEPTED, result)
}

async fn delete_listener(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond_empty(state.service.delete_listener(&PublicId::from(id)).await)
}

// =============================================================================
// Pool Handlers
// =============================================================================

async fn list_pools(State(state): State<AppState>) -> Response {
    let result = async {
        let records = state.service.list_pools().await?;
        let repos = state.service.repos();
        let items = try_join_all(records.iter().map(|pool| views::pool_view(repos, pool))).await?;
        Ok::<_, Error>(json!({ "pools": items }))
    }
    .await;
    respond(StatusCode::OK, result)
}

async fn create_pool(State(state): State<AppState>, payload: Payload<PoolFields>) -> Response {
    let fields = match accept(payload) {
        Ok(fields) => fields,
        Err(rejection) => return rejection,
    };

    let result = async {
        let pool = state.service.create_pool(fields).await?;
        state.pool_json(&pool).await
    }
    .await;
    respond(StatusCode::CREATED, result)
}

async fn get_pool(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let result = async {
        let pool = state.service.get_pool(&PublicId::from(id)).await?;
        state.pool_json(&pool).await
    }
    .await;
    respond(StatusCode::OK, result)
}

async fn update_pool(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<PoolFields>,
) -> Response {
    let fields = match accept(payload) {
        Ok(fields) => fields,
        Err(rejection) => return rejection,
    };

    let result = async {
        let pool = state.service.update_pool(&PublicId::from(id), fields).await?;
        state.pool_json(&pool).await
    }
    .await;
    respond(StatusCode::ACCEPTED, result)
}

async fn delete_pool(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond_empty(state.service.delete_pool(&PublicId::from(id)).await)
}

// =============================================================================
// Member Handlers
// =============================================================================

async fn list_members(State(state): State<AppState>, Path(pool_id): Path<String>) -> Response {
    let result = async {
        let records = state.service.list_members(&PublicId::from(pool_id)).await?;
        let repos = state.service.repos();
        let items = try_join_all(records.iter().map(|member| views::member_view(repos, member))).await?;
        Ok::<_, Error>(json!({ "members": items }))
    }
    .await;
    respond(StatusCode::OK, result)
}

async fn create_member(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
    payload: Payload<MemberFields>,
) -> Response {
    let mut fields = match accept(payload) {
        Ok(fields) => fields,
        Err(rejection) => return rejection,
    };
    if let Some(body_pool) = present(&fields.pool) {
        if body_pool != pool_id {
            return error_response(Error::Validation(format!(
                "member pool '{}' does not match path pool '{}'",
                body_pool, pool_id
            )));
        }
    }
    fields.pool = Some(pool_id);

    let result = async {
        let member = state.service.create_member(fields).await?;
        state.member_json(&member).await
    }
    .await;
    respond(StatusCode::CREATED, result)
}

async fn get_member(
    State(state): State<AppState>,
    Path((pool_id, member_id)): Path<(String, String)>,
) -> Response {
    let result = async {
        let member = state
            .service
            .get_member(&PublicId::from(pool_id), &PublicId::from(member_id))
            .await?;
        state.member_json(&member).await
    }
    .await;
    respond(StatusCode::OK, result)
}

async fn update_member(
    State(state): State<AppState>,
    Path((pool_id, member_id)): Path<(String, String)>,
    payload: Payload<MemberFields>,
) -> Response {
    let fields = match accept(payload) {
        Ok(fields) => fields,
        Err(rejection) => return rejection,
    };

    let result = async {
        let member = state
            .service
            .update_member(&PublicId::from(pool_id), &PublicId::from(member_id), fields)
            .await?;
        state.member_json(&member).await
    }
    .await;
    respond(StatusCode::ACCEPTED, result)
}

async fn delete_member(
    State(state): State<AppState>,
    Path((pool_id, member_id)): Path<(String, String)>,
) -> Response {
    respond_empty(
        state
            .service
            .delete_member(&PublicId::from(pool_id), &PublicId::from(member_id))
            .await,
    )
}

// =============================================================================
// Health Monitor Handlers
// =============================================================================

async fn list_health_monitors(State(state): State<AppState>) -> Response {
    let result = async {
        let records = state.service.list_health_monitors().await?;
        let repos = state.service.repos();
        let items = try_join_all(records.iter().map(|monitor| views::health_monitor_view(repos, monitor))).await?;
        Ok::<_, Error>(json!({ "health_monitors": items }))
    }
    .await;
    respond(StatusCode::OK, result)
}

async fn create_health_monitor(
    State(state): State<AppState>,
    payload: Payload<HealthMonitorFields>,
) -> Response {
    let fields = match accept(payload) {
        Ok(fields) => fields,
        Err(rejection) => return rejection,
    };

    let result = async {
        let monitor = state.service.create_health_monitor(fields).await?;
        state.health_monitor_json(&monitor).await
    }
    .await;
    respond(StatusCode::CREATED, result)
}

async fn get_health_monitor(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let result = async {
        let monitor = state.service.get_health_monitor(&PublicId::from(id)).await?;
        state.health_monitor_json(&monitor).await
    }
    .await;
    respond(StatusCode::OK, result)
}

async fn update_health_monitor(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<HealthMonitorFields>,
) -> Response {
    let fields = match accept(payload) {
        Ok(fields) => fields,
        Err(rejection) => return rejection,
    };

    let result = async {
        let monitor = state
            .service
            .update_health_monitor(&PublicId::from(id), fields)
            .await?;
        state.health_monitor_json(&monitor).await
    }
    .await;
    respond(StatusCode::ACCEPTED, result)
}

async fn delete_health_monitor(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond_empty(state.service.delete_health_monitor(&PublicId::from(id)).await)
}

// =============================================================================
// Template Handlers
// =============================================================================

/// Apply a YAML or JSON template document
async fn apply_template(State(state): State<AppState>, body: String) -> Response {
    let result = async {
        let document = TemplateDocument::parse(&body)?;
        let report = state.templates.apply(document).await?;
        Ok::<_, Error>(json!(report))
    }
    .await;
    respond(StatusCode::OK, result)
}

async fn get_template_schema() -> Response {
    (StatusCode::OK, Json(template_schema())).into_response()
}

// =============================================================================
// Instance Handlers
// =============================================================================

async fn list_instances(State(state): State<AppState>) -> Response {
    let result = state.service.list_instances().await.map(|instances| {
        let items: Vec<InstanceView> = instances.iter().map(InstanceView::from).collect();
        json!({ "instances": items })
    });
    respond(StatusCode::OK, result)
}

async fn register_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<InstanceRegistration>,
) -> Response {
    let registration = match accept(payload) {
        Ok(registration) => registration,
        Err(rejection) => return rejection,
    };

    let result = state
        .service
        .register_instance(&id, registration)
        .await
        .map(|instance| json!({ "instance": InstanceView::from(&instance) }));
    respond(StatusCode::OK, result)
}

async fn put_instance_tag(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    payload: Payload<TagValueRequest>,
) -> Response {
    let tag = match accept(payload) {
        Ok(tag) => tag,
        Err(rejection) => return rejection,
    };
    respond_empty(state.service.put_instance_tag(&id, &name, tag.value).await)
}

// =============================================================================
// Health Handlers
// =============================================================================

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.infra().health_check().await {
        Ok(true) => (StatusCode::OK, "ready"),
        Ok(false) => (StatusCode::SERVICE_UNAVAILABLE, "infrastructure unavailable"),
        Err(e) => {
            error!("Readiness check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "infrastructure error")
        }
    }
}
