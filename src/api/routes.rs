//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::ApiError;
use super::state::AppState;
use crate::model::{Component, Monitoring, Task, TaskRef};

type ApiResult<T> = Result<T, ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/controllers", get(list_controllers))
        .route("/components", get(list_components).post(create_component))
        .route(
            "/components/{id}",
            get(get_component).put(update_component).delete(delete_component),
        )
        .route("/components/{id}/enable", post(enable_component))
        .route("/components/{id}/disable", post(disable_component))
        .route("/monitorings", get(list_monitorings).post(create_monitoring))
        .route(
            "/monitorings/{id}",
            get(get_monitoring).put(update_monitoring).delete(delete_monitoring),
        )
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/{id}", get(get_task).put(update_task).delete(delete_task))
        .route("/tasks/{id}/run", post(run_task))
        .route("/tasks/{id}/rollback", post(rollback_task))
        .route("/plans", get(list_plans).post(create_plan))
        .route("/plans/{id}", get(get_plan).delete(delete_plan))
        .route("/plans/{id}/status", get(plan_status))
        .route("/plans/{id}/run", post(run_plan))
        .route("/runs", get(list_runs))
        .route("/runs/{id}", get(get_run))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn one<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "data": data, "meta": meta() }))
}

fn many<T: Serialize>(data: Vec<T>) -> Json<Value> {
    let total = data.len();
    Json(json!({
        "data": data,
        "meta": { "total": total, "timestamp": chrono::Utc::now().to_rfc3339() }
    }))
}

fn created<T: Serialize>(data: T) -> (StatusCode, Json<Value>) {
    (StatusCode::CREATED, one(data))
}

fn accepted(run_id: String) -> (StatusCode, Json<Value>) {
    (StatusCode::ACCEPTED, one(json!({ "run_id": run_id })))
}

fn deleted(id: String) -> Json<Value> {
    one(json!({ "id": id, "deleted": true }))
}

async fn health() -> Json<Value> {
    one(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// `?type=` filter shared by listing endpoints.
#[derive(Debug, Deserialize)]
struct TypeFilter {
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl TypeFilter {
    fn wanted(&self) -> Option<&str> {
        self.kind.as_deref().filter(|k| !k.is_empty())
    }
}

async fn list_controllers(
    State(state): State<AppState>,
    Query(filter): Query<TypeFilter>,
) -> Json<Value> {
    let mut types = state.core.controller_types();
    if let Some(kind) = filter.wanted() {
        types.resources.retain(|t| t == kind);
        types.monitors.retain(|t| t == kind);
    }
    one(types)
}

// -- components ---------------------------------------------------------------

async fn list_components(
    State(state): State<AppState>,
    Query(filter): Query<TypeFilter>,
) -> ApiResult<Json<Value>> {
    let components = state.core.list_components().await?;
    Ok(many(
        components
            .iter()
            .filter(|c| filter.wanted().map_or(true, |kind| c.kind == kind))
            .map(Component::redacted)
            .collect::<Vec<_>>(),
    ))
}

async fn create_component(
    State(state): State<AppState>,
    Json(component): Json<Component>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    Ok(created(state.core.register_component(component).await?.redacted()))
}

async fn get_component(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    Ok(one(state.core.get_component(&id).await?.redacted()))
}

async fn update_component(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(component): Json<Component>,
) -> ApiResult<Json<Value>> {
    Ok(one(state.core.update_component(&id, component).await?.redacted()))
}

async fn delete_component(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    state.core.delete_component(&id).await?;
    Ok(deleted(id))
}

async fn enable_component(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    Ok(one(state.core.set_component_enabled(&id, true).await?.redacted()))
}

async fn disable_component(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    Ok(one(state.core.set_component_enabled(&id, false).await?.redacted()))
}

// -- monitorings --------------------------------------------------------------

async fn list_monitorings(
    State(state): State<AppState>,
    Query(filter): Query<TypeFilter>,
) -> ApiResult<Json<Value>> {
    let monitorings = state.core.list_monitorings().await?;
    Ok(many(
        monitorings
            .iter()
            .filter(|m| filter.wanted().map_or(true, |kind| m.kind == kind))
            .map(Monitoring::redacted)
            .collect::<Vec<_>>(),
    ))
}

async fn create_monitoring(
    State(state): State<AppState>,
    Json(monitoring): Json<Monitoring>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    Ok(created(state.core.register_monitoring(monitoring).await?.redacted()))
}

async fn get_monitoring(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    Ok(one(state.core.get_monitoring(&id).await?.redacted()))
}

async fn update_monitoring(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(monitoring): Json<Monitoring>,
) -> ApiResult<Json<Value>> {
    Ok(one(state.core.update_monitoring(&id, monitoring).await?.redacted()))
}

async fn delete_monitoring(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    state.core.delete_monitoring(&id).await?;
    Ok(deleted(id))
}

// -- tasks --------------------------------------------------------------------

async fn list_tasks(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let tasks = state.core.list_tasks().await?;
    Ok(many(tasks.iter().map(Task::redacted).collect::<Vec<_>>()))
}

async fn create_task(
    State(state): State<AppState>,
    Json(task): Json<Task>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    Ok(created(state.core.register_task(task).await?.redacted()))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    Ok(one(state.core.get_task(&id).await?.redacted()))
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(task): Json<Task>,
) -> ApiResult<Json<Value>> {
    Ok(one(state.core.update_task(&id, task).await?.redacted()))
}

async fn delete_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    state.core.delete_task(&id).await?;
    Ok(deleted(id))
}

async fn run_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    Ok(accepted(state.core.run_task_async(&id).await?))
}

async fn rollback_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    Ok(accepted(state.core.rollback_task_async(&id).await?))
}

// -- plans --------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NewPlan {
    tasks: Vec<TaskRef>,
}

async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(many(state.core.list_plans().await?))
}

async fn create_plan(
    State(state): State<AppState>,
    Json(plan): Json<NewPlan>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    Ok(created(state.core.register_plan(plan.tasks).await?))
}

async fn get_plan(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    Ok(one(state.core.get_plan(&id).await?))
}

async fn delete_plan(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    state.core.delete_plan(&id).await?;
    Ok(deleted(id))
}

async fn plan_status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let plan = state.core.get_plan(&id).await?;
    Ok(one(plan.status_history))
}

async fn run_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    Ok(accepted(state.core.run_plan_async(&id).await?))
}

// -- runs ---------------------------------------------------------------------

async fn list_runs(State(state): State<AppState>) -> Json<Value> {
    many(state.core.list_runs().await)
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    Ok(one(state.core.get_run(&id).await?))
}
