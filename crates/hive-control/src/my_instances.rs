use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::Request,
    response::Response,
    routing::{any, get},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{InstanceHealth, health_of};
use crate::auth::AuthUser;
use crate::error::{HiveError, HiveResult};
use crate::registry::Instance;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/my-instances", get(list_mine))
        .route("/my-instances/current", get(current).put(switch_current))
        .route("/my-instances/current/health", get(current_health))
        .route("/proxy", any(proxy_root))
        .route("/proxy/", any(proxy_root))
        .route("/proxy/*path", any(proxy))
}

#[derive(Debug, Serialize)]
pub struct MyInstance {
    #[serde(flatten)]
    pub instance: Instance,
    pub is_current: bool,
}

#[derive(Debug, Serialize)]
pub struct CurrentInstance {
    pub instance: Option<Instance>,
}

async fn list_mine(
    State(state): State<AppState>,
    user: AuthUser,
) -> HiveResult<Json<Vec<MyInstance>>> {
    let record = state.assignments.get_user(user.user_id).await?;
    let ids = state.assignments.instance_ids_for(user.user_id).await?;
    let instances = state.registry.list_by_ids(ids).await?;
    Ok(Json(
        instances
            .into_iter()
            .map(|instance| MyInstance {
                is_current: record.current_instance_id == Some(instance.id),
                instance,
            })
            .collect(),
    ))
}

async fn current(
    State(state): State<AppState>,
    user: AuthUser,
) -> HiveResult<Json<CurrentInstance>> {
    let record = state.assignments.get_user(user.user_id).await?;
    let instance = match record.current_instance_id {
        Some(id) => state.registry.find(id).await?,
        None => None,
    };
    Ok(Json(CurrentInstance { instance }))
}

#[derive(Debug, Deserialize)]
struct SwitchRequest {
    instance_id: Uuid,
}

async fn switch_current(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<SwitchRequest>,
) -> HiveResult<Json<Instance>> {
    let instance = state.registry.get(req.instance_id).await?;
    state
        .assignments
        .switch_current(user.user_id, req.instance_id)
        .await?;
    tracing::info!(
        user_id = %user.user_id,
        instance_id = %req.instance_id,
        "current instance switched"
    );
    Ok(Json(instance))
}

async fn current_health(
    State(state): State<AppState>,
    user: AuthUser,
) -> HiveResult<Json<InstanceHealth>> {
    let record = state.assignments.get_user(user.user_id).await?;
    let id = record
        .current_instance_id
        .ok_or(HiveError::NoInstanceSelected)?;
    let instance = state.registry.get(id).await?;
    if !state.assignments.is_assigned(user.user_id, id).await? {
        return Err(HiveError::InstanceNotAssigned { instance_id: id });
    }
    Ok(Json(health_of(&state, instance)))
}

async fn proxy_root(
    State(state): State<AppState>,
    user: AuthUser,
    req: Request<Body>,
) -> HiveResult<Response> {
    state.proxy.route(user.user_id, "", req).await
}

async fn proxy(
    State(state): State<AppState>,
    user: AuthUser,
    Path(path): Path<String>,
    req: Request<Body>,
) -> HiveResult<Response> {
    state.proxy.route(user.user_id, &path, req).await
}
