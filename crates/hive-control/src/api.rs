use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use chrono::{DateTime, Utc};
use hive_core::{AgentType, HealthStatus, InstanceStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::agents::{AgentConfigInput, AgentConfigView, ConnectionTestResult, UsageReport, UsageStat};
use crate::assignments::AssignedUser;
use crate::audit;
use crate::auth::{AdminUser, AuthUser};
use crate::error::{HiveError, HiveResult};
use crate::logs::LogTail;
use crate::registry::{Instance, InstancePatch, NewInstance};
use crate::state::AppState;

const DEFAULT_LOG_LIMIT: usize = 200;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/instances", post(create_instance).get(list_instances))
        .route(
            "/instances/:id",
            get(get_instance).put(update_instance).delete(delete_instance),
        )
        .route("/instances/:id/start", post(start_instance))
        .route("/instances/:id/stop", post(stop_instance))
        .route("/instances/:id/restart", post(restart_instance))
        .route("/instances/:id/health", get(instance_health))
        .route("/instances/:id/logs", get(instance_logs))
        .route("/instances/:id/stats", get(instance_stats))
        .route("/instances/:id/users", get(list_users).post(assign_user))
        .route("/instances/:id/users/:user_id", axum::routing::delete(unassign_user))
        .route("/instances/:id/agents", get(list_agents))
        .route("/instances/:id/agents/:agent_type", put(put_agent).get(get_agent))
        .route("/instances/:id/agents/:agent_type/test", post(test_agent))
        .route("/instances/:id/agents/:agent_type/usage", post(report_usage))
}

fn parse_agent(raw: &str) -> HiveResult<AgentType> {
    raw.parse::<AgentType>()
        .map_err(|e| HiveError::Invalid(e.to_string()))
}

/// Status, probe and process detail of one instance.
#[derive(Debug, Serialize)]
pub struct InstanceHealth {
    pub id: Uuid,
    pub status: InstanceStatus,
    pub health: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub auto_restarts: u32,
    pub restarts_total: u64,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i32>,
    pub last_error: Option<String>,
}

pub(crate) fn health_of(state: &AppState, inst: Instance) -> InstanceHealth {
    let tracker = state.monitor.tracker(inst.id);
    let runtime = state.supervisor.runtime_info(inst.id);
    let (pid, started_at, last_exit_code) = match runtime {
        Some(rt) => (
            rt.pid,
            rt.started_at,
            rt.last_exit.and_then(|e| e.code),
        ),
        None => (None, None, None),
    };
    InstanceHealth {
        id: inst.id,
        status: inst.status,
        health: inst.health,
        last_health_check: inst.last_health_check,
        consecutive_failures: tracker.consecutive_failures,
        auto_restarts: tracker.auto_restarts,
        restarts_total: tracker.restarts_total,
        pid,
        started_at,
        last_exit_code,
        last_error: inst.last_error,
    }
}

async fn create_instance(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Json(input): Json<NewInstance>,
) -> HiveResult<impl IntoResponse> {
    let inst = state.registry.create(input).await?;
    audit::record(
        &*state.db,
        &admin.actor(),
        "instance.create",
        &inst.id.to_string(),
        Some(json!({ "name": inst.name, "port": inst.port })),
    )
    .await;
    Ok((StatusCode::CREATED, Json(inst)))
}

async fn list_instances(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> HiveResult<Json<Vec<Instance>>> {
    Ok(Json(state.registry.list().await?))
}

async fn get_instance(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> HiveResult<Json<Instance>> {
    Ok(Json(state.registry.get(id).await?))
}

async fn update_instance(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
    Json(patch): Json<InstancePatch>,
) -> HiveResult<Json<Instance>> {
    let inst = state.registry.update(id, patch.clone()).await?;
    audit::record(
        &*state.db,
        &admin.actor(),
        "instance.update",
        &id.to_string(),
        Some(json!({
            "name": patch.name,
            "auto_start": patch.auto_start,
            "max_users": patch.max_users,
        })),
    )
    .await;
    Ok(Json(inst))
}

async fn delete_instance(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
) -> HiveResult<StatusCode> {
    state.supervisor.delete(id).await?;
    state.monitor.forget(id);
    audit::record(&*state.db, &admin.actor(), "instance.delete", &id.to_string(), None).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_instance(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
) -> HiveResult<Json<Instance>> {
    let inst = state.supervisor.start(id).await?;
    state.monitor.reset(id);
    audit::record(&*state.db, &admin.actor(), "instance.start", &id.to_string(), None).await;
    Ok(Json(inst))
}

async fn stop_instance(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
) -> HiveResult<Json<Instance>> {
    let inst = state.supervisor.stop(id).await?;
    state.monitor.reset(id);
    audit::record(&*state.db, &admin.actor(), "instance.stop", &id.to_string(), None).await;
    Ok(Json(inst))
}

async fn restart_instance(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
) -> HiveResult<Json<Instance>> {
    let inst = state.supervisor.restart(id).await?;
    state.monitor.reset(id);
    audit::record(&*state.db, &admin.actor(), "instance.restart", &id.to_string(), None).await;
    Ok(Json(inst))
}

async fn instance_health(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> HiveResult<Json<InstanceHealth>> {
    let inst = state.registry.get(id).await?;
    Ok(Json(health_of(&state, inst)))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    cursor: Option<u64>,
    limit: Option<usize>,
}

async fn instance_logs(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    Query(q): Query<LogsQuery>,
) -> HiveResult<Json<LogTail>> {
    let tail = state
        .supervisor
        .logs(id, q.cursor.unwrap_or(0), q.limit.unwrap_or(DEFAULT_LOG_LIMIT))
        .await?;
    Ok(Json(tail))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    days: Option<u32>,
}

async fn instance_stats(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    Query(q): Query<StatsQuery>,
) -> HiveResult<Json<Vec<UsageStat>>> {
    state.registry.get(id).await?;
    Ok(Json(state.agents.usage_stats(id, q.days).await?))
}

async fn list_users(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> HiveResult<Json<Vec<AssignedUser>>> {
    state.registry.get(id).await?;
    Ok(Json(state.assignments.users_of(id).await?))
}

#[derive(Debug, Deserialize)]
struct AssignRequest {
    user_id: Uuid,
}

async fn assign_user(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
    Json(req): Json<AssignRequest>,
) -> HiveResult<impl IntoResponse> {
    state
        .assignments
        .assign(req.user_id, id, Some(admin.user_id))
        .await?;
    audit::record(
        &*state.db,
        &admin.actor(),
        "instance.assign",
        &id.to_string(),
        Some(json!({ "user_id": req.user_id })),
    )
    .await;
    Ok((StatusCode::CREATED, Json(state.assignments.users_of(id).await?)))
}

async fn unassign_user(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path((id, user_id)): Path<(Uuid, Uuid)>,
) -> HiveResult<StatusCode> {
    state.assignments.unassign(user_id, id).await?;
    audit::record(
        &*state.db,
        &admin.actor(),
        "instance.unassign",
        &id.to_string(),
        Some(json!({ "user_id": user_id })),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_agents(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> HiveResult<Json<Vec<AgentConfigView>>> {
    state.registry.get(id).await?;
    Ok(Json(state.agents.list_configs(id).await?))
}

async fn get_agent(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path((id, agent_type)): Path<(Uuid, String)>,
) -> HiveResult<Json<AgentConfigView>> {
    let agent = parse_agent(&agent_type)?;
    state.registry.get(id).await?;
    Ok(Json(state.agents.get_config(id, agent).await?))
}

async fn put_agent(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path((id, agent_type)): Path<(Uuid, String)>,
    Json(input): Json<AgentConfigInput>,
) -> HiveResult<Json<AgentConfigView>> {
    let agent = parse_agent(&agent_type)?;
    state.registry.get(id).await?;
    Ok(Json(
        state
            .agents
            .set_config(id, agent, input, &admin.actor())
            .await?,
    ))
}

async fn test_agent(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path((id, agent_type)): Path<(Uuid, String)>,
) -> HiveResult<Json<ConnectionTestResult>> {
    let agent = parse_agent(&agent_type)?;
    state.registry.get(id).await?;
    Ok(Json(state.agents.test_connection(id, agent).await?))
}

/// Usage is reported by the instance on behalf of a member, or by an admin.
async fn report_usage(
    State(state): State<AppState>,
    user: AuthUser,
    Path((id, agent_type)): Path<(Uuid, String)>,
    Json(report): Json<UsageReport>,
) -> HiveResult<StatusCode> {
    let agent = parse_agent(&agent_type)?;
    state.registry.get(id).await?;
    if !user.is_admin() && !state.assignments.is_assigned(user.user_id, id).await? {
        return Err(HiveError::InstanceNotAssigned { instance_id: id });
    }
    state.agents.record_usage(id, agent, report).await?;
    Ok(StatusCode::NO_CONTENT)
}
