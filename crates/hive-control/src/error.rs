use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use uuid::Uuid;

const MAX_MESSAGE_BYTES: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HiveError {
    #[error("no free port left in {start}-{end}")]
    PortExhausted { start: u16, end: u16 },
    #[error("port {port} is held by another process")]
    PortConflict { port: u16 },
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),
    #[error("instance {id} must be stopped (status: {status})")]
    InstanceMustBeStopped { id: Uuid, status: String },
    #[error("instance {id} still has {count} assigned user(s)")]
    InstanceHasUsers { id: Uuid, count: u64 },
    #[error("instance {id} did not become healthy within {seconds}s")]
    HealthCheckTimeout { id: Uuid, seconds: u64 },
    #[error("failed to spawn instance process: {0}")]
    ProcessSpawnFailed(String),
    #[error("instance {instance_id} is not assigned to this user")]
    InstanceNotAssigned { instance_id: Uuid },
    #[error("no instance selected")]
    NoInstanceSelected,
    #[error("instance {0} is not running")]
    InstanceNotRunning(Uuid),
    #[error("rate limit exceeded: {limit} requests/minute")]
    RateLimitExceeded { limit: u32 },
    #[error("instance {id} reached its user limit ({max_users})")]
    UserLimitReached { id: Uuid, max_users: i32 },
    #[error("user not found: {0}")]
    UserNotFound(Uuid),
    #[error("agent {agent_type} is not configured for instance {instance_id}")]
    AgentNotConfigured {
        instance_id: Uuid,
        agent_type: String,
    },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("credential crypto failed: {0}")]
    Crypto(String),
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HiveResult<T> = Result<T, HiveError>;

impl HiveError {
    /// Stable identifier surfaced to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            HiveError::PortExhausted { .. } => "port_exhausted",
            HiveError::PortConflict { .. } => "port_conflict",
            HiveError::InstanceNotFound(_) => "instance_not_found",
            HiveError::InstanceMustBeStopped { .. } => "instance_must_be_stopped",
            HiveError::InstanceHasUsers { .. } => "instance_has_users",
            HiveError::HealthCheckTimeout { .. } => "health_check_timeout",
            HiveError::ProcessSpawnFailed(_) => "process_spawn_failed",
            HiveError::InstanceNotAssigned { .. } => "instance_not_assigned",
            HiveError::NoInstanceSelected => "no_instance_selected",
            HiveError::InstanceNotRunning(_) => "instance_not_running",
            HiveError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            HiveError::UserLimitReached { .. } => "user_limit_reached",
            HiveError::UserNotFound(_) => "user_not_found",
            HiveError::AgentNotConfigured { .. } => "agent_not_configured",
            HiveError::Unauthorized(_) => "unauthorized",
            HiveError::Forbidden(_) => "forbidden",
            HiveError::Invalid(_) => "invalid_param",
            HiveError::Crypto(_) => "crypto_error",
            HiveError::Upstream(_) => "upstream_error",
            HiveError::Database(_) => "database_error",
            HiveError::Io(_) => "io_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            HiveError::PortExhausted { .. }
            | HiveError::PortConflict { .. }
            | HiveError::InstanceMustBeStopped { .. }
            | HiveError::InstanceHasUsers { .. }
            | HiveError::UserLimitReached { .. } => StatusCode::CONFLICT,
            HiveError::InstanceNotFound(_)
            | HiveError::UserNotFound(_)
            | HiveError::AgentNotConfigured { .. } => StatusCode::NOT_FOUND,
            HiveError::HealthCheckTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            HiveError::InstanceNotAssigned { .. } | HiveError::Forbidden(_) => {
                StatusCode::FORBIDDEN
            }
            HiveError::NoInstanceSelected | HiveError::Invalid(_) => StatusCode::BAD_REQUEST,
            HiveError::InstanceNotRunning(_) => StatusCode::SERVICE_UNAVAILABLE,
            HiveError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            HiveError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            HiveError::Upstream(_) => StatusCode::BAD_GATEWAY,
            HiveError::ProcessSpawnFailed(_)
            | HiveError::Crypto(_)
            | HiveError::Database(_)
            | HiveError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short operator-facing suggestion for caller-correctable errors.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            HiveError::PortExhausted { .. } => {
                Some("Delete unused instances or widen HIVE_PORT_RANGE_START/HIVE_PORT_RANGE_END.")
            }
            HiveError::InstanceMustBeStopped { .. } => Some("Stop the instance first."),
            HiveError::InstanceHasUsers { .. } => {
                Some("Unassign all users from the instance first.")
            }
            HiveError::NoInstanceSelected => Some("Select an instance via PUT /my-instances/current."),
            HiveError::InstanceNotRunning(_) => {
                Some("Ask an administrator to start the instance or enable auto-start.")
            }
            HiveError::HealthCheckTimeout { .. } => Some("Check the instance logs."),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

impl IntoResponse for HiveError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        }
        let body = ErrorBody {
            code: self.code().to_string(),
            message: truncate_utf8(&self.to_string(), MAX_MESSAGE_BYTES),
            hint: self.hint().map(str::to_string),
        };
        (status, Json(body)).into_response()
    }
}
