pub mod agents;
pub mod api;
pub mod assignments;
pub mod audit;
pub mod auth;
pub mod config;
pub mod env;
pub mod error;
pub mod health;
pub mod logs;
pub mod my_instances;
pub mod port_alloc;
pub mod proxy;
pub mod registry;
pub mod security;
pub mod state;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

use axum::{Json, Router, extract::State, middleware, routing::get};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
struct HealthzPorts {
    start: u16,
    end: u16,
    capacity: usize,
    free: usize,
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    ports: HealthzPorts,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    let ports = state.registry.ports();
    let (start, end) = ports.range();
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        ports: HealthzPorts {
            start,
            end,
            capacity: ports.capacity(),
            free: ports.free_count(),
        },
    })
}

/// Full HTTP surface: public health, then everything behind the access token.
pub fn app(state: AppState) -> Router {
    let authed = Router::new()
        .route("/auth/whoami", get(auth::whoami))
        .merge(api::router())
        .merge(my_instances::router())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(authed)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::origin_allowlist,
        ))
        .layer(middleware::from_fn(security::request_id))
        .with_state(state)
}
