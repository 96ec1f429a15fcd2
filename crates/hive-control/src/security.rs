use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::HiveError;
use crate::state::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const REQUEST_ID_MAX_LEN: usize = 128;

/// Correlation id of the current request, set by [`request_id`].
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

fn is_unsafe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn incoming_request_id(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(REQUEST_ID_HEADER)?.to_str().ok()?.trim();
    if raw.is_empty()
        || raw.len() > REQUEST_ID_MAX_LEN
        || !raw.chars().all(|c| c.is_ascii_graphic())
    {
        return None;
    }
    Some(raw.to_string())
}

// Middleware: propagate or mint `x-request-id`, expose it to handlers and echo
// it on the response.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let id = incoming_request_id(req.headers()).unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(id.clone()));

    let span = tracing::info_span!(
        "http",
        request_id = %id,
        method = %req.method(),
        path = %req.uri().path(),
    );
    let mut resp = next.run(req).instrument(span).await;
    if let Ok(v) = HeaderValue::from_str(&id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, v);
    }
    resp
}

fn origin_is_allowed(allowed: &[String], headers: &HeaderMap) -> bool {
    // Missing Origin means a non-browser client (curl, service-to-service).
    let origin = match headers.get(axum::http::header::ORIGIN) {
        Some(v) => match v.to_str() {
            Ok(s) => s,
            Err(_) => return false,
        },
        None => return true,
    };
    allowed.iter().any(|a| a == origin)
}

// Middleware: browser-originated state changes must come from an allowlisted origin.
pub async fn origin_allowlist(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if is_unsafe_method(req.method()) && !origin_is_allowed(&state.cfg.allowed_origins, req.headers())
    {
        tracing::warn!(method = %req.method(), path = %req.uri().path(), "origin rejected");
        return HiveError::Forbidden("origin not allowed".to_string()).into_response();
    }
    next.run(req).await
}
