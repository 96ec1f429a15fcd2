use axum::{
    Json,
    body::Body,
    extract::{FromRequestParts, State},
    http::{HeaderMap, Request, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use hive_core::UserRole;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::Actor;
use crate::error::{HiveError, HiveResult};
use crate::security::RequestId;
use crate::state::AppState;

pub const ACCESS_COOKIE_NAME: &str = "access";
const ISSUER: &str = "hive";
const AUDIENCE: &str = "hive-web";

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    username: String,
    role: String,
    exp: usize,
    iat: usize,
    iss: String,
    aud: String,
}

/// Caller identity, attached to the request by [`require_auth`].
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub username: String,
    pub role: UserRole,
    pub request_id: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    pub fn actor(&self) -> Actor {
        Actor {
            request_id: self.request_id.clone(),
            user_id: Some(self.user_id),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WhoamiResponse {
    pub user_id: String,
    pub username: String,
    pub is_admin: bool,
}

fn validate_access_jwt(secret: &str, token: &str) -> HiveResult<Claims> {
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.set_audience(&[AUDIENCE]);
    validation.set_issuer(&[ISSUER]);

    let data = jsonwebtoken::decode::<Claims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| HiveError::Unauthorized(format!("invalid access token: {e}")))?;
    Ok(data.claims)
}

/// Mints an access token the way the auth service does. Used by dev tooling
/// and tests; the orchestrator itself never logs anyone in.
pub fn issue_access_token(
    secret: &str,
    user_id: Uuid,
    username: &str,
    role: UserRole,
    ttl: time::Duration,
) -> HiveResult<String> {
    let now = time::OffsetDateTime::now_utc();
    let claims = Claims {
        sub: user_id.to_string(),
        username: username.to_string(),
        role: role.as_str().to_string(),
        exp: (now + ttl).unix_timestamp() as usize,
        iat: now.unix_timestamp() as usize,
        iss: ISSUER.to_string(),
        aud: AUDIENCE.to_string(),
    };

    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| HiveError::Unauthorized(format!("token encoding failed: {e}")))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let mut parts = raw.split_whitespace();
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some(token.to_string())
}

fn access_token(headers: &HeaderMap) -> Option<String> {
    bearer_token(headers).or_else(|| {
        CookieJar::from_headers(headers)
            .get(ACCESS_COOKIE_NAME)
            .map(|c| c.value().to_string())
            .filter(|v| !v.is_empty())
    })
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> HiveResult<(Uuid, String, UserRole)> {
    let token = access_token(headers)
        .ok_or_else(|| HiveError::Unauthorized("missing access token".to_string()))?;
    let claims = validate_access_jwt(&state.cfg.jwt_secret, &token)?;
    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| HiveError::Unauthorized("invalid subject".to_string()))?;

    // Role comes from the user row, not the token, so demotions apply immediately.
    let user = state
        .assignments
        .find_user(user_id)
        .await?
        .filter(|u| u.is_active)
        .ok_or_else(|| HiveError::Unauthorized("unknown or inactive user".to_string()))?;
    Ok((user.id, user.username, user.role))
}

// Middleware: validate the access token and attach `AuthUser` to the request.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, HiveError> {
    let (user_id, username, role) = authenticate(&state, req.headers()).await?;
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default();
    req.extensions_mut().insert(AuthUser {
        user_id,
        username,
        role,
        request_id,
    });
    Ok(next.run(req).await)
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = HiveError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or_else(|| HiveError::Unauthorized("missing access token".to_string()))
    }
}

/// Extractor for admin-only handlers.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = HiveError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(HiveError::Forbidden("admin role required".to_string()));
        }
        Ok(AdminUser(user))
    }
}

pub async fn whoami(user: AuthUser) -> Json<WhoamiResponse> {
    Json(WhoamiResponse {
        user_id: user.user_id.to_string(),
        username: user.username.clone(),
        is_admin: user.is_admin(),
    })
}
