use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Request, header},
    response::Response,
};
use uuid::Uuid;

use crate::assignments::Assignments;
use crate::error::{HiveError, HiveResult};
use crate::registry::Instance;
use crate::supervisor::Supervisor;

const MAX_REQUEST_BODY: usize = 64 * 1024 * 1024;
const USER_HEADER: &str = "x-hive-user-id";

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Target chosen for one user request.
#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub instance: Instance,
    pub port: u16,
}

/// Resolves a user to their current instance and forwards HTTP to it.
#[derive(Clone)]
pub struct ProxyRouter {
    sup: Supervisor,
    assignments: Assignments,
    http: reqwest::Client,
}

impl ProxyRouter {
    pub fn new(sup: Supervisor, assignments: Assignments) -> HiveResult<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| HiveError::Upstream(format!("proxy client: {e}")))?;
        Ok(Self {
            sup,
            assignments,
            http,
        })
    }

    /// current instance -> existence -> membership -> running (or auto-start).
    pub async fn resolve(&self, user_id: Uuid) -> HiveResult<RouteTarget> {
        let user = self.assignments.get_user(user_id).await?;
        let instance_id = user
            .current_instance_id
            .ok_or(HiveError::NoInstanceSelected)?;

        let instance = self
            .sup
            .registry()
            .find(instance_id)
            .await?
            .ok_or(HiveError::InstanceNotFound(instance_id))?;

        if !self.assignments.is_assigned(user_id, instance_id).await? {
            return Err(HiveError::InstanceNotAssigned { instance_id });
        }

        if let Some(port) = self.sup.live_port(instance_id) {
            return Ok(RouteTarget { instance, port });
        }
        if !instance.auto_start {
            return Err(HiveError::InstanceNotRunning(instance_id));
        }

        tracing::info!(instance_id = %instance_id, user_id = %user_id, "auto-starting instance for request");
        let instance = self.sup.start(instance_id).await?;
        let port = self
            .sup
            .live_port(instance_id)
            .ok_or(HiveError::InstanceNotRunning(instance_id))?;
        Ok(RouteTarget { instance, port })
    }

    pub async fn route(&self, user_id: Uuid, path: &str, req: Request<Body>) -> HiveResult<Response> {
        let target = self.resolve(user_id).await?;
        self.dispatch(user_id, &target, path, req).await
    }

    async fn dispatch(
        &self,
        user_id: Uuid,
        target: &RouteTarget,
        path: &str,
        req: Request<Body>,
    ) -> HiveResult<Response> {
        match self.forward(user_id, target.port, path, req).await {
            Err(HiveError::Upstream(msg)) => {
                // A delete that raced this request must not look like a gateway error.
                if self.sup.registry().find(target.instance.id).await?.is_none() {
                    return Err(HiveError::InstanceNotFound(target.instance.id));
                }
                Err(HiveError::Upstream(msg))
            }
            other => other,
        }
    }

    async fn forward(
        &self,
        user_id: Uuid,
        port: u16,
        path: &str,
        req: Request<Body>,
    ) -> HiveResult<Response> {
        let (parts, body) = req.into_parts();
        let mut url = format!("http://127.0.0.1:{port}/{}", path.trim_start_matches('/'));
        if let Some(q) = parts.uri.query() {
            url.push('?');
            url.push_str(q);
        }

        let body = axum::body::to_bytes(body, MAX_REQUEST_BODY)
            .await
            .map_err(|e| HiveError::Invalid(format!("request body: {e}")))?;

        let mut headers = forwardable(&parts.headers);
        if let Ok(v) = HeaderValue::from_str(&user_id.to_string()) {
            headers.insert(USER_HEADER, v);
        }

        tracing::debug!(port, method = %parts.method, path, "proxying request");
        let resp = self
            .http
            .request(parts.method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| HiveError::Upstream(e.without_url().to_string()))?;

        let mut builder = Response::builder().status(resp.status());
        if let Some(h) = builder.headers_mut() {
            for (name, value) in resp.headers() {
                if !is_hop_by_hop(name) {
                    h.append(name.clone(), value.clone());
                }
            }
        }
        builder
            .body(Body::from_stream(resp.bytes_stream()))
            .map_err(|e| HiveError::Upstream(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEnv;

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[test]
    fn strips_hop_by_hop_and_host() {
        let mut h = HeaderMap::new();
        h.insert(header::HOST, HeaderValue::from_static("hive.local"));
        h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        h.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        h.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        h.append(header::COOKIE, HeaderValue::from_static("a=1"));
        h.append(header::COOKIE, HeaderValue::from_static("b=2"));
        let out = forwardable(&h);
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get("keep-alive").is_none());
        assert_eq!(out.get(header::ACCEPT).unwrap(), "application/json");
        assert_eq!(out.get_all(header::COOKIE).iter().count(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn delete_racing_a_request_reads_as_not_found() {
        let env = TestEnv::new().await;
        let inst = env.create_instance("a").await;
        let user = env.create_user("john").await;
        env.assignments.assign(user, inst.id, None).await.unwrap();
        env.supervisor.start(inst.id).await.unwrap();

        let router = &env.state.proxy;
        let target = router.resolve(user).await.unwrap();
        assert_eq!(target.instance.id, inst.id);

        // Nothing listens on the port while the row still exists.
        let err = router.dispatch(user, &target, "/x", get("/x")).await.unwrap_err();
        assert!(matches!(err, HiveError::Upstream(_)));

        env.supervisor.stop(inst.id).await.unwrap();
        env.assignments.unassign(user, inst.id).await.unwrap();
        env.supervisor.delete(inst.id).await.unwrap();

        let err = router.dispatch(user, &target, "/x", get("/x")).await.unwrap_err();
        assert!(matches!(err, HiveError::InstanceNotFound(id) if id == inst.id));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn auto_start_instance_is_started_on_resolve() {
        let env = TestEnv::new().await;
        let inst = env.create_instance("a").await;
        env.registry
            .update(
                inst.id,
                crate::registry::InstancePatch {
                    auto_start: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let user = env.create_user("john").await;
        env.assignments.assign(user, inst.id, None).await.unwrap();

        let target = env.state.proxy.resolve(user).await.unwrap();
        assert_eq!(target.instance.status, hive_core::InstanceStatus::Running);
        assert_eq!(env.supervisor.live_port(inst.id), Some(target.port));
        env.supervisor.stop(inst.id).await.unwrap();
    }
}
