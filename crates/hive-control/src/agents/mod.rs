pub mod crypto;
pub mod rate_limit;

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, NaiveDate, Utc};
use hive_core::{AgentType, UpstreamAuth};
use hive_db::entities::{instance_ai_agents, instance_usage_stats, instances};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{self, Actor};
use crate::env::InstanceEnv;
use crate::error::{HiveError, HiveResult};
use crate::registry::InstanceLayout;

pub use crypto::CredentialCipher;
use rate_limit::UsageLimiter;

const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 60;
const TEST_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of `PUT /instances/{id}/agents/{type}`. Omitted fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfigInput {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// What the API shows for a configured agent. Never carries the key.
#[derive(Debug, Clone, Serialize)]
pub struct AgentConfigView {
    pub instance_id: Uuid,
    pub agent_type: AgentType,
    pub enabled: bool,
    pub has_key: bool,
    pub key_fingerprint: String,
    pub key_version: i32,
    pub rate_limit_per_minute: u32,
    pub config: serde_json::Value,
    pub rotated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl AgentConfigView {
    fn from_model(agent_type: AgentType, m: instance_ai_agents::Model) -> Self {
        Self {
            instance_id: m.instance_id,
            agent_type,
            enabled: m.enabled,
            has_key: !m.encrypted_key.is_empty(),
            key_fingerprint: m.key_fingerprint,
            key_version: m.key_version,
            rate_limit_per_minute: m.rate_limit_per_minute.max(0) as u32,
            config: m.config,
            rotated_at: m.rotated_at.map(|t| t.with_timezone(&Utc)),
            updated_at: m.updated_at.with_timezone(&Utc),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTestResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub latency_ms: u64,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct UsageReport {
    #[serde(default = "one")]
    pub requests: u32,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub errors: u32,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageStat {
    pub agent_type: String,
    pub date: NaiveDate,
    pub request_count: i64,
    pub token_count: i64,
    pub error_count: i64,
}

/// Per-instance agent credentials, their environment rendering, and usage accounting.
#[derive(Clone)]
pub struct AgentConfigManager {
    db: Arc<DatabaseConnection>,
    cipher: CredentialCipher,
    limiter: Arc<UsageLimiter>,
    http: reqwest::Client,
}

impl AgentConfigManager {
    pub fn new(db: Arc<DatabaseConnection>, cipher: CredentialCipher, http: reqwest::Client) -> Self {
        Self {
            db,
            cipher,
            limiter: Arc::new(UsageLimiter::per_minute()),
            http,
        }
    }

    async fn find_row(
        &self,
        instance_id: Uuid,
        agent: AgentType,
    ) -> HiveResult<Option<instance_ai_agents::Model>> {
        Ok(instance_ai_agents::Entity::find()
            .filter(instance_ai_agents::Column::InstanceId.eq(instance_id))
            .filter(instance_ai_agents::Column::AgentType.eq(agent.as_str()))
            .one(&*self.db)
            .await?)
    }

    async fn require_row(
        &self,
        instance_id: Uuid,
        agent: AgentType,
    ) -> HiveResult<instance_ai_agents::Model> {
        self.find_row(instance_id, agent)
            .await?
            .ok_or_else(|| HiveError::AgentNotConfigured {
                instance_id,
                agent_type: agent.to_string(),
            })
    }

    /// Create or update the agent entry. A new `api_key` is sealed, bumps
    /// `key_version`, and is recorded as a rotation; running processes keep
    /// the old key until their next start.
    pub async fn set_config(
        &self,
        instance_id: Uuid,
        agent: AgentType,
        input: AgentConfigInput,
        actor: &Actor,
    ) -> HiveResult<AgentConfigView> {
        if input.config.as_ref().is_some_and(|cfg| !cfg.is_object()) {
            return Err(HiveError::Invalid("config must be a JSON object".to_string()));
        }
        let rate_limit = input
            .rate_limit_per_minute
            .map(|v| {
                i32::try_from(v)
                    .map_err(|_| HiveError::Invalid("rate_limit_per_minute is too large".into()))
            })
            .transpose()?;
        let api_key = match input.api_key.as_deref().map(str::trim) {
            Some("") => {
                return Err(HiveError::Invalid("api_key must be non-empty".to_string()));
            }
            Some(k) => Some(k.to_string()),
            None => None,
        };

        if instances::Entity::find_by_id(instance_id)
            .one(&*self.db)
            .await?
            .is_none()
        {
            return Err(HiveError::InstanceNotFound(instance_id));
        }

        let sealed = match &api_key {
            Some(k) => Some((self.cipher.seal(k)?, crypto::fingerprint(k))),
            None => None,
        };

        let now = Utc::now();
        let txn = self.db.begin().await?;
        let existing = instance_ai_agents::Entity::find()
            .filter(instance_ai_agents::Column::InstanceId.eq(instance_id))
            .filter(instance_ai_agents::Column::AgentType.eq(agent.as_str()))
            .one(&txn)
            .await?;

        let saved = match existing {
            Some(row) => {
                let next_version = row.key_version + 1;
                let mut active: instance_ai_agents::ActiveModel = row.into();
                if let Some((envelope, fp)) = &sealed {
                    active.encrypted_key = Set(envelope.clone());
                    active.key_fingerprint = Set(fp.clone());
                    active.key_version = Set(next_version);
                    active.rotated_at = Set(Some(now.into()));
                }
                if let Some(v) = rate_limit {
                    active.rate_limit_per_minute = Set(v);
                }
                if let Some(cfg) = input.config {
                    active.config = Set(cfg);
                }
                if let Some(enabled) = input.enabled {
                    active.enabled = Set(enabled);
                }
                active.updated_at = Set(now.into());
                active.update(&txn).await?
            }
            None => {
                let Some((envelope, fp)) = &sealed else {
                    return Err(HiveError::Invalid(
                        "api_key is required when configuring a new agent".to_string(),
                    ));
                };
                instance_ai_agents::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    instance_id: Set(instance_id),
                    agent_type: Set(agent.as_str().to_string()),
                    encrypted_key: Set(envelope.clone()),
                    key_fingerprint: Set(fp.clone()),
                    key_version: Set(1),
                    config: Set(input.config.unwrap_or_else(|| serde_json::json!({}))),
                    rate_limit_per_minute: Set(
                        rate_limit.unwrap_or(DEFAULT_RATE_LIMIT_PER_MINUTE as i32)
                    ),
                    enabled: Set(input.enabled.unwrap_or(true)),
                    rotated_at: Set(Some(now.into())),
                    created_at: Set(now.into()),
                    updated_at: Set(now.into()),
                }
                .insert(&txn)
                .await?
            }
        };

        txn.commit().await?;

        let target = format!("instance:{instance_id}/agent:{agent}");
        if sealed.is_some() {
            audit::record(
                &*self.db,
                actor,
                "agent.rotate",
                &target,
                Some(serde_json::json!({
                    "key_version": saved.key_version,
                    "key_fingerprint": saved.key_fingerprint,
                })),
            )
            .await;
        } else {
            audit::record(&*self.db, actor, "agent.update", &target, None).await;
        }

        tracing::info!(
            instance_id = %instance_id,
            agent_type = %agent,
            key_version = saved.key_version,
            key_fingerprint = %saved.key_fingerprint,
            rotated = sealed.is_some(),
            "agent config saved"
        );
        Ok(AgentConfigView::from_model(agent, saved))
    }

    pub async fn get_config(
        &self,
        instance_id: Uuid,
        agent: AgentType,
    ) -> HiveResult<AgentConfigView> {
        let row = self.require_row(instance_id, agent).await?;
        Ok(AgentConfigView::from_model(agent, row))
    }

    pub async fn list_configs(&self, instance_id: Uuid) -> HiveResult<Vec<AgentConfigView>> {
        let rows = instance_ai_agents::Entity::find()
            .filter(instance_ai_agents::Column::InstanceId.eq(instance_id))
            .order_by_asc(instance_ai_agents::Column::AgentType)
            .all(&*self.db)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|m| {
                let agent = m.agent_type.parse::<AgentType>().ok()?;
                Some(AgentConfigView::from_model(agent, m))
            })
            .collect())
    }

    /// Decrypts every enabled credential of the instance into its agent's
    /// variable pair. Only called right before a spawn.
    pub async fn render_env(
        &self,
        instance_id: Uuid,
        layout: &InstanceLayout,
    ) -> HiveResult<InstanceEnv> {
        let rows = instance_ai_agents::Entity::find()
            .filter(instance_ai_agents::Column::InstanceId.eq(instance_id))
            .filter(instance_ai_agents::Column::Enabled.eq(true))
            .all(&*self.db)
            .await?;

        let mut env = InstanceEnv::default();
        for row in rows {
            let agent = match row.agent_type.parse::<AgentType>() {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!(instance_id = %instance_id, error = %e, "skipping unknown agent");
                    continue;
                }
            };
            let key = self.cipher.open(&row.encrypted_key)?;
            env.set_secret(agent.api_key_var(), key);
            env.set(
                agent.config_dir_var(),
                layout.agent_dir(agent).display().to_string(),
            );
        }
        Ok(env)
    }

    /// One authenticated listing call against the agent's upstream.
    pub async fn test_connection(
        &self,
        instance_id: Uuid,
        agent: AgentType,
    ) -> HiveResult<ConnectionTestResult> {
        let row = self.require_row(instance_id, agent).await?;
        let key = self.cipher.open(&row.encrypted_key)?;
        let probe = agent.upstream_probe();
        let base = row
            .config
            .get("base_url")
            .and_then(|v| v.as_str())
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_else(|| probe.default_base_url.to_string());
        let url = format!("{base}{}", probe.path);

        let mut req = self.http.get(&url).timeout(TEST_CONNECTION_TIMEOUT);
        req = match probe.auth {
            UpstreamAuth::Header(name) => req.header(name, key.as_str()),
            UpstreamAuth::Bearer => req.bearer_auth(&key),
        };
        for (name, value) in probe.extra_headers {
            req = req.header(*name, *value);
        }

        let started = std::time::Instant::now();
        let result = match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                ConnectionTestResult {
                    ok: status.is_success(),
                    status: Some(status.as_u16()),
                    latency_ms: started.elapsed().as_millis() as u64,
                    message: if status.is_success() {
                        "ok".to_string()
                    } else {
                        format!("upstream responded {status}")
                    },
                }
            }
            Err(e) => ConnectionTestResult {
                ok: false,
                status: None,
                latency_ms: started.elapsed().as_millis() as u64,
                message: if e.is_timeout() {
                    "timed out".to_string()
                } else {
                    format!("request failed: {}", e.without_url())
                },
            },
        };

        tracing::info!(
            instance_id = %instance_id,
            agent_type = %agent,
            key_fingerprint = %row.key_fingerprint,
            ok = result.ok,
            status = ?result.status,
            latency_ms = result.latency_ms,
            "agent connection test"
        );
        Ok(result)
    }

    /// Counts a usage report against the agent's per-minute budget and folds
    /// it into today's row.
    pub async fn record_usage(
        &self,
        instance_id: Uuid,
        agent: AgentType,
        report: UsageReport,
    ) -> HiveResult<()> {
        let row = self.require_row(instance_id, agent).await?;
        let limit = row.rate_limit_per_minute.max(0) as u32;
        if !self
            .limiter
            .allow(instance_id, agent, limit, report.requests.max(1))
        {
            return Err(HiveError::RateLimitExceeded { limit });
        }

        let today = Utc::now().date_naive();
        let now = Utc::now();
        let tokens = i64::try_from(report.tokens).unwrap_or(i64::MAX);

        let txn = self.db.begin().await?;
        let existing = instance_usage_stats::Entity::find()
            .filter(instance_usage_stats::Column::InstanceId.eq(instance_id))
            .filter(instance_usage_stats::Column::AgentType.eq(agent.as_str()))
            .filter(instance_usage_stats::Column::Date.eq(today))
            .one(&txn)
            .await?;
        match existing {
            Some(stat) => {
                let request_count = stat.request_count.saturating_add(i64::from(report.requests));
                let token_count = stat.token_count.saturating_add(tokens);
                let error_count = stat.error_count.saturating_add(i64::from(report.errors));
                let mut active: instance_usage_stats::ActiveModel = stat.into();
                active.request_count = Set(request_count);
                active.token_count = Set(token_count);
                active.error_count = Set(error_count);
                active.updated_at = Set(now.into());
                active.update(&txn).await?;
            }
            None => {
                instance_usage_stats::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    instance_id: Set(instance_id),
                    agent_type: Set(agent.as_str().to_string()),
                    date: Set(today),
                    request_count: Set(i64::from(report.requests)),
                    token_count: Set(tokens),
                    error_count: Set(i64::from(report.errors)),
                    updated_at: Set(now.into()),
                }
                .insert(&txn)
                .await?;
            }
        }
        txn.commit().await?;
        Ok(())
    }

    /// Daily rows, newest first. `days` limits the window counting today.
    pub async fn usage_stats(
        &self,
        instance_id: Uuid,
        days: Option<u32>,
    ) -> HiveResult<Vec<UsageStat>> {
        let mut query = instance_usage_stats::Entity::find()
            .filter(instance_usage_stats::Column::InstanceId.eq(instance_id));
        if let Some(days) = days.filter(|d| *d > 0) {
            let since = Utc::now().date_naive() - chrono::Duration::days(i64::from(days) - 1);
            query = query.filter(instance_usage_stats::Column::Date.gte(since));
        }
        let rows = query
            .order_by_desc(instance_usage_stats::Column::Date)
            .order_by_asc(instance_usage_stats::Column::AgentType)
            .all(&*self.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| UsageStat {
                agent_type: r.agent_type,
                date: r.date,
                request_count: r.request_count,
                token_count: r.token_count,
                error_count: r.error_count,
            })
            .collect())
    }

    pub fn forget_instance(&self, instance_id: Uuid) {
        self.limiter.forget(instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn key_input(key: &str) -> AgentConfigInput {
        AgentConfigInput {
            api_key: Some(key.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stored_key_is_encrypted_and_renders_into_env() {
        let env = testing::TestEnv::new().await;
        let inst = env.create_instance("a").await;
        let view = env
            .agents
            .set_config(inst.id, AgentType::ClaudeCode, key_input("sk-ant-123"), &Actor::system())
            .await
            .unwrap();
        assert!(view.has_key);
        assert_eq!(view.key_version, 1);
        assert_eq!(view.key_fingerprint, crypto::fingerprint("sk-ant-123"));

        let row = env
            .agents
            .find_row(inst.id, AgentType::ClaudeCode)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(row.encrypted_key, "sk-ant-123");
        assert!(!row.encrypted_key.contains("sk-ant-123"));

        let rendered = env.agents.render_env(inst.id, &inst.layout()).await.unwrap();
        assert_eq!(rendered.get("ANTHROPIC_API_KEY"), Some("sk-ant-123"));
        assert!(rendered.is_secret("ANTHROPIC_API_KEY"));
        assert_eq!(
            rendered.get("CLAUDE_CONFIG_DIR").map(std::path::PathBuf::from),
            Some(inst.layout().agent_dir(AgentType::ClaudeCode))
        );
        assert_eq!(rendered.get("OPENAI_API_KEY"), None);
    }

    #[tokio::test]
    async fn rotation_bumps_version_and_is_audited() {
        let env = testing::TestEnv::new().await;
        let inst = env.create_instance("a").await;
        env.agents
            .set_config(inst.id, AgentType::Codex, key_input("k1"), &Actor::system())
            .await
            .unwrap();
        let view = env
            .agents
            .set_config(inst.id, AgentType::Codex, key_input("k2"), &Actor::system())
            .await
            .unwrap();
        assert_eq!(view.key_version, 2);

        let view = env
            .agents
            .set_config(
                inst.id,
                AgentType::Codex,
                AgentConfigInput {
                    rate_limit_per_minute: Some(5),
                    ..Default::default()
                },
                &Actor::system(),
            )
            .await
            .unwrap();
        assert_eq!(view.key_version, 2);
        assert_eq!(view.rate_limit_per_minute, 5);

        let rotations = testing::audit_actions(&env.db, "agent.rotate").await;
        assert_eq!(rotations, 2);
    }

    #[tokio::test]
    async fn audit_failure_does_not_fail_the_save() {
        use sea_orm::ConnectionTrait;

        let env = testing::TestEnv::new().await;
        let inst = env.create_instance("a").await;
        env.db
            .execute_unprepared("DROP TABLE audit_events")
            .await
            .unwrap();

        let view = env
            .agents
            .set_config(inst.id, AgentType::Codex, key_input("k1"), &Actor::system())
            .await
            .unwrap();
        assert_eq!(view.key_version, 1);
        let stored = env.agents.get_config(inst.id, AgentType::Codex).await.unwrap();
        assert_eq!(stored.key_fingerprint, crypto::fingerprint("k1"));
    }

    #[tokio::test]
    async fn disabled_agents_are_not_rendered() {
        let env = testing::TestEnv::new().await;
        let inst = env.create_instance("a").await;
        env.agents
            .set_config(
                inst.id,
                AgentType::GeminiCli,
                AgentConfigInput {
                    api_key: Some("g".to_string()),
                    enabled: Some(false),
                    ..Default::default()
                },
                &Actor::system(),
            )
            .await
            .unwrap();
        let rendered = env.agents.render_env(inst.id, &inst.layout()).await.unwrap();
        assert!(rendered.is_empty());
    }

    #[tokio::test]
    async fn new_agent_requires_key() {
        let env = testing::TestEnv::new().await;
        let inst = env.create_instance("a").await;
        let err = env
            .agents
            .set_config(inst.id, AgentType::Codex, AgentConfigInput::default(), &Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::Invalid(_)));

        let err = env
            .agents
            .get_config(inst.id, AgentType::Codex)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::AgentNotConfigured { .. }));
    }

    #[tokio::test]
    async fn usage_is_rate_limited_and_aggregated() {
        let env = testing::TestEnv::new().await;
        let inst = env.create_instance("a").await;
        env.agents
            .set_config(
                inst.id,
                AgentType::Codex,
                AgentConfigInput {
                    api_key: Some("k".to_string()),
                    rate_limit_per_minute: Some(3),
                    ..Default::default()
                },
                &Actor::system(),
            )
            .await
            .unwrap();

        let report = UsageReport {
            requests: 1,
            tokens: 100,
            errors: 0,
        };
        for _ in 0..3 {
            env.agents
                .record_usage(inst.id, AgentType::Codex, report)
                .await
                .unwrap();
        }
        let err = env
            .agents
            .record_usage(inst.id, AgentType::Codex, report)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::RateLimitExceeded { limit: 3 }));

        let stats = env.agents.usage_stats(inst.id, Some(7)).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].request_count, 3);
        assert_eq!(stats[0].token_count, 300);
    }

    #[tokio::test]
    async fn test_connection_reports_upstream_status() {
        use axum::{Router, http::HeaderMap, routing::get};

        let app = Router::new().route(
            "/v1/models",
            get(|headers: HeaderMap| async move {
                let ok = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    == Some("Bearer good-key");
                if ok {
                    axum::http::StatusCode::OK
                } else {
                    axum::http::StatusCode::UNAUTHORIZED
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let env = testing::TestEnv::new().await;
        let inst = env.create_instance("a").await;
        let cfg = serde_json::json!({ "base_url": format!("http://{addr}") });
        for (key, expect_ok, status) in [("good-key", true, 200), ("bad-key", false, 401)] {
            env.agents
                .set_config(
                    inst.id,
                    AgentType::Codex,
                    AgentConfigInput {
                        api_key: Some(key.to_string()),
                        config: Some(cfg.clone()),
                        ..Default::default()
                    },
                    &Actor::system(),
                )
                .await
                .unwrap();
            let res = env
                .agents
                .test_connection(inst.id, AgentType::Codex)
                .await
                .unwrap();
            assert_eq!(res.ok, expect_ok);
            assert_eq!(res.status, Some(status));
            assert!(!res.message.contains(key));
        }
    }
}
