use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use hive_core::{AgentType, HealthStatus, InstanceStatus};
use hive_db::entities::{instance_ai_agents, instances, user_instance_assignments};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait, prelude::Expr,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HiveError, HiveResult};
use crate::port_alloc::PortAllocator;

const MAX_NAME_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instance {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub port: u16,
    pub data_dir: PathBuf,
    pub status: InstanceStatus,
    pub health: HealthStatus,
    pub auto_start: bool,
    pub max_users: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl Instance {
    fn from_model(m: instances::Model) -> HiveResult<Self> {
        let status = m
            .status
            .parse::<InstanceStatus>()
            .map_err(|e| HiveError::Invalid(format!("stored instance {}: {e}", m.id)))?;
        let health = m
            .health
            .parse::<HealthStatus>()
            .map_err(|e| HiveError::Invalid(format!("stored instance {}: {e}", m.id)))?;
        let port = u16::try_from(m.port)
            .map_err(|_| HiveError::Invalid(format!("stored instance {}: bad port", m.id)))?;
        Ok(Self {
            id: m.id,
            name: m.name,
            description: m.description,
            port,
            data_dir: PathBuf::from(m.data_dir),
            status,
            health,
            auto_start: m.auto_start,
            max_users: m.max_users.max(0) as u32,
            last_error: m.last_error,
            created_at: m.created_at.with_timezone(&Utc),
            updated_at: m.updated_at.with_timezone(&Utc),
            last_health_check: m.last_health_check.map(|t| t.with_timezone(&Utc)),
        })
    }

    pub fn layout(&self) -> InstanceLayout {
        InstanceLayout::new(&self.data_dir)
    }
}

/// `{data_root}/{instance_id}/{db,config,worktrees,logs,ai-agents/<type>}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLayout {
    pub root: PathBuf,
}

impl InstanceLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn db_dir(&self) -> PathBuf {
        self.root.join("db")
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir().join("app.db")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.root.join("worktrees")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn console_log(&self) -> PathBuf {
        self.logs_dir().join("console.log")
    }

    pub fn agent_dir(&self, agent: AgentType) -> PathBuf {
        self.root.join("ai-agents").join(agent.as_str())
    }

    fn subdirs(&self) -> Vec<PathBuf> {
        let mut out = vec![
            self.db_dir(),
            self.config_dir(),
            self.worktrees_dir(),
            self.logs_dir(),
        ];
        out.extend(AgentType::ALL.iter().map(|a| self.agent_dir(*a)));
        out
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewInstance {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub max_users: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstancePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub auto_start: Option<bool>,
    pub max_users: Option<u32>,
}

fn validate_name(name: &str) -> HiveResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(HiveError::Invalid("name must be non-empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(HiveError::Invalid(format!(
            "name must be at most {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(name.to_string())
}

fn max_users_i32(v: u32) -> HiveResult<i32> {
    i32::try_from(v).map_err(|_| HiveError::Invalid("max_users is too large".to_string()))
}

/// Durable instance metadata plus the invariants around it.
#[derive(Clone)]
pub struct InstanceRegistry {
    db: Arc<DatabaseConnection>,
    ports: Arc<PortAllocator>,
    data_root: PathBuf,
}

impl InstanceRegistry {
    pub fn new(db: Arc<DatabaseConnection>, ports: Arc<PortAllocator>, data_root: PathBuf) -> Self {
        Self {
            db,
            ports,
            data_root,
        }
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Allocate a port, reserve a data directory, then persist. Any failure after
    /// allocation hands both back.
    pub async fn create(&self, spec: NewInstance) -> HiveResult<Instance> {
        let name = validate_name(&spec.name)?;
        let max_users = max_users_i32(spec.max_users)?;
        let id = Uuid::new_v4();
        let port = self.ports.allocate()?;
        let data_dir = self.data_root.join(id.to_string());

        if let Err(err) = reserve_data_dir(&self.data_root, &data_dir).await {
            self.ports.release(port);
            return Err(err);
        }

        let now = Utc::now();
        let model = instances::ActiveModel {
            id: Set(id),
            name: Set(name),
            description: Set(spec.description.filter(|d| !d.trim().is_empty())),
            port: Set(i32::from(port)),
            data_dir: Set(data_dir.display().to_string()),
            status: Set(InstanceStatus::Stopped.as_str().to_string()),
            health: Set(HealthStatus::Unknown.as_str().to_string()),
            auto_start: Set(spec.auto_start),
            max_users: Set(max_users),
            last_error: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            last_health_check: Set(None),
        };

        if let Err(err) = instances::Entity::insert(model).exec(&*self.db).await {
            self.ports.release(port);
            if let Err(e) = tokio::fs::remove_dir_all(&data_dir).await {
                tracing::warn!(instance_id = %id, error = %e, "failed to clean up data dir");
            }
            return Err(err.into());
        }

        tracing::info!(instance_id = %id, port, data_dir = %data_dir.display(), "instance created");
        self.get(id).await
    }

    pub async fn find(&self, id: Uuid) -> HiveResult<Option<Instance>> {
        instances::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .map(Instance::from_model)
            .transpose()
    }

    pub async fn get(&self, id: Uuid) -> HiveResult<Instance> {
        self.find(id).await?.ok_or(HiveError::InstanceNotFound(id))
    }

    pub async fn list(&self) -> HiveResult<Vec<Instance>> {
        instances::Entity::find()
            .order_by_asc(instances::Column::CreatedAt)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(Instance::from_model)
            .collect()
    }

    pub async fn list_by_ids(&self, ids: Vec<Uuid>) -> HiveResult<Vec<Instance>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        instances::Entity::find()
            .filter(instances::Column::Id.is_in(ids))
            .order_by_asc(instances::Column::CreatedAt)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(Instance::from_model)
            .collect()
    }

    pub async fn update(&self, id: Uuid, patch: InstancePatch) -> HiveResult<Instance> {
        let model = instances::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or(HiveError::InstanceNotFound(id))?;

        let mut active: instances::ActiveModel = model.into();
        if let Some(name) = patch.name {
            active.name = Set(validate_name(&name)?);
        }
        if let Some(description) = patch.description {
            let d = description.trim().to_string();
            active.description = Set(if d.is_empty() { None } else { Some(d) });
        }
        if let Some(auto_start) = patch.auto_start {
            active.auto_start = Set(auto_start);
        }
        if let Some(max_users) = patch.max_users {
            active.max_users = Set(max_users_i32(max_users)?);
        }
        active.updated_at = Set(Utc::now().into());
        let updated = active.update(&*self.db).await?;
        Instance::from_model(updated)
    }

    /// Callers must hold the instance's operation lock.
    pub async fn delete(&self, id: Uuid) -> HiveResult<()> {
        let instance = self.get(id).await?;
        if instance.status != InstanceStatus::Stopped {
            return Err(HiveError::InstanceMustBeStopped {
                id,
                status: instance.status.to_string(),
            });
        }

        let count = user_instance_assignments::Entity::find()
            .filter(user_instance_assignments::Column::InstanceId.eq(id))
            .count(&*self.db)
            .await?;
        if count > 0 {
            return Err(HiveError::InstanceHasUsers { id, count });
        }

        let txn = self.db.begin().await?;
        instance_ai_agents::Entity::delete_many()
            .filter(instance_ai_agents::Column::InstanceId.eq(id))
            .exec(&txn)
            .await?;
        instances::Entity::delete_by_id(id).exec(&txn).await?;
        txn.commit().await?;

        self.ports.release(instance.port);
        if let Err(e) = tokio::fs::remove_dir_all(&instance.data_dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(instance_id = %id, error = %e, "failed to remove data dir");
        }

        tracing::info!(instance_id = %id, port = instance.port, "instance deleted");
        Ok(())
    }

    pub async fn set_status(
        &self,
        id: Uuid,
        status: InstanceStatus,
        last_error: Option<String>,
    ) -> HiveResult<()> {
        let res = instances::Entity::update_many()
            .col_expr(instances::Column::Status, Expr::value(status.as_str()))
            .col_expr(instances::Column::LastError, Expr::value(last_error))
            .col_expr(
                instances::Column::UpdatedAt,
                Expr::value(chrono::DateTime::<chrono::FixedOffset>::from(Utc::now())),
            )
            .filter(instances::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        if res.rows_affected == 0 {
            return Err(HiveError::InstanceNotFound(id));
        }
        Ok(())
    }

    pub async fn set_health(&self, id: Uuid, health: HealthStatus) -> HiveResult<()> {
        let now = chrono::DateTime::<chrono::FixedOffset>::from(Utc::now());
        let res = instances::Entity::update_many()
            .col_expr(instances::Column::Health, Expr::value(health.as_str()))
            .col_expr(instances::Column::LastHealthCheck, Expr::value(Some(now)))
            .filter(instances::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        if res.rows_affected == 0 {
            return Err(HiveError::InstanceNotFound(id));
        }
        Ok(())
    }

    /// Only used when an external process squats on the instance's port at start.
    pub async fn set_port(&self, id: Uuid, port: u16) -> HiveResult<()> {
        let res = instances::Entity::update_many()
            .col_expr(instances::Column::Port, Expr::value(i32::from(port)))
            .col_expr(
                instances::Column::UpdatedAt,
                Expr::value(chrono::DateTime::<chrono::FixedOffset>::from(Utc::now())),
            )
            .filter(instances::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        if res.rows_affected == 0 {
            return Err(HiveError::InstanceNotFound(id));
        }
        Ok(())
    }

    /// Re-seed the port pool and clear transitional states left behind by a
    /// previous orchestrator process. Returns the instances flagged `auto_start`.
    pub async fn reconcile_on_boot(&self) -> HiveResult<Vec<Instance>> {
        let mut auto_start = Vec::new();
        for inst in self.list().await? {
            if !self.ports.reserve(inst.port) {
                tracing::warn!(
                    instance_id = %inst.id,
                    port = inst.port,
                    "instance port outside configured range or duplicated"
                );
            }
            if inst.status != InstanceStatus::Stopped {
                tracing::info!(
                    instance_id = %inst.id,
                    status = %inst.status,
                    "resetting stale status to stopped"
                );
                let last_error = if inst.status == InstanceStatus::Error {
                    inst.last_error.clone()
                } else {
                    None
                };
                self.set_status(inst.id, InstanceStatus::Stopped, last_error)
                    .await?;
                self.set_health(inst.id, HealthStatus::Unknown).await?;
            }
            if inst.auto_start {
                auto_start.push(inst);
            }
        }
        Ok(auto_start)
    }
}

async fn reserve_data_dir(data_root: &Path, data_dir: &Path) -> HiveResult<()> {
    tokio::fs::create_dir_all(data_root).await?;
    // `create_dir` fails if the directory already exists, which keeps data dirs unique.
    tokio::fs::create_dir(data_dir).await?;
    let layout = InstanceLayout::new(data_dir);
    for dir in layout.subdirs() {
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            let _ = tokio::fs::remove_dir_all(data_dir).await;
            return Err(e.into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn create_allocates_lowest_port_and_layout() {
        let env = testing::TestEnv::new().await;
        let inst = env
            .registry
            .create(NewInstance {
                name: "dev-team-1".to_string(),
                description: None,
                auto_start: false,
                max_users: 0,
            })
            .await
            .unwrap();

        assert_eq!(inst.port, env.config.port_range_start);
        assert_eq!(inst.status, InstanceStatus::Stopped);
        assert_eq!(inst.health, HealthStatus::Unknown);
        let layout = inst.layout();
        assert!(layout.db_dir().is_dir());
        assert!(layout.config_dir().is_dir());
        assert!(layout.worktrees_dir().is_dir());
        assert!(layout.logs_dir().is_dir());
        assert!(layout.agent_dir(AgentType::ClaudeCode).is_dir());
    }

    #[tokio::test]
    async fn ports_are_distinct_and_exhaustion_is_reported() {
        let env = testing::TestEnv::with_port_range(18100, 18102).await;
        let mut ports = std::collections::BTreeSet::new();
        for i in 0..3 {
            let inst = env.create_instance(&format!("i{i}")).await;
            assert!(ports.insert(inst.port));
        }
        let err = env
            .registry
            .create(NewInstance {
                name: "overflow".to_string(),
                description: None,
                auto_start: false,
                max_users: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::PortExhausted { .. }));
        assert_eq!(env.registry.list().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failed_create_releases_port() {
        let env = testing::TestEnv::new().await;
        let err = env
            .registry
            .create(NewInstance {
                name: "   ".to_string(),
                description: None,
                auto_start: false,
                max_users: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::Invalid(_)));
        assert_eq!(env.ports.free_count(), env.ports.capacity());

        // Data root is a file: directory reservation fails after the port was taken.
        let blocked = env.dir.path().join("blocked");
        std::fs::write(&blocked, b"x").unwrap();
        let registry = InstanceRegistry::new(env.db.clone(), env.ports.clone(), blocked);
        assert!(
            registry
                .create(NewInstance {
                    name: "x".to_string(),
                    description: None,
                    auto_start: false,
                    max_users: 0,
                })
                .await
                .is_err()
        );
        assert_eq!(env.ports.free_count(), env.ports.capacity());
    }

    #[tokio::test]
    async fn delete_requires_stopped_and_unassigned() {
        let env = testing::TestEnv::new().await;
        let inst = env.create_instance("a").await;

        env.registry
            .set_status(inst.id, InstanceStatus::Running, None)
            .await
            .unwrap();
        let err = env.registry.delete(inst.id).await.unwrap_err();
        assert!(matches!(err, HiveError::InstanceMustBeStopped { .. }));
        assert!(env.registry.find(inst.id).await.unwrap().is_some());

        env.registry
            .set_status(inst.id, InstanceStatus::Stopped, None)
            .await
            .unwrap();
        let user = env.create_user("john").await;
        env.assignments
            .assign(user, inst.id, None)
            .await
            .unwrap();
        let err = env.registry.delete(inst.id).await.unwrap_err();
        assert!(matches!(err, HiveError::InstanceHasUsers { count: 1, .. }));
        assert!(env.registry.find(inst.id).await.unwrap().is_some());

        env.assignments.unassign(user, inst.id).await.unwrap();
        env.registry.delete(inst.id).await.unwrap();
        assert!(env.registry.find(inst.id).await.unwrap().is_none());
        assert!(!inst.data_dir.exists());
        assert!(!env.ports.is_allocated(inst.port));
    }

    #[tokio::test]
    async fn update_applies_patch() {
        let env = testing::TestEnv::new().await;
        let inst = env.create_instance("a").await;
        let updated = env
            .registry
            .update(
                inst.id,
                InstancePatch {
                    name: Some("renamed".to_string()),
                    description: Some("team sandbox".to_string()),
                    auto_start: Some(true),
                    max_users: Some(5),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.description.as_deref(), Some("team sandbox"));
        assert!(updated.auto_start);
        assert_eq!(updated.max_users, 5);
        assert_eq!(updated.port, inst.port);
    }

    #[tokio::test]
    async fn reconcile_resets_stale_states_and_reserves_ports() {
        let env = testing::TestEnv::new().await;
        let a = env.create_instance("a").await;
        env.registry
            .set_status(a.id, InstanceStatus::Running, None)
            .await
            .unwrap();

        let fresh = Arc::new(PortAllocator::new(
            env.config.port_range_start,
            env.config.port_range_end,
        ));
        let registry = InstanceRegistry::new(
            env.db.clone(),
            fresh.clone(),
            env.config.data_root.clone(),
        );
        registry.reconcile_on_boot().await.unwrap();
        assert!(fresh.is_allocated(a.port));
        assert_eq!(
            registry.get(a.id).await.unwrap().status,
            InstanceStatus::Stopped
        );
    }
}
