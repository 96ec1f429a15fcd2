use std::sync::Arc;

use chrono::{DateTime, Utc};
use hive_core::UserRole;
use hive_db::entities::{instances, user_instance_assignments as uia, users};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{HiveError, HiveResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
    pub role: UserRole,
    pub current_instance_id: Option<Uuid>,
    pub is_active: bool,
}

impl UserRecord {
    fn from_model(m: users::Model) -> HiveResult<Self> {
        let role = m
            .role
            .parse::<UserRole>()
            .map_err(|e| HiveError::Invalid(format!("stored user {}: {e}", m.id)))?;
        Ok(Self {
            id: m.id,
            username: m.username,
            role,
            current_instance_id: m.current_instance_id,
            is_active: m.is_active,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AssignedUser {
    pub user_id: Uuid,
    pub username: String,
    pub role: UserRole,
    pub assigned_by: Option<Uuid>,
    pub assigned_at: DateTime<Utc>,
    pub is_current: bool,
}

/// Users, their instance grants, and the current-instance pointer.
#[derive(Clone)]
pub struct Assignments {
    db: Arc<DatabaseConnection>,
}

async fn load_user<C: ConnectionTrait>(db: &C, user_id: Uuid) -> HiveResult<users::Model> {
    users::Entity::find_by_id(user_id)
        .one(db)
        .await?
        .ok_or(HiveError::UserNotFound(user_id))
}

async fn set_current<C: ConnectionTrait>(
    db: &C,
    user: users::Model,
    current: Option<Uuid>,
) -> HiveResult<()> {
    let mut active: users::ActiveModel = user.into();
    active.current_instance_id = Set(current);
    active.updated_at = Set(Utc::now().into());
    active.update(db).await?;
    Ok(())
}

impl Assignments {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Returns the existing user with this name, or creates one. Identity is owned
    /// by the auth collaborator; this exists for bootstrap and tests.
    pub async fn register_user(&self, username: &str, role: UserRole) -> HiveResult<UserRecord> {
        let username = username.trim();
        if username.is_empty() {
            return Err(HiveError::Invalid("username must be non-empty".to_string()));
        }
        if let Some(existing) = users::Entity::find()
            .filter(users::Column::Username.eq(username))
            .one(&*self.db)
            .await?
        {
            return UserRecord::from_model(existing);
        }

        let now = Utc::now();
        let model = users::ActiveModel {
            id: Set(Uuid::new_v4()),
            username: Set(username.to_string()),
            role: Set(role.as_str().to_string()),
            current_instance_id: Set(None),
            is_active: Set(true),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };
        let inserted = model.insert(&*self.db).await?;
        UserRecord::from_model(inserted)
    }

    pub async fn find_user(&self, user_id: Uuid) -> HiveResult<Option<UserRecord>> {
        users::Entity::find_by_id(user_id)
            .one(&*self.db)
            .await?
            .map(UserRecord::from_model)
            .transpose()
    }

    pub async fn get_user(&self, user_id: Uuid) -> HiveResult<UserRecord> {
        self.find_user(user_id)
            .await?
            .ok_or(HiveError::UserNotFound(user_id))
    }

    pub async fn is_assigned(&self, user_id: Uuid, instance_id: Uuid) -> HiveResult<bool> {
        Ok(uia::Entity::find_by_id((user_id, instance_id))
            .one(&*self.db)
            .await?
            .is_some())
    }

    pub async fn count_for_instance(&self, instance_id: Uuid) -> HiveResult<u64> {
        Ok(uia::Entity::find()
            .filter(uia::Column::InstanceId.eq(instance_id))
            .count(&*self.db)
            .await?)
    }

    /// Grant `user_id` access to `instance_id`. Re-assigning is a no-op. A user
    /// with no current instance gets this one as current.
    pub async fn assign(
        &self,
        user_id: Uuid,
        instance_id: Uuid,
        assigned_by: Option<Uuid>,
    ) -> HiveResult<()> {
        let txn = self.db.begin().await?;

        let instance = instances::Entity::find_by_id(instance_id)
            .one(&txn)
            .await?
            .ok_or(HiveError::InstanceNotFound(instance_id))?;
        let user = load_user(&txn, user_id).await?;

        if uia::Entity::find_by_id((user_id, instance_id))
            .one(&txn)
            .await?
            .is_some()
        {
            return Ok(());
        }

        if instance.max_users > 0 {
            let count = uia::Entity::find()
                .filter(uia::Column::InstanceId.eq(instance_id))
                .count(&txn)
                .await?;
            if count >= instance.max_users as u64 {
                return Err(HiveError::UserLimitReached {
                    id: instance_id,
                    max_users: instance.max_users,
                });
            }
        }

        uia::ActiveModel {
            user_id: Set(user_id),
            instance_id: Set(instance_id),
            assigned_by: Set(assigned_by),
            assigned_at: Set(Utc::now().into()),
        }
        .insert(&txn)
        .await?;

        if user.current_instance_id.is_none() {
            set_current(&txn, user, Some(instance_id)).await?;
        }

        txn.commit().await?;
        tracing::info!(user_id = %user_id, instance_id = %instance_id, "user assigned");
        Ok(())
    }

    /// Revoke a grant. If it was the user's current instance, fall back to the
    /// oldest remaining assignment, or to none.
    pub async fn unassign(&self, user_id: Uuid, instance_id: Uuid) -> HiveResult<()> {
        let txn = self.db.begin().await?;
        let user = load_user(&txn, user_id).await?;

        let res = uia::Entity::delete_by_id((user_id, instance_id))
            .exec(&txn)
            .await?;
        if res.rows_affected == 0 {
            return Ok(());
        }

        if user.current_instance_id == Some(instance_id) {
            let fallback = uia::Entity::find()
                .filter(uia::Column::UserId.eq(user_id))
                .order_by_asc(uia::Column::AssignedAt)
                .order_by_asc(uia::Column::InstanceId)
                .one(&txn)
                .await?
                .map(|a| a.instance_id);
            set_current(&txn, user, fallback).await?;
            tracing::info!(
                user_id = %user_id,
                from = %instance_id,
                to = ?fallback,
                "current instance fell back after unassign"
            );
        }

        txn.commit().await?;
        tracing::info!(user_id = %user_id, instance_id = %instance_id, "user unassigned");
        Ok(())
    }

    pub async fn switch_current(&self, user_id: Uuid, instance_id: Uuid) -> HiveResult<()> {
        let txn = self.db.begin().await?;
        let user = load_user(&txn, user_id).await?;
        if uia::Entity::find_by_id((user_id, instance_id))
            .one(&txn)
            .await?
            .is_none()
        {
            return Err(HiveError::InstanceNotAssigned { instance_id });
        }
        if user.current_instance_id != Some(instance_id) {
            set_current(&txn, user, Some(instance_id)).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    pub async fn instance_ids_for(&self, user_id: Uuid) -> HiveResult<Vec<Uuid>> {
        Ok(uia::Entity::find()
            .filter(uia::Column::UserId.eq(user_id))
            .order_by_asc(uia::Column::AssignedAt)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|a| a.instance_id)
            .collect())
    }

    pub async fn users_of(&self, instance_id: Uuid) -> HiveResult<Vec<AssignedUser>> {
        let rows = uia::Entity::find()
            .filter(uia::Column::InstanceId.eq(instance_id))
            .order_by_asc(uia::Column::AssignedAt)
            .find_also_related(users::Entity)
            .all(&*self.db)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (assignment, user) in rows {
            let Some(user) = user else { continue };
            let user = UserRecord::from_model(user)?;
            out.push(AssignedUser {
                user_id: user.id,
                username: user.username,
                role: user.role,
                assigned_by: assignment.assigned_by,
                assigned_at: assignment.assigned_at.with_timezone(&Utc),
                is_current: user.current_instance_id == Some(instance_id),
            });
        }
        Ok(out)
    }
}
