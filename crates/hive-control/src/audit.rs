use hive_db::entities::audit_events;
use sea_orm::{ActiveModelTrait, ConnectionTrait, Set};
use uuid::Uuid;

/// Who did what, for the audit trail.
#[derive(Debug, Clone, Default)]
pub struct Actor {
    pub request_id: String,
    pub user_id: Option<Uuid>,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            request_id: "system".to_string(),
            user_id: None,
        }
    }
}

/// Best-effort: a failed audit insert never fails the operation it describes.
pub async fn record<C: ConnectionTrait>(
    db: &C,
    actor: &Actor,
    action: &str,
    target: &str,
    meta: Option<serde_json::Value>,
) {
    let model = audit_events::ActiveModel {
        id: Set(Uuid::new_v4()),
        request_id: Set(actor.request_id.clone()),
        user_id: Set(actor.user_id),
        action: Set(action.to_string()),
        target: Set(target.to_string()),
        meta: Set(meta),
        created_at: Set(chrono::Utc::now().into()),
    };

    if let Err(err) = model.insert(db).await {
        tracing::warn!(%err, action, target, "failed to write audit event");
    }
}
