use sea_orm_migration::prelude::*;

mod m0001_create_instances;
mod m0002_create_users;
mod m0003_create_user_instance_assignments;
mod m0004_create_instance_ai_agents;
mod m0005_create_instance_usage_stats;
mod m0006_create_audit_events;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m0001_create_instances::Migration),
            Box::new(m0002_create_users::Migration),
            Box::new(m0003_create_user_instance_assignments::Migration),
            Box::new(m0004_create_instance_ai_agents::Migration),
            Box::new(m0005_create_instance_usage_stats::Migration),
            Box::new(m0006_create_audit_events::Migration),
        ]
    }
}
