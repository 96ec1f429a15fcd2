use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(InstanceAiAgents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InstanceAiAgents::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(InstanceAiAgents::InstanceId).uuid().not_null())
                    .col(ColumnDef::new(InstanceAiAgents::AgentType).string().not_null())
                    .col(ColumnDef::new(InstanceAiAgents::EncryptedKey).text().not_null())
                    .col(
                        ColumnDef::new(InstanceAiAgents::KeyFingerprint)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InstanceAiAgents::KeyVersion)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(ColumnDef::new(InstanceAiAgents::Config).json_binary().not_null())
                    .col(
                        ColumnDef::new(InstanceAiAgents::RateLimitPerMinute)
                            .integer()
                            .not_null()
                            .default(60),
                    )
                    .col(
                        ColumnDef::new(InstanceAiAgents::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(InstanceAiAgents::RotatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(InstanceAiAgents::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(InstanceAiAgents::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_instance_ai_agents_instance")
                            .from(InstanceAiAgents::Table, InstanceAiAgents::InstanceId)
                            .to(Instances::Table, Instances::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_instance_ai_agents_instance_type_unique")
                    .table(InstanceAiAgents::Table)
                    .col(InstanceAiAgents::InstanceId)
                    .col(InstanceAiAgents::AgentType)
                    .unique()
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(InstanceAiAgents::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum InstanceAiAgents {
    Table,
    Id,
    InstanceId,
    AgentType,
    EncryptedKey,
    KeyFingerprint,
    KeyVersion,
    Config,
    RateLimitPerMinute,
    Enabled,
    RotatedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Instances {
    Table,
    Id,
}
