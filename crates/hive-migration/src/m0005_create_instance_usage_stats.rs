use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // No foreign key: usage rows outlive their instance; retention is external.
        manager
            .create_table(
                Table::create()
                    .table(InstanceUsageStats::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InstanceUsageStats::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(InstanceUsageStats::InstanceId).uuid().not_null())
                    .col(ColumnDef::new(InstanceUsageStats::AgentType).string().not_null())
                    .col(ColumnDef::new(InstanceUsageStats::Date).date().not_null())
                    .col(
                        ColumnDef::new(InstanceUsageStats::RequestCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(InstanceUsageStats::TokenCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(InstanceUsageStats::ErrorCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(InstanceUsageStats::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_usage_stats_instance_agent_date_unique")
                    .table(InstanceUsageStats::Table)
                    .col(InstanceUsageStats::InstanceId)
                    .col(InstanceUsageStats::AgentType)
                    .col(InstanceUsageStats::Date)
                    .unique()
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(InstanceUsageStats::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum InstanceUsageStats {
    Table,
    Id,
    InstanceId,
    AgentType,
    Date,
    RequestCount,
    TokenCount,
    ErrorCount,
    UpdatedAt,
}
