use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Instances::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Instances::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Instances::Name).string().not_null())
                    .col(ColumnDef::new(Instances::Description).text().null())
                    .col(ColumnDef::new(Instances::Port).integer().not_null())
                    .col(ColumnDef::new(Instances::DataDir).string().not_null())
                    .col(
                        ColumnDef::new(Instances::Status)
                            .string()
                            .not_null()
                            .default("stopped"),
                    )
                    .col(
                        ColumnDef::new(Instances::Health)
                            .string()
                            .not_null()
                            .default("unknown"),
                    )
                    .col(
                        ColumnDef::new(Instances::AutoStart)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Instances::MaxUsers)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Instances::LastError).text().null())
                    .col(
                        ColumnDef::new(Instances::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Instances::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Instances::LastHealthCheck)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_instances_port_unique")
                    .table(Instances::Table)
                    .col(Instances::Port)
                    .unique()
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_instances_data_dir_unique")
                    .table(Instances::Table)
                    .col(Instances::DataDir)
                    .unique()
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_instances_status")
                    .table(Instances::Table)
                    .col(Instances::Status)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Instances::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Instances {
    Table,
    Id,
    Name,
    Description,
    Port,
    DataDir,
    Status,
    Health,
    AutoStart,
    MaxUsers,
    LastError,
    CreatedAt,
    UpdatedAt,
    LastHealthCheck,
}
