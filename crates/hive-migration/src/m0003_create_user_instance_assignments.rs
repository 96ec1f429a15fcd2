use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(UserInstanceAssignments::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UserInstanceAssignments::UserId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UserInstanceAssignments::InstanceId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UserInstanceAssignments::AssignedBy)
                            .uuid()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(UserInstanceAssignments::AssignedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_user_instance_assignments")
                            .col(UserInstanceAssignments::UserId)
                            .col(UserInstanceAssignments::InstanceId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_assignments_user")
                            .from(
                                UserInstanceAssignments::Table,
                                UserInstanceAssignments::UserId,
                            )
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    // Instances with assignments cannot be deleted; enforced here as well.
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_assignments_instance")
                            .from(
                                UserInstanceAssignments::Table,
                                UserInstanceAssignments::InstanceId,
                            )
                            .to(Instances::Table, Instances::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_assignments_instance_id")
                    .table(UserInstanceAssignments::Table)
                    .col(UserInstanceAssignments::InstanceId)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(UserInstanceAssignments::Table)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum UserInstanceAssignments {
    Table,
    UserId,
    InstanceId,
    AssignedBy,
    AssignedAt,
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
}

#[derive(DeriveIden)]
enum Instances {
    Table,
    Id,
}
