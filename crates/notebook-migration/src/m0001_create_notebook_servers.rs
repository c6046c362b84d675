use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(NotebookServers::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(NotebookServers::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(NotebookServers::Project).string().not_null())
                    .col(ColumnDef::new(NotebookServers::Owner).string().not_null())
                    .col(ColumnDef::new(NotebookServers::Port).integer().not_null())
                    .col(ColumnDef::new(NotebookServers::Token).string().not_null())
                    .col(ColumnDef::new(NotebookServers::Pid).big_integer().not_null())
                    .col(ColumnDef::new(NotebookServers::Resources).json().not_null())
                    .col(
                        ColumnDef::new(NotebookServers::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // One server per (project, owner). The controller serializes per key,
        // this index catches a second controller instance racing on the same key.
        manager
            .create_index(
                Index::create()
                    .name("idx_notebook_servers_project_owner_unique")
                    .table(NotebookServers::Table)
                    .col(NotebookServers::Project)
                    .col(NotebookServers::Owner)
                    .unique()
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(NotebookServers::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum NotebookServers {
    Table,
    Id,
    Project,
    Owner,
    Port,
    Token,
    Pid,
    Resources,
    CreatedAt,
}
