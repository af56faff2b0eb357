use sea_orm_migration::{prelude::*, schema::*};

use crate::id_column;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();

        manager
            .create_table(
                Table::create()
                    .table(JobExecutions::Table)
                    .if_not_exists()
                    .col(id_column(backend, JobExecutions::Id))
                    .col(string(JobExecutions::JobName))
                    .col(big_integer(JobExecutions::StartedAt))
                    .col(big_integer_null(JobExecutions::CompletedAt))
                    .col(big_integer_null(JobExecutions::Success))
                    .col(string_null(JobExecutions::ErrorMessage))
                    .col(big_integer_null(JobExecutions::RecordsProcessed))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_job_executions_started_at")
                    .table(JobExecutions::Table)
                    .col(JobExecutions::StartedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobExecutions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum JobExecutions {
    Table,
    Id,
    JobName,
    StartedAt,
    CompletedAt,
    Success,
    ErrorMessage,
    RecordsProcessed,
}
