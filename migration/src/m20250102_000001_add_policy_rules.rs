use sea_orm_migration::{prelude::*, schema::*};

use crate::id_column;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();

        // Flat policy rows: ptype "p" is (subject, object, action),
        // ptype "g" is (user, role). Unused value columns hold "".
        manager
            .create_table(
                Table::create()
                    .table(PolicyRules::Table)
                    .if_not_exists()
                    .col(id_column(backend, PolicyRules::Id))
                    .col(string(PolicyRules::Ptype))
                    .col(string(PolicyRules::V0))
                    .col(string(PolicyRules::V1))
                    .col(ColumnDef::new(PolicyRules::V2).string().not_null().default(""))
                    .col(ColumnDef::new(PolicyRules::V3).string().not_null().default(""))
                    .col(ColumnDef::new(PolicyRules::V4).string().not_null().default(""))
                    .col(ColumnDef::new(PolicyRules::V5).string().not_null().default(""))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_policy_rules_unique")
                    .table(PolicyRules::Table)
                    .col(PolicyRules::Ptype)
                    .col(PolicyRules::V0)
                    .col(PolicyRules::V1)
                    .col(PolicyRules::V2)
                    .col(PolicyRules::V3)
                    .col(PolicyRules::V4)
                    .col(PolicyRules::V5)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Subject lookups drive every filtered removal
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_policy_rules_subject")
                    .table(PolicyRules::Table)
                    .col(PolicyRules::Ptype)
                    .col(PolicyRules::V0)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PolicyRules::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PolicyRules {
    Table,
    Id,
    Ptype,
    V0,
    V1,
    V2,
    V3,
    V4,
    V5,
}
