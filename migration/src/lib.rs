pub use sea_orm_migration::prelude::*;

mod m20250101_000001_initial_schema;
mod m20250102_000001_add_policy_rules;
mod m20250103_000001_add_job_executions;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_initial_schema::Migration),
            Box::new(m20250102_000001_add_policy_rules::Migration),
            Box::new(m20250103_000001_add_job_executions::Migration),
        ]
    }
}

/// Auto-increment primary key that stays `INTEGER` on SQLite so rowid
/// aliasing keeps working, and `BIGINT` elsewhere.
pub(crate) fn id_column<T: IntoIden>(backend: sea_orm::DatabaseBackend, iden: T) -> ColumnDef {
    match backend {
        sea_orm::DatabaseBackend::Sqlite => ColumnDef::new(iden)
            .integer()
            .not_null()
            .auto_increment()
            .primary_key()
            .to_owned(),
        _ => ColumnDef::new(iden)
            .big_integer()
            .not_null()
            .auto_increment()
            .primary_key()
            .to_owned(),
    }
}
