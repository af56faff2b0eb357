use sea_orm_migration::{prelude::*, schema::*};

use crate::id_column;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();

        // Enable foreign keys for SQLite
        if backend == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        // users
        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(id_column(backend, Users::Id))
                    .col(
                        ColumnDef::new(Users::Username)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Users::Enabled)
                            .big_integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(Users::Deleted)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(big_integer(Users::CreatedAt))
                    .col(big_integer(Users::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        // roles: name/code uniqueness is enforced among live rows only, so
        // there is no unique index here
        manager
            .create_table(
                Table::create()
                    .table(Roles::Table)
                    .if_not_exists()
                    .col(id_column(backend, Roles::Id))
                    .col(string(Roles::Name))
                    .col(string(Roles::Code))
                    .col(string_null(Roles::Description))
                    .col(
                        ColumnDef::new(Roles::IsSystem)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Roles::Enabled)
                            .big_integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(Roles::Deleted)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(big_integer(Roles::CreatedAt))
                    .col(big_integer(Roles::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_roles_name")
                    .table(Roles::Table)
                    .col(Roles::Name)
                    .to_owned(),
            )
            .await?;

        // apis
        manager
            .create_table(
                Table::create()
                    .table(Apis::Table)
                    .if_not_exists()
                    .col(id_column(backend, Apis::Id))
                    .col(string(Apis::Path))
                    .col(integer(Apis::Method))
                    .col(string(Apis::Name))
                    .col(string_null(Apis::Description))
                    .col(
                        ColumnDef::new(Apis::IsPublic)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Apis::Deleted)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(big_integer(Apis::CreatedAt))
                    .col(big_integer(Apis::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_apis_path_method")
                    .table(Apis::Table)
                    .col(Apis::Path)
                    .col(Apis::Method)
                    .to_owned(),
            )
            .await?;

        // role_apis
        manager
            .create_table(
                Table::create()
                    .table(RoleApis::Table)
                    .if_not_exists()
                    .col(id_column(backend, RoleApis::Id))
                    .col(big_integer(RoleApis::RoleId))
                    .col(big_integer(RoleApis::ApiId))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_role_apis_role")
                            .from(RoleApis::Table, RoleApis::RoleId)
                            .to(Roles::Table, Roles::Id),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_role_apis_api")
                            .from(RoleApis::Table, RoleApis::ApiId)
                            .to(Apis::Table, Apis::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_role_apis_unique")
                    .table(RoleApis::Table)
                    .col(RoleApis::RoleId)
                    .col(RoleApis::ApiId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // user_roles
        manager
            .create_table(
                Table::create()
                    .table(UserRoles::Table)
                    .if_not_exists()
                    .col(id_column(backend, UserRoles::Id))
                    .col(big_integer(UserRoles::UserId))
                    .col(big_integer(UserRoles::RoleId))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_roles_user")
                            .from(UserRoles::Table, UserRoles::UserId)
                            .to(Users::Table, Users::Id),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_roles_role")
                            .from(UserRoles::Table, UserRoles::RoleId)
                            .to(Roles::Table, Roles::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_user_roles_unique")
                    .table(UserRoles::Table)
                    .col(UserRoles::UserId)
                    .col(UserRoles::RoleId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // user_apis (direct grants)
        manager
            .create_table(
                Table::create()
                    .table(UserApis::Table)
                    .if_not_exists()
                    .col(id_column(backend, UserApis::Id))
                    .col(big_integer(UserApis::UserId))
                    .col(big_integer(UserApis::ApiId))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_apis_user")
                            .from(UserApis::Table, UserApis::UserId)
                            .to(Users::Table, Users::Id),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_apis_api")
                            .from(UserApis::Table, UserApis::ApiId)
                            .to(Apis::Table, Apis::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_user_apis_unique")
                    .table(UserApis::Table)
                    .col(UserApis::UserId)
                    .col(UserApis::ApiId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(UserApis::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(UserRoles::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RoleApis::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Apis::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Roles::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
    Username,
    Enabled,
    Deleted,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Roles {
    Table,
    Id,
    Name,
    Code,
    Description,
    IsSystem,
    Enabled,
    Deleted,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Apis {
    Table,
    Id,
    Path,
    Method,
    Name,
    Description,
    IsPublic,
    Deleted,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum RoleApis {
    Table,
    Id,
    RoleId,
    ApiId,
}

#[derive(DeriveIden)]
enum UserRoles {
    Table,
    Id,
    UserId,
    RoleId,
}

#[derive(DeriveIden)]
enum UserApis {
    Table,
    Id,
    UserId,
    ApiId,
}
