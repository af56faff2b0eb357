//! Relational side of the engine: Users, Roles, Apis and their join tables.
//!
//! Multi-row mutations run inside a single transaction and validate every
//! referenced id before touching anything. Functions that change what a
//! subject is granted return the subject's full derived policy set as of
//! commit; pushing that set into the policy store is the caller's job (see
//! `authz::sync`).

use std::collections::{BTreeSet, HashSet};

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    IntoActiveModel, PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use serde::{Deserialize, Serialize};

use crate::authz::matcher;
use crate::authz::types::{user_subject, GroupingRule, HttpMethod, PolicyRule, GLOBAL_WILDCARD};
use crate::entities::{api, role, role_api, user, user_api, user_role};
use crate::errors::PortcullisError;
use crate::settings::Database as DbCfg;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRole {
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub is_system: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleUpdate {
    pub name: Option<String>,
    pub code: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewApi {
    pub path: String,
    pub method: i32,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiUpdate {
    pub path: Option<String>,
    pub method: Option<i32>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_public: Option<bool>,
}

fn default_true() -> bool {
    true
}

fn flag(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

/// Sorted, de-duplicated ids.
fn unique_ids(ids: &[i64]) -> Vec<i64> {
    ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect()
}

fn missing_ids(wanted: &[i64], found: impl Iterator<Item = i64>) -> Vec<i64> {
    let found: HashSet<i64> = found.collect();
    wanted.iter().copied().filter(|id| !found.contains(id)).collect()
}

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, PortcullisError> {
    let db = Database::connect(&cfg.url).await?;
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

// User management functions

pub async fn create_user(
    db: &DatabaseConnection,
    username: &str,
) -> Result<user::Model, PortcullisError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(PortcullisError::Validation("username is required".into()));
    }
    if user::Entity::find()
        .filter(user::Column::Username.eq(username))
        .one(db)
        .await?
        .is_some()
    {
        return Err(PortcullisError::Conflict(format!(
            "username `{username}` already exists"
        )));
    }

    let now = Utc::now().timestamp();
    let user = user::ActiveModel {
        username: Set(username.to_string()),
        enabled: Set(1),
        deleted: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    Ok(user.insert(db).await?)
}

/// Live (non-deleted) user by id.
pub async fn get_user<C: ConnectionTrait>(
    conn: &C,
    user_id: i64,
) -> Result<Option<user::Model>, PortcullisError> {
    Ok(user::Entity::find_by_id(user_id)
        .filter(user::Column::Deleted.eq(0))
        .one(conn)
        .await?)
}

async fn require_user<C: ConnectionTrait>(
    conn: &C,
    user_id: i64,
) -> Result<user::Model, PortcullisError> {
    get_user(conn, user_id)
        .await?
        .ok_or_else(|| PortcullisError::NotFound(format!("user {user_id}")))
}

pub async fn list_users(db: &DatabaseConnection) -> Result<Vec<user::Model>, PortcullisError> {
    Ok(user::Entity::find()
        .filter(user::Column::Deleted.eq(0))
        .order_by_asc(user::Column::Id)
        .all(db)
        .await?)
}

pub async fn set_user_enabled(
    db: &DatabaseConnection,
    user_id: i64,
    enabled: bool,
) -> Result<user::Model, PortcullisError> {
    let user = require_user(db, user_id).await?;
    let mut active = user.into_active_model();
    active.enabled = Set(flag(enabled));
    active.updated_at = Set(Utc::now().timestamp());
    Ok(active.update(db).await?)
}

/// Soft-delete a user and clear every role and api association.
pub async fn delete_user(
    db: &DatabaseConnection,
    user_id: i64,
) -> Result<user::Model, PortcullisError> {
    let txn = db.begin().await?;
    let user = require_user(&txn, user_id).await?;

    user_role::Entity::delete_many()
        .filter(user_role::Column::UserId.eq(user_id))
        .exec(&txn)
        .await?;
    user_api::Entity::delete_many()
        .filter(user_api::Column::UserId.eq(user_id))
        .exec(&txn)
        .await?;

    let mut active = user.into_active_model();
    active.deleted = Set(1);
    active.updated_at = Set(Utc::now().timestamp());
    let user = active.update(&txn).await?;

    txn.commit().await?;
    Ok(user)
}

// Role management functions

fn validate_role_fields(name: &str, code: &str) -> Result<(), PortcullisError> {
    if name.is_empty() || code.is_empty() {
        return Err(PortcullisError::Validation(
            "role name and code are required".into(),
        ));
    }
    // numeric names would collide with user subjects in the policy store
    if name.chars().all(|c| c.is_ascii_digit()) {
        return Err(PortcullisError::Validation(format!(
            "role name `{name}` must not be purely numeric"
        )));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(PortcullisError::Validation(format!(
            "role name `{name}` must not contain whitespace"
        )));
    }
    Ok(())
}

/// Name and code are unique among live roles.
async fn ensure_role_unique<C: ConnectionTrait>(
    conn: &C,
    name: &str,
    code: &str,
    exclude_id: Option<i64>,
) -> Result<(), PortcullisError> {
    let mut query = role::Entity::find()
        .filter(role::Column::Deleted.eq(0))
        .filter(
            sea_orm::Condition::any()
                .add(role::Column::Name.eq(name))
                .add(role::Column::Code.eq(code)),
        );
    if let Some(id) = exclude_id {
        query = query.filter(role::Column::Id.ne(id));
    }
    if query.count(conn).await? > 0 {
        return Err(PortcullisError::Conflict(
            "name or code already exists".into(),
        ));
    }
    Ok(())
}

pub async fn create_role(
    db: &DatabaseConnection,
    input: NewRole,
) -> Result<role::Model, PortcullisError> {
    let name = input.name.trim().to_string();
    let code = input.code.trim().to_string();
    validate_role_fields(&name, &code)?;

    let txn = db.begin().await?;
    ensure_role_unique(&txn, &name, &code, None).await?;

    let now = Utc::now().timestamp();
    let role = role::ActiveModel {
        name: Set(name),
        code: Set(code),
        description: Set(input.description),
        is_system: Set(flag(input.is_system)),
        enabled: Set(flag(input.enabled)),
        deleted: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    let role = role.insert(&txn).await?;
    txn.commit().await?;
    Ok(role)
}

/// Live role by id.
pub async fn get_role<C: ConnectionTrait>(
    conn: &C,
    role_id: i64,
) -> Result<Option<role::Model>, PortcullisError> {
    Ok(role::Entity::find_by_id(role_id)
        .filter(role::Column::Deleted.eq(0))
        .one(conn)
        .await?)
}

async fn require_role<C: ConnectionTrait>(
    conn: &C,
    role_id: i64,
) -> Result<role::Model, PortcullisError> {
    get_role(conn, role_id)
        .await?
        .ok_or_else(|| PortcullisError::NotFound(format!("role {role_id}")))
}

pub async fn get_role_by_name<C: ConnectionTrait>(
    conn: &C,
    name: &str,
) -> Result<Option<role::Model>, PortcullisError> {
    Ok(role::Entity::find()
        .filter(role::Column::Name.eq(name))
        .filter(role::Column::Deleted.eq(0))
        .one(conn)
        .await?)
}

pub async fn list_roles(db: &DatabaseConnection) -> Result<Vec<role::Model>, PortcullisError> {
    Ok(role::Entity::find()
        .filter(role::Column::Deleted.eq(0))
        .order_by_asc(role::Column::Id)
        .all(db)
        .await?)
}

fn ensure_not_system(role: &role::Model) -> Result<(), PortcullisError> {
    if role.is_system != 0 {
        return Err(PortcullisError::Protected(format!(
            "system role `{}` cannot be modified",
            role.name
        )));
    }
    Ok(())
}

/// Apply `update` to a role. Returns the role before and after the change so
/// the caller can detect a rename.
pub async fn update_role(
    db: &DatabaseConnection,
    role_id: i64,
    update: RoleUpdate,
) -> Result<(role::Model, role::Model), PortcullisError> {
    let txn = db.begin().await?;
    let before = require_role(&txn, role_id).await?;
    ensure_not_system(&before)?;

    let name = update
        .name
        .map(|n| n.trim().to_string())
        .unwrap_or_else(|| before.name.clone());
    let code = update
        .code
        .map(|c| c.trim().to_string())
        .unwrap_or_else(|| before.code.clone());
    validate_role_fields(&name, &code)?;
    ensure_role_unique(&txn, &name, &code, Some(role_id)).await?;

    let mut active = before.clone().into_active_model();
    active.name = Set(name);
    active.code = Set(code);
    if let Some(description) = update.description {
        active.description = Set(Some(description));
    }
    if let Some(enabled) = update.enabled {
        active.enabled = Set(flag(enabled));
    }
    active.updated_at = Set(Utc::now().timestamp());
    let after = active.update(&txn).await?;

    txn.commit().await?;
    Ok((before, after))
}

/// Soft-delete a role. Fails for system roles and roles that still have
/// members.
pub async fn delete_role(
    db: &DatabaseConnection,
    role_id: i64,
) -> Result<role::Model, PortcullisError> {
    let txn = db.begin().await?;
    let role = require_role(&txn, role_id).await?;
    ensure_not_system(&role)?;

    let members = user_role::Entity::find()
        .filter(user_role::Column::RoleId.eq(role_id))
        .count(&txn)
        .await?;
    if members > 0 {
        return Err(PortcullisError::Protected(format!(
            "role `{}` still has {members} member(s)",
            role.name
        )));
    }

    role_api::Entity::delete_many()
        .filter(role_api::Column::RoleId.eq(role_id))
        .exec(&txn)
        .await?;

    let mut active = role.into_active_model();
    active.deleted = Set(1);
    active.updated_at = Set(Utc::now().timestamp());
    let role = active.update(&txn).await?;

    txn.commit().await?;
    Ok(role)
}

// Api management functions

fn validate_api_fields(path: &str, method: i32, name: &str) -> Result<(), PortcullisError> {
    matcher::validate_pattern(path)?;
    HttpMethod::try_from_code(method)?;
    if name.trim().is_empty() {
        return Err(PortcullisError::Validation("api name is required".into()));
    }
    Ok(())
}

async fn ensure_api_unique<C: ConnectionTrait>(
    conn: &C,
    path: &str,
    method: i32,
    exclude_id: Option<i64>,
) -> Result<(), PortcullisError> {
    let mut query = api::Entity::find()
        .filter(api::Column::Deleted.eq(0))
        .filter(api::Column::Path.eq(path))
        .filter(api::Column::Method.eq(method));
    if let Some(id) = exclude_id {
        query = query.filter(api::Column::Id.ne(id));
    }
    if query.count(conn).await? > 0 {
        return Err(PortcullisError::Conflict(format!(
            "api {} {path} already exists",
            HttpMethod::try_from_code(method)?
        )));
    }
    Ok(())
}

pub async fn create_api(
    db: &DatabaseConnection,
    input: NewApi,
) -> Result<api::Model, PortcullisError> {
    validate_api_fields(&input.path, input.method, &input.name)?;

    let txn = db.begin().await?;
    ensure_api_unique(&txn, &input.path, input.method, None).await?;

    let now = Utc::now().timestamp();
    let api = api::ActiveModel {
        path: Set(input.path),
        method: Set(input.method),
        name: Set(input.name.trim().to_string()),
        description: Set(input.description),
        is_public: Set(flag(input.is_public)),
        deleted: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    let api = api.insert(&txn).await?;
    txn.commit().await?;
    Ok(api)
}

pub async fn get_api<C: ConnectionTrait>(
    conn: &C,
    api_id: i64,
) -> Result<Option<api::Model>, PortcullisError> {
    Ok(api::Entity::find_by_id(api_id)
        .filter(api::Column::Deleted.eq(0))
        .one(conn)
        .await?)
}

async fn require_api<C: ConnectionTrait>(
    conn: &C,
    api_id: i64,
) -> Result<api::Model, PortcullisError> {
    get_api(conn, api_id)
        .await?
        .ok_or_else(|| PortcullisError::NotFound(format!("api {api_id}")))
}

pub async fn list_apis(db: &DatabaseConnection) -> Result<Vec<api::Model>, PortcullisError> {
    Ok(api::Entity::find()
        .filter(api::Column::Deleted.eq(0))
        .order_by_asc(api::Column::Id)
        .all(db)
        .await?)
}

/// Apis the routing layer lets through without a permission check.
pub async fn list_public_apis(db: &DatabaseConnection) -> Result<Vec<api::Model>, PortcullisError> {
    Ok(api::Entity::find()
        .filter(api::Column::Deleted.eq(0))
        .filter(api::Column::IsPublic.eq(1))
        .order_by_asc(api::Column::Id)
        .all(db)
        .await?)
}

/// Apis linked to a system role carry that role's grants and stay as they
/// are.
async fn ensure_not_system_grant<C: ConnectionTrait>(
    conn: &C,
    api_id: i64,
) -> Result<(), PortcullisError> {
    let role_ids: Vec<i64> = role_api::Entity::find()
        .filter(role_api::Column::ApiId.eq(api_id))
        .all(conn)
        .await?
        .into_iter()
        .map(|r| r.role_id)
        .collect();
    if role_ids.is_empty() {
        return Ok(());
    }
    let system_holders = role::Entity::find()
        .filter(role::Column::Id.is_in(role_ids))
        .filter(role::Column::IsSystem.eq(1))
        .filter(role::Column::Deleted.eq(0))
        .count(conn)
        .await?;
    if system_holders > 0 {
        return Err(PortcullisError::Protected(format!(
            "api {api_id} is granted to a system role"
        )));
    }
    Ok(())
}

/// Apply `update` to an api. Returns the row before and after so the caller
/// can migrate triples when `(path, method)` changed.
pub async fn update_api(
    db: &DatabaseConnection,
    api_id: i64,
    update: ApiUpdate,
) -> Result<(api::Model, api::Model), PortcullisError> {
    let txn = db.begin().await?;
    let before = require_api(&txn, api_id).await?;
    ensure_not_system_grant(&txn, api_id).await?;

    let path = update.path.unwrap_or_else(|| before.path.clone());
    let method = update.method.unwrap_or(before.method);
    let name = update.name.unwrap_or_else(|| before.name.clone());
    validate_api_fields(&path, method, &name)?;
    if path != before.path || method != before.method {
        ensure_api_unique(&txn, &path, method, Some(api_id)).await?;
    }

    let mut active = before.clone().into_active_model();
    active.path = Set(path);
    active.method = Set(method);
    active.name = Set(name.trim().to_string());
    if let Some(description) = update.description {
        active.description = Set(Some(description));
    }
    if let Some(is_public) = update.is_public {
        active.is_public = Set(flag(is_public));
    }
    active.updated_at = Set(Utc::now().timestamp());
    let after = active.update(&txn).await?;

    txn.commit().await?;
    Ok((before, after))
}

/// Soft-delete an api and drop every role and user association with it.
pub async fn delete_api(
    db: &DatabaseConnection,
    api_id: i64,
) -> Result<api::Model, PortcullisError> {
    let txn = db.begin().await?;
    let api = require_api(&txn, api_id).await?;
    ensure_not_system_grant(&txn, api_id).await?;

    role_api::Entity::delete_many()
        .filter(role_api::Column::ApiId.eq(api_id))
        .exec(&txn)
        .await?;
    user_api::Entity::delete_many()
        .filter(user_api::Column::ApiId.eq(api_id))
        .exec(&txn)
        .await?;

    let mut active = api.into_active_model();
    active.deleted = Set(1);
    active.updated_at = Set(Utc::now().timestamp());
    let api = active.update(&txn).await?;

    txn.commit().await?;
    Ok(api)
}

/// Role ids holding a given api; their triples reference its path.
pub async fn roles_with_api(
    db: &DatabaseConnection,
    api_id: i64,
) -> Result<Vec<role::Model>, PortcullisError> {
    let role_ids: Vec<i64> = role_api::Entity::find()
        .filter(role_api::Column::ApiId.eq(api_id))
        .all(db)
        .await?
        .into_iter()
        .map(|r| r.role_id)
        .collect();
    if role_ids.is_empty() {
        return Ok(Vec::new());
    }
    Ok(role::Entity::find()
        .filter(role::Column::Id.is_in(role_ids))
        .filter(role::Column::Deleted.eq(0))
        .all(db)
        .await?)
}

/// Users holding a direct grant on a given api.
pub async fn users_with_api(
    db: &DatabaseConnection,
    api_id: i64,
) -> Result<Vec<i64>, PortcullisError> {
    Ok(user_api::Entity::find()
        .filter(user_api::Column::ApiId.eq(api_id))
        .order_by_asc(user_api::Column::UserId)
        .all(db)
        .await?
        .into_iter()
        .map(|r| r.user_id)
        .collect())
}

/// Make sure the system super-admin role exists with a `/*` api for every
/// method, and that `user_id` exists and is a member of it. Idempotent.
pub async fn ensure_super_admin(
    db: &DatabaseConnection,
    user_id: i64,
    role_name: &str,
) -> Result<(role::Model, user::Model), PortcullisError> {
    let txn = db.begin().await?;
    let now = Utc::now().timestamp();

    let role = match get_role_by_name(&txn, role_name).await? {
        Some(role) => role,
        None => {
            tracing::info!(role = %role_name, "Creating system super-admin role");
            role::ActiveModel {
                name: Set(role_name.to_string()),
                code: Set(role_name.to_string()),
                description: Set(Some("Super administrator".to_string())),
                is_system: Set(1),
                enabled: Set(1),
                deleted: Set(0),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            }
            .insert(&txn)
            .await?
        }
    };

    for method in HttpMethod::ALL {
        let existing = api::Entity::find()
            .filter(api::Column::Path.eq(GLOBAL_WILDCARD))
            .filter(api::Column::Method.eq(method.code()))
            .filter(api::Column::Deleted.eq(0))
            .one(&txn)
            .await?;
        let api = match existing {
            Some(api) => api,
            None => {
                api::ActiveModel {
                    path: Set(GLOBAL_WILDCARD.to_string()),
                    method: Set(method.code()),
                    name: Set(format!("all {method}")),
                    description: Set(None),
                    is_public: Set(0),
                    deleted: Set(0),
                    created_at: Set(now),
                    updated_at: Set(now),
                    ..Default::default()
                }
                .insert(&txn)
                .await?
            }
        };
        let linked = role_api::Entity::find()
            .filter(role_api::Column::RoleId.eq(role.id))
            .filter(role_api::Column::ApiId.eq(api.id))
            .count(&txn)
            .await?;
        if linked == 0 {
            role_api::ActiveModel {
                role_id: Set(role.id),
                api_id: Set(api.id),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
        }
    }

    let user = match user::Entity::find_by_id(user_id).one(&txn).await? {
        Some(user) if user.deleted == 0 => user,
        Some(user) => {
            tracing::warn!(user_id, "Restoring deleted super-admin user");
            let mut active = user.into_active_model();
            active.deleted = Set(0);
            active.enabled = Set(1);
            active.updated_at = Set(now);
            active.update(&txn).await?
        }
        None => {
            tracing::info!(user_id, "Creating super-admin user");
            user::Entity::insert(user::ActiveModel {
                id: Set(user_id),
                username: Set(role_name.to_string()),
                enabled: Set(1),
                deleted: Set(0),
                created_at: Set(now),
                updated_at: Set(now),
            })
            .exec(&txn)
            .await?;
            require_user(&txn, user_id).await?
        }
    };

    let member = user_role::Entity::find()
        .filter(user_role::Column::UserId.eq(user_id))
        .filter(user_role::Column::RoleId.eq(role.id))
        .count(&txn)
        .await?;
    if member == 0 {
        user_role::ActiveModel {
            user_id: Set(user_id),
            role_id: Set(role.id),
            ..Default::default()
        }
        .insert(&txn)
        .await?;
    }

    txn.commit().await?;
    Ok((role, user))
}

// Bulk resolution

/// Resolve every id to a live api, or fail naming the ones that did not.
async fn resolve_apis<C: ConnectionTrait>(
    conn: &C,
    api_ids: &[i64],
) -> Result<Vec<api::Model>, PortcullisError> {
    let wanted = unique_ids(api_ids);
    if wanted.is_empty() {
        return Ok(Vec::new());
    }
    let rows = api::Entity::find()
        .filter(api::Column::Id.is_in(wanted.clone()))
        .filter(api::Column::Deleted.eq(0))
        .order_by_asc(api::Column::Id)
        .all(conn)
        .await?;
    if rows.len() != wanted.len() {
        let missing = missing_ids(&wanted, rows.iter().map(|r| r.id));
        return Err(PortcullisError::NotFound(format!("api ids {missing:?}")));
    }
    Ok(rows)
}

async fn resolve_roles<C: ConnectionTrait>(
    conn: &C,
    role_ids: &[i64],
) -> Result<Vec<role::Model>, PortcullisError> {
    let wanted = unique_ids(role_ids);
    if wanted.is_empty() {
        return Ok(Vec::new());
    }
    let rows = role::Entity::find()
        .filter(role::Column::Id.is_in(wanted.clone()))
        .filter(role::Column::Deleted.eq(0))
        .order_by_asc(role::Column::Id)
        .all(conn)
        .await?;
    if rows.len() != wanted.len() {
        let missing = missing_ids(&wanted, rows.iter().map(|r| r.id));
        return Err(PortcullisError::NotFound(format!("role ids {missing:?}")));
    }
    Ok(rows)
}

/// Triples `subject` gets from `apis`. Any unknown method code fails the
/// whole batch.
fn policies_for_apis(subject: &str, apis: &[api::Model]) -> Result<Vec<PolicyRule>, PortcullisError> {
    apis.iter()
        .map(|api| {
            let method = HttpMethod::try_from_code(api.method)?;
            Ok(PolicyRule::new(subject, api.path.clone(), method.as_str()))
        })
        .collect()
}

// Derivation: the relational rows are the source of truth, these compute
// what the policy store must hold for one subject.

pub async fn derive_role_policies<C: ConnectionTrait>(
    conn: &C,
    role: &role::Model,
) -> Result<Vec<PolicyRule>, PortcullisError> {
    let api_ids: Vec<i64> = role_api::Entity::find()
        .filter(role_api::Column::RoleId.eq(role.id))
        .all(conn)
        .await?
        .into_iter()
        .map(|r| r.api_id)
        .collect();
    let apis = live_apis(conn, &api_ids).await?;
    policies_for_apis(&role.name, &apis)
}

pub async fn derive_user_policies<C: ConnectionTrait>(
    conn: &C,
    user_id: i64,
) -> Result<Vec<PolicyRule>, PortcullisError> {
    let api_ids: Vec<i64> = user_api::Entity::find()
        .filter(user_api::Column::UserId.eq(user_id))
        .all(conn)
        .await?
        .into_iter()
        .map(|r| r.api_id)
        .collect();
    let apis = live_apis(conn, &api_ids).await?;
    policies_for_apis(&user_subject(user_id), &apis)
}

pub async fn derive_user_groupings<C: ConnectionTrait>(
    conn: &C,
    user_id: i64,
) -> Result<Vec<GroupingRule>, PortcullisError> {
    let roles = user_roles(conn, user_id).await?;
    let subject = user_subject(user_id);
    Ok(roles
        .into_iter()
        .map(|r| GroupingRule::new(subject.clone(), r.name))
        .collect())
}

/// Live roles the user is assigned, regardless of enabled status.
pub async fn user_roles<C: ConnectionTrait>(
    conn: &C,
    user_id: i64,
) -> Result<Vec<role::Model>, PortcullisError> {
    let role_ids: Vec<i64> = user_role::Entity::find()
        .filter(user_role::Column::UserId.eq(user_id))
        .all(conn)
        .await?
        .into_iter()
        .map(|r| r.role_id)
        .collect();
    if role_ids.is_empty() {
        return Ok(Vec::new());
    }
    Ok(role::Entity::find()
        .filter(role::Column::Id.is_in(role_ids))
        .filter(role::Column::Deleted.eq(0))
        .order_by_asc(role::Column::Id)
        .all(conn)
        .await?)
}

/// Live apis among `api_ids`; silently skips deleted ones.
async fn live_apis<C: ConnectionTrait>(
    conn: &C,
    api_ids: &[i64],
) -> Result<Vec<api::Model>, PortcullisError> {
    if api_ids.is_empty() {
        return Ok(Vec::new());
    }
    Ok(api::Entity::find()
        .filter(api::Column::Id.is_in(unique_ids(api_ids)))
        .filter(api::Column::Deleted.eq(0))
        .order_by_asc(api::Column::Id)
        .all(conn)
        .await?)
}

// Assignment functions

/// Replace a role's apis. Returns the role and its full derived triple set.
pub async fn assign_apis_to_role(
    db: &DatabaseConnection,
    role_id: i64,
    api_ids: &[i64],
) -> Result<(role::Model, Vec<PolicyRule>), PortcullisError> {
    let txn = db.begin().await?;
    let role = require_role(&txn, role_id).await?;
    ensure_not_system(&role)?;
    let apis = resolve_apis(&txn, api_ids).await?;
    // fail on unknown method codes before anything is written
    let policies = policies_for_apis(&role.name, &apis)?;

    role_api::Entity::delete_many()
        .filter(role_api::Column::RoleId.eq(role_id))
        .exec(&txn)
        .await?;
    if !apis.is_empty() {
        let rows = apis.iter().map(|api| role_api::ActiveModel {
            role_id: Set(role_id),
            api_id: Set(api.id),
            ..Default::default()
        });
        role_api::Entity::insert_many(rows).exec(&txn).await?;
    }

    txn.commit().await?;
    Ok((role, policies))
}

pub async fn revoke_apis_from_role(
    db: &DatabaseConnection,
    role_id: i64,
    api_ids: &[i64],
) -> Result<(role::Model, Vec<PolicyRule>), PortcullisError> {
    let txn = db.begin().await?;
    let role = require_role(&txn, role_id).await?;
    ensure_not_system(&role)?;
    let apis = resolve_apis(&txn, api_ids).await?;

    if !apis.is_empty() {
        role_api::Entity::delete_many()
            .filter(role_api::Column::RoleId.eq(role_id))
            .filter(role_api::Column::ApiId.is_in(apis.iter().map(|a| a.id)))
            .exec(&txn)
            .await?;
    }
    let policies = derive_role_policies(&txn, &role).await?;

    txn.commit().await?;
    Ok((role, policies))
}

/// Replace a user's roles. Returns the user's full grouping set.
pub async fn assign_roles_to_user(
    db: &DatabaseConnection,
    user_id: i64,
    role_ids: &[i64],
) -> Result<Vec<GroupingRule>, PortcullisError> {
    let txn = db.begin().await?;
    require_user(&txn, user_id).await?;
    let roles = resolve_roles(&txn, role_ids).await?;

    user_role::Entity::delete_many()
        .filter(user_role::Column::UserId.eq(user_id))
        .exec(&txn)
        .await?;
    if !roles.is_empty() {
        let rows = roles.iter().map(|role| user_role::ActiveModel {
            user_id: Set(user_id),
            role_id: Set(role.id),
            ..Default::default()
        });
        user_role::Entity::insert_many(rows).exec(&txn).await?;
    }

    let subject = user_subject(user_id);
    let groupings = roles
        .into_iter()
        .map(|r| GroupingRule::new(subject.clone(), r.name))
        .collect();
    txn.commit().await?;
    Ok(groupings)
}

pub async fn revoke_roles_from_user(
    db: &DatabaseConnection,
    user_id: i64,
    role_ids: &[i64],
) -> Result<Vec<GroupingRule>, PortcullisError> {
    let txn = db.begin().await?;
    require_user(&txn, user_id).await?;
    let roles = resolve_roles(&txn, role_ids).await?;

    if !roles.is_empty() {
        user_role::Entity::delete_many()
            .filter(user_role::Column::UserId.eq(user_id))
            .filter(user_role::Column::RoleId.is_in(roles.iter().map(|r| r.id)))
            .exec(&txn)
            .await?;
    }
    let groupings = derive_user_groupings(&txn, user_id).await?;

    txn.commit().await?;
    Ok(groupings)
}

/// Replace a user's direct api grants. Returns the user's full direct
/// triple set.
pub async fn assign_apis_to_user(
    db: &DatabaseConnection,
    user_id: i64,
    api_ids: &[i64],
) -> Result<Vec<PolicyRule>, PortcullisError> {
    let txn = db.begin().await?;
    require_user(&txn, user_id).await?;
    let apis = resolve_apis(&txn, api_ids).await?;
    let policies = policies_for_apis(&user_subject(user_id), &apis)?;

    user_api::Entity::delete_many()
        .filter(user_api::Column::UserId.eq(user_id))
        .exec(&txn)
        .await?;
    if !apis.is_empty() {
        let rows = apis.iter().map(|api| user_api::ActiveModel {
            user_id: Set(user_id),
            api_id: Set(api.id),
            ..Default::default()
        });
        user_api::Entity::insert_many(rows).exec(&txn).await?;
    }

    txn.commit().await?;
    Ok(policies)
}

pub async fn revoke_apis_from_user(
    db: &DatabaseConnection,
    user_id: i64,
    api_ids: &[i64],
) -> Result<Vec<PolicyRule>, PortcullisError> {
    let txn = db.begin().await?;
    require_user(&txn, user_id).await?;
    let apis = resolve_apis(&txn, api_ids).await?;

    if !apis.is_empty() {
        user_api::Entity::delete_many()
            .filter(user_api::Column::UserId.eq(user_id))
            .filter(user_api::Column::ApiId.is_in(apis.iter().map(|a| a.id)))
            .exec(&txn)
            .await?;
    }
    let policies = derive_user_policies(&txn, user_id).await?;

    txn.commit().await?;
    Ok(policies)
}


#[cfg(test)]
mod tests {
    use super::test_support::TestDb;
    use super::*;

    fn new_role(name: &str) -> NewRole {
        NewRole {
            name: name.to_string(),
            code: format!("{name}-code"),
            description: None,
            enabled: true,
            is_system: false,
        }
    }

    fn new_api(path: &str, method: i32) -> NewApi {
        NewApi {
            path: path.to_string(),
            method,
            name: format!("{method} {path}"),
            description: None,
            is_public: false,
        }
    }

    // ============================================================================
    // Role Operations Tests
    // ============================================================================

    #[tokio::test]
    async fn test_create_role_uniqueness() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        create_role(db, new_role("viewer")).await.expect("create");

        let dup_name = create_role(
            db,
            NewRole {
                code: "other".into(),
                ..new_role("viewer")
            },
        )
        .await;
        assert!(matches!(dup_name, Err(PortcullisError::Conflict(ref m)) if m == "name or code already exists"));

        let dup_code = create_role(
            db,
            NewRole {
                code: "viewer-code".into(),
                ..new_role("auditor")
            },
        )
        .await;
        assert!(matches!(dup_code, Err(PortcullisError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_name_reusable_after_soft_delete() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let role = create_role(db, new_role("temp")).await.unwrap();
        let deleted = delete_role(db, role.id).await.unwrap();
        assert_eq!(deleted.deleted, 1);
        assert!(get_role(db, role.id).await.unwrap().is_none());

        let again = create_role(db, new_role("temp")).await.unwrap();
        assert_ne!(again.id, role.id);
    }

    #[tokio::test]
    async fn test_role_name_validation() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        assert!(matches!(
            create_role(db, new_role("42")).await,
            Err(PortcullisError::Validation(_))
        ));
        assert!(matches!(
            create_role(db, new_role("")).await,
            Err(PortcullisError::Validation(_))
        ));
        assert!(matches!(
            create_role(db, new_role("two words")).await,
            Err(PortcullisError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_system_role_is_protected() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let role = create_role(
            db,
            NewRole {
                is_system: true,
                ..new_role("admin")
            },
        )
        .await
        .unwrap();

        assert!(matches!(
            update_role(db, role.id, RoleUpdate { name: Some("root".into()), ..Default::default() }).await,
            Err(PortcullisError::Protected(_))
        ));
        assert!(matches!(
            delete_role(db, role.id).await,
            Err(PortcullisError::Protected(_))
        ));
        assert!(matches!(
            assign_apis_to_role(db, role.id, &[]).await,
            Err(PortcullisError::Protected(_))
        ));
    }

    #[tokio::test]
    async fn test_super_admin_apis_are_protected() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (admin, _) = ensure_super_admin(db, 1, "admin").await.unwrap();

        let wildcard = api::Entity::find()
            .filter(api::Column::Path.eq("/*"))
            .filter(api::Column::Method.eq(1))
            .one(db)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(
            update_api(
                db,
                wildcard.id,
                ApiUpdate {
                    path: Some("/x".into()),
                    ..Default::default()
                }
            )
            .await,
            Err(PortcullisError::Protected(_))
        ));
        assert!(matches!(
            delete_api(db, wildcard.id).await,
            Err(PortcullisError::Protected(_))
        ));

        let still = require_api(db, wildcard.id).await.unwrap();
        assert_eq!(still.path, "/*");
        assert_eq!(derive_role_policies(db, &admin).await.unwrap().len(), 7);

        // an ordinary api is still editable
        let plain = create_api(db, new_api("/plain", 1)).await.unwrap();
        assert!(delete_api(db, plain.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_role_with_members_fails() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let role = create_role(db, new_role("viewer")).await.unwrap();
        let user = create_user(db, "alice").await.unwrap();
        assign_roles_to_user(db, user.id, &[role.id]).await.unwrap();

        assert!(matches!(
            delete_role(db, role.id).await,
            Err(PortcullisError::Protected(_))
        ));

        revoke_roles_from_user(db, user.id, &[role.id]).await.unwrap();
        delete_role(db, role.id).await.expect("delete after revoke");
    }

    // ============================================================================
    // Api Operations Tests
    // ============================================================================

    #[tokio::test]
    async fn test_create_api_validation() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        create_api(db, new_api("/api/reports/*", 1)).await.expect("valid api");

        assert!(matches!(
            create_api(db, new_api("/api/reports/*", 1)).await,
            Err(PortcullisError::Conflict(_))
        ));
        // same path, different method is a different api
        create_api(db, new_api("/api/reports/*", 4)).await.expect("DELETE variant");

        assert!(matches!(
            create_api(db, new_api("/api/x", 9)).await,
            Err(PortcullisError::Authz(_))
        ));
        assert!(matches!(
            create_api(db, new_api("/api/*/x/*", 1)).await,
            Err(PortcullisError::Authz(_))
        ));
    }

    #[tokio::test]
    async fn test_list_public_apis() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        create_api(
            db,
            NewApi {
                is_public: true,
                ..new_api("/health", 1)
            },
        )
        .await
        .unwrap();
        create_api(db, new_api("/api/secret", 1)).await.unwrap();

        let public = list_public_apis(db).await.unwrap();
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].path, "/health");
    }

    // ============================================================================
    // Assignment Tests
    // ============================================================================

    #[tokio::test]
    async fn test_assign_apis_to_role_replaces() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let role = create_role(db, new_role("viewer")).await.unwrap();
        let a = create_api(db, new_api("/a", 1)).await.unwrap();
        let b = create_api(db, new_api("/b", 2)).await.unwrap();
        let c = create_api(db, new_api("/c/*", 4)).await.unwrap();

        let (_, first) = assign_apis_to_role(db, role.id, &[a.id, b.id]).await.unwrap();
        assert_eq!(first.len(), 2);

        let (_, second) = assign_apis_to_role(db, role.id, &[b.id, c.id, c.id])
            .await
            .unwrap();
        assert_eq!(
            second,
            vec![
                PolicyRule::new("viewer", "/b", "POST"),
                PolicyRule::new("viewer", "/c/*", "DELETE"),
            ]
        );
        assert_eq!(derive_role_policies(db, &role).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_assign_with_missing_id_changes_nothing() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let role = create_role(db, new_role("viewer")).await.unwrap();
        let a = create_api(db, new_api("/a", 1)).await.unwrap();
        assign_apis_to_role(db, role.id, &[a.id]).await.unwrap();

        let err = assign_apis_to_role(db, role.id, &[a.id, 999]).await.unwrap_err();
        assert!(matches!(err, PortcullisError::NotFound(ref m) if m.contains("999")));
        assert_eq!(derive_role_policies(db, &role).await.unwrap().len(), 1);

        // deleted apis no longer resolve
        let b = create_api(db, new_api("/b", 1)).await.unwrap();
        delete_api(db, b.id).await.unwrap();
        assert!(matches!(
            assign_apis_to_role(db, role.id, &[b.id]).await,
            Err(PortcullisError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_assign_to_deleted_role_fails() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let role = create_role(db, new_role("gone")).await.unwrap();
        delete_role(db, role.id).await.unwrap();
        assert!(matches!(
            assign_apis_to_role(db, role.id, &[]).await,
            Err(PortcullisError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_user_role_replace_and_revoke() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let user = create_user(db, "bob").await.unwrap();
        let a = create_role(db, new_role("a")).await.unwrap();
        let b = create_role(db, new_role("b")).await.unwrap();
        let c = create_role(db, new_role("c")).await.unwrap();

        assign_roles_to_user(db, user.id, &[a.id, b.id]).await.unwrap();
        let groupings = assign_roles_to_user(db, user.id, &[b.id, c.id]).await.unwrap();
        let subject = user.id.to_string();
        assert_eq!(
            groupings,
            vec![GroupingRule::new(&subject, "b"), GroupingRule::new(&subject, "c")]
        );

        let remaining = revoke_roles_from_user(db, user.id, &[b.id]).await.unwrap();
        assert_eq!(remaining, vec![GroupingRule::new(&subject, "c")]);
        assert!(matches!(
            assign_roles_to_user(db, user.id, &[a.id, 404]).await,
            Err(PortcullisError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_user_direct_apis() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let user = create_user(db, "carol").await.unwrap();
        let a = create_api(db, new_api("/a", 1)).await.unwrap();
        let b = create_api(db, new_api("/b", 3)).await.unwrap();

        let granted = assign_apis_to_user(db, user.id, &[a.id, b.id]).await.unwrap();
        assert_eq!(granted.len(), 2);
        let remaining = revoke_apis_from_user(db, user.id, &[a.id]).await.unwrap();
        assert_eq!(
            remaining,
            vec![PolicyRule::new(user.id.to_string(), "/b", "PUT")]
        );
    }

    #[tokio::test]
    async fn test_delete_user_clears_associations() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let user = create_user(db, "dave").await.unwrap();
        let role = create_role(db, new_role("viewer")).await.unwrap();
        let api = create_api(db, new_api("/a", 1)).await.unwrap();
        assign_roles_to_user(db, user.id, &[role.id]).await.unwrap();
        assign_apis_to_user(db, user.id, &[api.id]).await.unwrap();

        delete_user(db, user.id).await.unwrap();

        assert!(get_user(db, user.id).await.unwrap().is_none());
        assert!(derive_user_groupings(db, user.id).await.unwrap().is_empty());
        assert!(derive_user_policies(db, user.id).await.unwrap().is_empty());
        let memberships = user_role::Entity::find()
            .filter(user_role::Column::RoleId.eq(role.id))
            .count(db)
            .await
            .unwrap();
        assert_eq!(memberships, 0);
    }

    #[tokio::test]
    async fn test_ensure_super_admin_is_idempotent() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let (role, user) = ensure_super_admin(db, 1, "admin").await.unwrap();
        assert_eq!(role.is_system, 1);
        assert_eq!(user.id, 1);

        let (again, _) = ensure_super_admin(db, 1, "admin").await.unwrap();
        assert_eq!(again.id, role.id);

        let policies = derive_role_policies(db, &role).await.unwrap();
        assert_eq!(policies.len(), HttpMethod::ALL.len());
        assert!(policies.iter().all(|p| p.object == GLOBAL_WILDCARD));
        assert_eq!(
            derive_user_groupings(db, 1).await.unwrap(),
            vec![GroupingRule::new("1", "admin")]
        );
    }
}
