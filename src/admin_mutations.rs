use async_graphql::*;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use std::sync::Arc;

use crate::authz::engine::AuthorizationChecker;
use crate::authz::sync::Synchronizer;
use crate::authz::types::{GroupingRule, HttpMethod, PolicyRule};
use crate::entities::{api, role, user};
use crate::errors::PortcullisError;
use crate::jobs;
use crate::storage::{self, ApiUpdate, NewApi, NewRole, RoleUpdate};

/// Caller identity attached to each admin request, recorded in audit events.
#[derive(Debug, Clone)]
pub struct AdminActor(pub String);

fn synchronizer<'a>(ctx: &Context<'a>) -> Result<&'a Arc<Synchronizer>> {
    ctx.data::<Arc<Synchronizer>>()
        .map_err(|_| Error::new("Synchronizer not available"))
}

fn actor(ctx: &Context<'_>) -> String {
    ctx.data_opt::<AdminActor>()
        .map(|a| a.0.clone())
        .unwrap_or_else(|| "admin-api".to_string())
}

/// Domain errors keep their message; store failures are logged and masked.
fn gql_err(err: PortcullisError) -> Error {
    let code = match &err {
        PortcullisError::Validation(_) | PortcullisError::Authz(_) => "VALIDATION",
        PortcullisError::NotFound(_) => "NOT_FOUND",
        PortcullisError::Conflict(_) => "CONFLICT",
        PortcullisError::Protected(_) => "PROTECTED",
        PortcullisError::Timeout(_) => "TIMEOUT",
        other => {
            tracing::error!(error = %other, "admin operation failed");
            "INTERNAL"
        }
    };
    Error::new(err.public_message()).extend_with(|_, e| e.set("code", code.to_string()))
}

// ---------- output types ----------

#[derive(SimpleObject)]
pub struct RoleObject {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    pub is_system: bool,
    pub enabled: bool,
}

impl From<role::Model> for RoleObject {
    fn from(m: role::Model) -> Self {
        Self {
            id: m.id,
            name: m.name,
            code: m.code,
            description: m.description,
            is_system: m.is_system != 0,
            enabled: m.enabled != 0,
        }
    }
}

#[derive(SimpleObject)]
pub struct ApiObject {
    pub id: i64,
    pub path: String,
    pub method_code: i32,
    /// Empty for codes outside the method table
    pub method: String,
    pub name: String,
    pub description: Option<String>,
    pub is_public: bool,
}

impl From<api::Model> for ApiObject {
    fn from(m: api::Model) -> Self {
        Self {
            id: m.id,
            method: HttpMethod::from_code(m.method)
                .map(|x| x.as_str().to_string())
                .unwrap_or_default(),
            method_code: m.method,
            path: m.path,
            name: m.name,
            description: m.description,
            is_public: m.is_public != 0,
        }
    }
}

#[derive(SimpleObject)]
pub struct UserObject {
    pub id: i64,
    pub username: String,
    pub enabled: bool,
}

impl From<user::Model> for UserObject {
    fn from(m: user::Model) -> Self {
        Self {
            id: m.id,
            username: m.username,
            enabled: m.enabled != 0,
        }
    }
}

#[derive(SimpleObject)]
pub struct PolicyObject {
    pub subject: String,
    pub object: String,
    pub action: String,
}

impl From<PolicyRule> for PolicyObject {
    fn from(r: PolicyRule) -> Self {
        Self {
            subject: r.subject,
            object: r.object,
            action: r.action,
        }
    }
}

#[derive(SimpleObject)]
pub struct GroupingObject {
    pub user: String,
    pub role: String,
}

impl From<GroupingRule> for GroupingObject {
    fn from(r: GroupingRule) -> Self {
        Self {
            user: r.user,
            role: r.role,
        }
    }
}

#[derive(SimpleObject)]
pub struct PermissionsObject {
    pub principal_id: i64,
    pub roles: Vec<String>,
    pub permissions: Vec<PolicyObject>,
}

#[derive(SimpleObject)]
pub struct StoreStatsObject {
    pub policies: i64,
    pub groupings: i64,
    pub loaded_at: i64,
}

#[derive(SimpleObject)]
pub struct DecisionObject {
    pub allowed: bool,
    pub reason: String,
}

// ---------- input types ----------

#[derive(InputObject)]
pub struct CreateRoleInput {
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(InputObject, Default)]
pub struct UpdateRoleInput {
    pub name: Option<String>,
    pub code: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(InputObject)]
pub struct CreateApiInput {
    pub path: String,
    /// 1=GET 2=POST 3=PUT 4=DELETE 5=PATCH 6=OPTIONS 7=HEAD
    pub method: i32,
    pub name: String,
    pub description: Option<String>,
    pub is_public: Option<bool>,
}

#[derive(InputObject, Default)]
pub struct UpdateApiInput {
    pub path: Option<String>,
    pub method: Option<i32>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_public: Option<bool>,
}

/// Custom mutations for admin operations
#[derive(Default)]
pub struct AdminMutation;

#[Object]
impl AdminMutation {
    async fn create_role(&self, ctx: &Context<'_>, input: CreateRoleInput) -> Result<RoleObject> {
        let sync = synchronizer(ctx)?;
        let role = sync
            .create_role(
                &actor(ctx),
                NewRole {
                    name: input.name,
                    code: input.code,
                    description: input.description,
                    enabled: input.enabled.unwrap_or(true),
                    is_system: false,
                },
            )
            .await
            .map_err(gql_err)?;
        Ok(role.into())
    }

    /// Renaming rewrites every policy and membership referencing the old name.
    async fn update_role(
        &self,
        ctx: &Context<'_>,
        id: i64,
        input: UpdateRoleInput,
    ) -> Result<RoleObject> {
        let sync = synchronizer(ctx)?;
        let update = RoleUpdate {
            name: input.name,
            code: input.code,
            description: input.description,
            enabled: input.enabled,
        };
        let role = sync
            .update_role(&actor(ctx), id, update)
            .await
            .map_err(gql_err)?;
        Ok(role.into())
    }

    async fn delete_role(&self, ctx: &Context<'_>, id: i64) -> Result<RoleObject> {
        let sync = synchronizer(ctx)?;
        let role = sync.delete_role(&actor(ctx), id).await.map_err(gql_err)?;
        Ok(role.into())
    }

    async fn create_api(&self, ctx: &Context<'_>, input: CreateApiInput) -> Result<ApiObject> {
        let sync = synchronizer(ctx)?;
        let api = sync
            .create_api(
                &actor(ctx),
                NewApi {
                    path: input.path,
                    method: input.method,
                    name: input.name,
                    description: input.description,
                    is_public: input.is_public.unwrap_or(false),
                },
            )
            .await
            .map_err(gql_err)?;
        Ok(api.into())
    }

    async fn update_api(
        &self,
        ctx: &Context<'_>,
        id: i64,
        input: UpdateApiInput,
    ) -> Result<ApiObject> {
        let sync = synchronizer(ctx)?;
        let update = ApiUpdate {
            path: input.path,
            method: input.method,
            name: input.name,
            description: input.description,
            is_public: input.is_public,
        };
        let api = sync
            .update_api(&actor(ctx), id, update)
            .await
            .map_err(gql_err)?;
        Ok(api.into())
    }

    async fn delete_api(&self, ctx: &Context<'_>, id: i64) -> Result<ApiObject> {
        let sync = synchronizer(ctx)?;
        let api = sync.delete_api(&actor(ctx), id).await.map_err(gql_err)?;
        Ok(api.into())
    }

    async fn create_user(&self, ctx: &Context<'_>, username: String) -> Result<UserObject> {
        let sync = synchronizer(ctx)?;
        let user = sync
            .create_user(&actor(ctx), &username)
            .await
            .map_err(gql_err)?;
        Ok(user.into())
    }

    async fn delete_user(&self, ctx: &Context<'_>, id: i64) -> Result<UserObject> {
        let sync = synchronizer(ctx)?;
        let user = sync.delete_user(&actor(ctx), id).await.map_err(gql_err)?;
        Ok(user.into())
    }

    async fn set_user_enabled(
        &self,
        ctx: &Context<'_>,
        id: i64,
        enabled: bool,
    ) -> Result<UserObject> {
        let sync = synchronizer(ctx)?;
        let user = sync
            .set_user_enabled(&actor(ctx), id, enabled)
            .await
            .map_err(gql_err)?;
        Ok(user.into())
    }

    /// Replace the role's apis. Returns the role's full policy set.
    async fn assign_apis_to_role(
        &self,
        ctx: &Context<'_>,
        role_id: i64,
        api_ids: Vec<i64>,
    ) -> Result<Vec<PolicyObject>> {
        let sync = synchronizer(ctx)?;
        let rules = sync
            .assign_apis_to_role(&actor(ctx), role_id, &api_ids)
            .await
            .map_err(gql_err)?;
        Ok(rules.into_iter().map(Into::into).collect())
    }

    async fn revoke_apis_from_role(
        &self,
        ctx: &Context<'_>,
        role_id: i64,
        api_ids: Vec<i64>,
    ) -> Result<Vec<PolicyObject>> {
        let sync = synchronizer(ctx)?;
        let rules = sync
            .revoke_apis_from_role(&actor(ctx), role_id, &api_ids)
            .await
            .map_err(gql_err)?;
        Ok(rules.into_iter().map(Into::into).collect())
    }

    /// Replace the user's roles. Returns the user's full membership set.
    async fn assign_roles_to_user(
        &self,
        ctx: &Context<'_>,
        user_id: i64,
        role_ids: Vec<i64>,
    ) -> Result<Vec<GroupingObject>> {
        let sync = synchronizer(ctx)?;
        let rules = sync
            .assign_roles_to_user(&actor(ctx), user_id, &role_ids)
            .await
            .map_err(gql_err)?;
        Ok(rules.into_iter().map(Into::into).collect())
    }

    async fn revoke_roles_from_user(
        &self,
        ctx: &Context<'_>,
        user_id: i64,
        role_ids: Vec<i64>,
    ) -> Result<Vec<GroupingObject>> {
        let sync = synchronizer(ctx)?;
        let rules = sync
            .revoke_roles_from_user(&actor(ctx), user_id, &role_ids)
            .await
            .map_err(gql_err)?;
        Ok(rules.into_iter().map(Into::into).collect())
    }

    async fn assign_apis_to_user(
        &self,
        ctx: &Context<'_>,
        user_id: i64,
        api_ids: Vec<i64>,
    ) -> Result<Vec<PolicyObject>> {
        let sync = synchronizer(ctx)?;
        let rules = sync
            .assign_apis_to_user(&actor(ctx), user_id, &api_ids)
            .await
            .map_err(gql_err)?;
        Ok(rules.into_iter().map(Into::into).collect())
    }

    async fn revoke_apis_from_user(
        &self,
        ctx: &Context<'_>,
        user_id: i64,
        api_ids: Vec<i64>,
    ) -> Result<Vec<PolicyObject>> {
        let sync = synchronizer(ctx)?;
        let rules = sync
            .revoke_apis_from_user(&actor(ctx), user_id, &api_ids)
            .await
            .map_err(gql_err)?;
        Ok(rules.into_iter().map(Into::into).collect())
    }

    /// Re-read the policy table into a fresh snapshot
    async fn reload_policies(&self, ctx: &Context<'_>) -> Result<StoreStatsObject> {
        let sync = synchronizer(ctx)?;
        sync.reload_now().await.map_err(gql_err)?;
        let stats = sync.store().stats();
        Ok(StoreStatsObject {
            policies: stats.policies as i64,
            groupings: stats.groupings as i64,
            loaded_at: stats.loaded_at,
        })
    }

    /// Manually trigger a background job by name
    async fn trigger_job(&self, ctx: &Context<'_>, job_name: String) -> Result<JobTriggerResult> {
        let sync = synchronizer(ctx)?;

        match jobs::trigger_job_manually(sync, &job_name).await {
            Ok(count) => Ok(JobTriggerResult {
                success: true,
                message: format!("Job '{}' completed: {} records", job_name, count),
                job_name,
            }),
            Err(e) => Ok(JobTriggerResult {
                success: false,
                message: format!("Failed to trigger job '{}': {}", job_name, e.public_message()),
                job_name,
            }),
        }
    }
}

/// Result of triggering a job
#[derive(SimpleObject)]
pub struct JobTriggerResult {
    pub success: bool,
    pub message: String,
    pub job_name: String,
}

/// Custom queries for admin operations
#[derive(Default)]
pub struct AdminQuery;

#[Object]
impl AdminQuery {
    async fn roles(&self, ctx: &Context<'_>) -> Result<Vec<RoleObject>> {
        let sync = synchronizer(ctx)?;
        let roles = storage::list_roles(sync.db()).await.map_err(gql_err)?;
        Ok(roles.into_iter().map(Into::into).collect())
    }

    async fn role(&self, ctx: &Context<'_>, id: i64) -> Result<Option<RoleObject>> {
        let sync = synchronizer(ctx)?;
        let role = storage::get_role(sync.db(), id).await.map_err(gql_err)?;
        Ok(role.map(Into::into))
    }

    /// Policies currently derived for a role, from the live snapshot
    async fn role_policies(&self, ctx: &Context<'_>, id: i64) -> Result<Vec<PolicyObject>> {
        let sync = synchronizer(ctx)?;
        let role = storage::get_role(sync.db(), id)
            .await
            .map_err(gql_err)?
            .ok_or_else(|| gql_err(PortcullisError::NotFound(format!("role {id}"))))?;
        Ok(sync
            .store()
            .get_filtered_policy(0, &[&role.name])
            .into_iter()
            .map(Into::into)
            .collect())
    }

    async fn apis(&self, ctx: &Context<'_>) -> Result<Vec<ApiObject>> {
        let sync = synchronizer(ctx)?;
        let apis = storage::list_apis(sync.db()).await.map_err(gql_err)?;
        Ok(apis.into_iter().map(Into::into).collect())
    }

    async fn public_apis(&self, ctx: &Context<'_>) -> Result<Vec<ApiObject>> {
        let sync = synchronizer(ctx)?;
        let apis = storage::list_public_apis(sync.db()).await.map_err(gql_err)?;
        Ok(apis.into_iter().map(Into::into).collect())
    }

    async fn users(&self, ctx: &Context<'_>) -> Result<Vec<UserObject>> {
        let sync = synchronizer(ctx)?;
        let users = storage::list_users(sync.db()).await.map_err(gql_err)?;
        Ok(users.into_iter().map(Into::into).collect())
    }

    async fn user(&self, ctx: &Context<'_>, id: i64) -> Result<Option<UserObject>> {
        let sync = synchronizer(ctx)?;
        let user = storage::get_user(sync.db(), id).await.map_err(gql_err)?;
        Ok(user.map(Into::into))
    }

    /// Everything a user can reach through active roles and direct grants
    async fn effective_permissions(
        &self,
        ctx: &Context<'_>,
        user_id: i64,
    ) -> Result<PermissionsObject> {
        let checker = ctx
            .data::<Arc<AuthorizationChecker>>()
            .map_err(|_| Error::new("Authorization checker not available"))?;
        let perms = checker
            .effective_permissions(user_id)
            .await
            .map_err(gql_err)?;
        Ok(PermissionsObject {
            principal_id: perms.principal_id,
            roles: perms.roles,
            permissions: perms.permissions.into_iter().map(Into::into).collect(),
        })
    }

    /// Dry-run a check without going through the routing layer
    async fn check(
        &self,
        ctx: &Context<'_>,
        principal_id: i64,
        path: String,
        method: String,
    ) -> Result<DecisionObject> {
        let checker = ctx
            .data::<Arc<AuthorizationChecker>>()
            .map_err(|_| Error::new("Authorization checker not available"))?;
        let decision = checker
            .check(principal_id, &path, &method)
            .await
            .map_err(gql_err)?;
        Ok(DecisionObject {
            allowed: decision.allowed,
            reason: decision.reason,
        })
    }

    async fn policy_stats(&self, ctx: &Context<'_>) -> Result<StoreStatsObject> {
        let sync = synchronizer(ctx)?;
        let stats = sync.store().stats();
        Ok(StoreStatsObject {
            policies: stats.policies as i64,
            groupings: stats.groupings as i64,
            loaded_at: stats.loaded_at,
        })
    }

    /// Get recent job executions with optional filtering
    async fn job_logs(
        &self,
        ctx: &Context<'_>,
        #[graphql(desc = "Filter by job name")] job_name: Option<String>,
        #[graphql(desc = "Limit number of results", default = 100)] limit: i64,
        #[graphql(desc = "Only show failed jobs")] only_failures: Option<bool>,
    ) -> Result<Vec<JobLog>> {
        let sync = synchronizer(ctx)?;

        use crate::entities::job_execution::{Column, Entity};

        let mut query = Entity::find();

        // Filter by job name if provided
        if let Some(name) = job_name {
            query = query.filter(Column::JobName.eq(name));
        }

        // Filter by failures if requested
        if let Some(true) = only_failures {
            query = query.filter(Column::Success.eq(0));
        }

        // Order by most recent first and limit
        let results = query
            .order_by_desc(Column::StartedAt)
            .order_by_desc(Column::Id)
            .limit(limit.max(0) as u64)
            .all(sync.db())
            .await
            .map_err(|e| gql_err(e.into()))?;

        Ok(results
            .into_iter()
            .map(|model| JobLog {
                id: model.id,
                job_name: model.job_name,
                started_at: model.started_at,
                completed_at: model.completed_at,
                success: model.success,
                error_message: model.error_message,
                records_processed: model.records_processed,
            })
            .collect())
    }

    /// Get list of available jobs that can be triggered
    async fn available_jobs(&self) -> Result<Vec<JobInfo>> {
        Ok(vec![
            JobInfo {
                name: jobs::RELOAD_POLICIES.to_string(),
                description: "Reload the policy snapshot from the policy table".to_string(),
                schedule: "jobs.policy_reload_schedule".to_string(),
            },
            JobInfo {
                name: jobs::RECONCILE_POLICIES.to_string(),
                description: "Rebuild the policy table from role, api and user assignments"
                    .to_string(),
                schedule: "jobs.reconcile_schedule".to_string(),
            },
        ])
    }
}

/// Job log entry
#[derive(SimpleObject)]
pub struct JobLog {
    pub id: i64,
    pub job_name: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub success: Option<i64>,
    pub error_message: Option<String>,
    pub records_processed: Option<i64>,
}

/// Information about an available job
#[derive(SimpleObject)]
pub struct JobInfo {
    pub name: String,
    pub description: String,
    pub schedule: String,
}
