//! Keeps the policy store in line with the relational assignment tables.
//!
//! Every "replace permissions of subject S" call runs the same four steps:
//! commit the relational change, remove every stored row for S, add the
//! rows re-derived from the relational state, reload the snapshot. Steps 2-4
//! are not transactional with step 1. Between 2 and 3 the backing table
//! holds nothing for S; readers keep the previous snapshot until step 4.
//!
//! Calls for the same subject are serialized by a per-subject lock. Calls
//! for different subjects interleave freely. A full rebuild excludes every
//! other writer while it runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sea_orm::DatabaseConnection;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};

use crate::audit::{AuditEvent, AuditSink};
use crate::authz::store::PolicyStore;
use crate::authz::types::{user_subject, GroupingRule, PolicyRule};
use crate::entities::{api, role, user};
use crate::errors::PortcullisError;
use crate::settings::Settings;
use crate::storage::{self, ApiUpdate, NewApi, NewRole, RoleUpdate};

/// Lazily created async mutex per subject key. An entry lives only while
/// some caller holds or waits on it.
#[derive(Default)]
struct SubjectLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SubjectLocks {
    async fn acquire(&self, key: String) -> SubjectGuard<'_> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(key.clone()).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        SubjectGuard {
            locks: self,
            key,
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

struct SubjectGuard<'a> {
    locks: &'a SubjectLocks,
    key: String,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SubjectGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // clones are only taken under the map lock, so two references here
        // (the map's and ours) mean nobody else is waiting
        let mut map = self.locks.inner.lock().unwrap_or_else(|e| e.into_inner());
        let idle = map
            .get(&self.key)
            .is_some_and(|entry| Arc::ptr_eq(entry, &self.lock) && Arc::strong_count(&self.lock) == 2);
        if idle {
            map.remove(&self.key);
        }
    }
}

fn role_key(role_id: i64) -> String {
    format!("role#{role_id}")
}

fn user_key(user_id: i64) -> String {
    format!("user#{user_id}")
}

pub struct Synchronizer {
    db: DatabaseConnection,
    store: Arc<PolicyStore>,
    audit: AuditSink,
    locks: SubjectLocks,
    /// Shared by subject operations, exclusive for `rebuild_all`.
    gate: RwLock<()>,
    super_admin_user_id: i64,
    super_admin_role: String,
    timeout: Duration,
}

impl Synchronizer {
    pub fn new(
        db: DatabaseConnection,
        store: Arc<PolicyStore>,
        audit: AuditSink,
        settings: &Settings,
    ) -> Self {
        Self {
            db,
            store,
            audit,
            locks: SubjectLocks::default(),
            gate: RwLock::new(()),
            super_admin_user_id: settings.authz.super_admin_user_id,
            super_admin_role: settings.authz.super_admin_role.clone(),
            timeout: settings.operation_timeout(),
        }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    fn is_super_admin(&self, user_id: i64) -> bool {
        user_id == self.super_admin_user_id
    }

    /// Run `fut` under the operation deadline. Dropping the future on expiry
    /// rolls back an open relational transaction; store steps already
    /// applied stay applied until the next reload or reconcile.
    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, PortcullisError>
    where
        F: Future<Output = Result<T, PortcullisError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    op,
                    timeout_secs = self.timeout.as_secs(),
                    "synchronizer operation timed out; policy snapshot may be stale until the next reload"
                );
                Err(PortcullisError::Timeout(op.to_string()))
            }
        }
    }

    /// Step 4. Failure keeps the previous snapshot in service.
    async fn reload(&self) {
        if let Err(err) = self.store.reload().await {
            tracing::warn!(error = %err, "policy reload failed; serving stale snapshot");
        }
    }

    /// Explicit reload for callers that want the error.
    pub async fn reload_now(&self) -> Result<(), PortcullisError> {
        self.bounded("reload", async { Ok(self.store.reload().await?) })
            .await
    }

    fn emit(&self, actor: &str, action: &'static str, target: String, outcome: impl Into<String>) {
        self.audit.record(AuditEvent::new(actor, action, target, outcome));
    }

    // Replace protocol, steps 2 and 3. Callers hold the subject lock.

    async fn replace_role_policies(
        &self,
        role_name: &str,
        derived: &[PolicyRule],
    ) -> Result<(), PortcullisError> {
        self.store.remove_filtered_policy(0, &[role_name]).await?;
        self.store.add_policies(derived).await?;
        Ok(())
    }

    async fn replace_user_policies(
        &self,
        user_id: i64,
        derived: &[PolicyRule],
    ) -> Result<(), PortcullisError> {
        let subject = user_subject(user_id);
        self.store.remove_filtered_policy(0, &[&subject]).await?;
        self.store.add_policies(derived).await?;
        Ok(())
    }

    async fn replace_user_groupings(
        &self,
        user_id: i64,
        derived: &[GroupingRule],
    ) -> Result<(), PortcullisError> {
        let subject = user_subject(user_id);
        self.store
            .remove_filtered_grouping_policy(0, &[&subject])
            .await?;
        self.store.add_grouping_policies(derived).await?;
        Ok(())
    }

    // ---------- role lifecycle ----------

    pub async fn create_role(
        &self,
        actor: &str,
        input: NewRole,
    ) -> Result<role::Model, PortcullisError> {
        let role = self
            .bounded("create_role", storage::create_role(&self.db, input))
            .await?;
        self.emit(actor, "role.create", role_key(role.id), &role.name);
        Ok(role)
    }

    /// Update a role. A name change rewrites every triple and grouping
    /// tuple that referenced the old name before returning. An update that
    /// names the role runs with every other writer excluded, so no user
    /// assignment can derive tuples under the old name and apply them after
    /// the rewrite.
    pub async fn update_role(
        &self,
        actor: &str,
        role_id: i64,
        update: RoleUpdate,
    ) -> Result<role::Model, PortcullisError> {
        self.bounded("update_role", async {
            let _exclusive;
            let _shared;
            if update.name.is_some() {
                _exclusive = self.gate.write().await;
            } else {
                _shared = self.gate.read().await;
            }
            let _guard = self.locks.acquire(role_key(role_id)).await;

            let (before, after) = storage::update_role(&self.db, role_id, update).await?;
            if before.name != after.name {
                self.rename_subject(&before.name, &after.name).await?;
                self.reload().await;
                tracing::info!(from = %before.name, to = %after.name, "Renamed role subject");
            } else if before.enabled != after.enabled {
                // the snapshot carries role status
                self.reload().await;
            }
            self.emit(actor, "role.update", role_key(role_id), &after.name);
            Ok(after)
        })
        .await
    }

    /// Move every stored row from `old` to `new`. Reads the backing table so
    /// rows written since the last reload are carried over too.
    async fn rename_subject(&self, old: &str, new: &str) -> Result<(), PortcullisError> {
        let policies: Vec<PolicyRule> = self
            .store
            .load_filtered_policy(0, &[old])
            .await?
            .into_iter()
            .map(|rule| PolicyRule::new(new, rule.object, rule.action))
            .collect();
        let groupings: Vec<GroupingRule> = self
            .store
            .load_filtered_grouping_policy(1, &[old])
            .await?
            .into_iter()
            .map(|rule| GroupingRule::new(rule.user, new))
            .collect();

        self.store.add_policies(&policies).await?;
        self.store.add_grouping_policies(&groupings).await?;
        self.store.remove_filtered_policy(0, &[old]).await?;
        self.store.remove_filtered_grouping_policy(1, &[old]).await?;
        Ok(())
    }

    pub async fn delete_role(&self, actor: &str, role_id: i64) -> Result<role::Model, PortcullisError> {
        self.bounded("delete_role", async {
            let _gate = self.gate.read().await;
            let _guard = self.locks.acquire(role_key(role_id)).await;

            let role = storage::delete_role(&self.db, role_id).await?;
            self.store.remove_filtered_policy(0, &[&role.name]).await?;
            // no members remain, but stray tuples may
            self.store
                .remove_filtered_grouping_policy(1, &[&role.name])
                .await?;
            self.reload().await;

            self.emit(actor, "role.delete", role_key(role_id), &role.name);
            Ok(role)
        })
        .await
    }

    // ---------- api lifecycle ----------

    pub async fn create_api(&self, actor: &str, input: NewApi) -> Result<api::Model, PortcullisError> {
        let api = self
            .bounded("create_api", storage::create_api(&self.db, input))
            .await?;
        self.emit(actor, "api.create", format!("api#{}", api.id), &api.path);
        Ok(api)
    }

    /// Update an api. When `(path, method)` changes, every role and user
    /// holding it gets its triples re-derived.
    pub async fn update_api(
        &self,
        actor: &str,
        api_id: i64,
        update: ApiUpdate,
    ) -> Result<api::Model, PortcullisError> {
        self.bounded("update_api", async {
            let _gate = self.gate.read().await;
            let (before, after) = storage::update_api(&self.db, api_id, update).await?;
            if before.path != after.path || before.method != after.method {
                self.resync_api_holders(api_id).await?;
                self.reload().await;
            }
            self.emit(actor, "api.update", format!("api#{api_id}"), &after.path);
            Ok(after)
        })
        .await
    }

    pub async fn delete_api(&self, actor: &str, api_id: i64) -> Result<api::Model, PortcullisError> {
        self.bounded("delete_api", async {
            let _gate = self.gate.read().await;
            // holders must be read before the join rows disappear
            let roles = storage::roles_with_api(&self.db, api_id).await?;
            let users = storage::users_with_api(&self.db, api_id).await?;

            let api = storage::delete_api(&self.db, api_id).await?;
            for role in &roles {
                let _guard = self.locks.acquire(role_key(role.id)).await;
                self.resync_role_locked(role).await?;
            }
            for user_id in users {
                let _guard = self.locks.acquire(user_key(user_id)).await;
                let derived = storage::derive_user_policies(&self.db, user_id).await?;
                self.replace_user_policies(user_id, &derived).await?;
            }
            self.reload().await;

            self.emit(actor, "api.delete", format!("api#{api_id}"), &api.path);
            Ok(api)
        })
        .await
    }

    async fn resync_api_holders(&self, api_id: i64) -> Result<(), PortcullisError> {
        for role in storage::roles_with_api(&self.db, api_id).await? {
            let _guard = self.locks.acquire(role_key(role.id)).await;
            self.resync_role_locked(&role).await?;
        }
        for user_id in storage::users_with_api(&self.db, api_id).await? {
            let _guard = self.locks.acquire(user_key(user_id)).await;
            let derived = storage::derive_user_policies(&self.db, user_id).await?;
            self.replace_user_policies(user_id, &derived).await?;
        }
        Ok(())
    }

    // ---------- user lifecycle ----------

    pub async fn create_user(&self, actor: &str, username: &str) -> Result<user::Model, PortcullisError> {
        let user = self
            .bounded("create_user", storage::create_user(&self.db, username))
            .await?;
        self.emit(actor, "user.create", user_key(user.id), &user.username);
        Ok(user)
    }

    pub async fn delete_user(&self, actor: &str, user_id: i64) -> Result<user::Model, PortcullisError> {
        if self.is_super_admin(user_id) {
            return Err(PortcullisError::Protected(
                "the super-admin user cannot be deleted".into(),
            ));
        }
        self.bounded("delete_user", async {
            let _gate = self.gate.read().await;
            let _guard = self.locks.acquire(user_key(user_id)).await;

            let user = storage::delete_user(&self.db, user_id).await?;
            let subject = user_subject(user_id);
            self.store.remove_filtered_policy(0, &[&subject]).await?;
            self.store
                .remove_filtered_grouping_policy(0, &[&subject])
                .await?;
            self.reload().await;

            self.emit(actor, "user.delete", user_key(user_id), &user.username);
            Ok(user)
        })
        .await
    }

    pub async fn set_user_enabled(
        &self,
        actor: &str,
        user_id: i64,
        enabled: bool,
    ) -> Result<user::Model, PortcullisError> {
        if self.is_super_admin(user_id) && !enabled {
            return Err(PortcullisError::Protected(
                "the super-admin user cannot be disabled".into(),
            ));
        }
        let user = self
            .bounded(
                "set_user_enabled",
                storage::set_user_enabled(&self.db, user_id, enabled),
            )
            .await?;
        self.emit(actor, "user.enable", user_key(user_id), enabled.to_string());
        Ok(user)
    }

    // ---------- assignments ----------

    /// Replace a role's apis and its triples. Returns the new triple set.
    pub async fn assign_apis_to_role(
        &self,
        actor: &str,
        role_id: i64,
        api_ids: &[i64],
    ) -> Result<Vec<PolicyRule>, PortcullisError> {
        self.bounded("assign_apis_to_role", async {
            let _gate = self.gate.read().await;
            let _guard = self.locks.acquire(role_key(role_id)).await;

            let (role, derived) = storage::assign_apis_to_role(&self.db, role_id, api_ids).await?;
            self.replace_role_policies(&role.name, &derived).await?;
            self.reload().await;

            self.emit(actor, "role.apis.assign", role_key(role_id), format!("{api_ids:?}"));
            Ok(derived)
        })
        .await
    }

    pub async fn revoke_apis_from_role(
        &self,
        actor: &str,
        role_id: i64,
        api_ids: &[i64],
    ) -> Result<Vec<PolicyRule>, PortcullisError> {
        self.bounded("revoke_apis_from_role", async {
            let _gate = self.gate.read().await;
            let _guard = self.locks.acquire(role_key(role_id)).await;

            let (role, derived) =
                storage::revoke_apis_from_role(&self.db, role_id, api_ids).await?;
            self.replace_role_policies(&role.name, &derived).await?;
            self.reload().await;

            self.emit(actor, "role.apis.revoke", role_key(role_id), format!("{api_ids:?}"));
            Ok(derived)
        })
        .await
    }

    /// Replace a user's roles. The super-admin's memberships never change;
    /// the call returns its current tuples untouched.
    pub async fn assign_roles_to_user(
        &self,
        actor: &str,
        user_id: i64,
        role_ids: &[i64],
    ) -> Result<Vec<GroupingRule>, PortcullisError> {
        if self.is_super_admin(user_id) {
            return self.super_admin_noop(actor, "user.roles.assign", user_id).await;
        }
        self.bounded("assign_roles_to_user", async {
            let _gate = self.gate.read().await;
            let _guard = self.locks.acquire(user_key(user_id)).await;

            let derived = storage::assign_roles_to_user(&self.db, user_id, role_ids).await?;
            self.replace_user_groupings(user_id, &derived).await?;
            self.reload().await;

            self.emit(actor, "user.roles.assign", user_key(user_id), format!("{role_ids:?}"));
            Ok(derived)
        })
        .await
    }

    pub async fn revoke_roles_from_user(
        &self,
        actor: &str,
        user_id: i64,
        role_ids: &[i64],
    ) -> Result<Vec<GroupingRule>, PortcullisError> {
        if self.is_super_admin(user_id) {
            return self.super_admin_noop(actor, "user.roles.revoke", user_id).await;
        }
        self.bounded("revoke_roles_from_user", async {
            let _gate = self.gate.read().await;
            let _guard = self.locks.acquire(user_key(user_id)).await;

            let derived = storage::revoke_roles_from_user(&self.db, user_id, role_ids).await?;
            self.replace_user_groupings(user_id, &derived).await?;
            self.reload().await;

            self.emit(actor, "user.roles.revoke", user_key(user_id), format!("{role_ids:?}"));
            Ok(derived)
        })
        .await
    }

    async fn super_admin_noop(
        &self,
        actor: &str,
        action: &'static str,
        user_id: i64,
    ) -> Result<Vec<GroupingRule>, PortcullisError> {
        tracing::info!(user_id, action, "ignoring membership change on super-admin");
        self.emit(actor, action, user_key(user_id), "ignored");
        self.bounded("derive_user_groupings", storage::derive_user_groupings(&self.db, user_id))
            .await
    }

    /// Replace a user's direct grants. A no-op for the super-admin, which
    /// bypasses checks anyway.
    pub async fn assign_apis_to_user(
        &self,
        actor: &str,
        user_id: i64,
        api_ids: &[i64],
    ) -> Result<Vec<PolicyRule>, PortcullisError> {
        if self.is_super_admin(user_id) {
            self.emit(actor, "user.apis.assign", user_key(user_id), "ignored");
            return self
                .bounded("derive_user_policies", storage::derive_user_policies(&self.db, user_id))
                .await;
        }
        self.bounded("assign_apis_to_user", async {
            let _gate = self.gate.read().await;
            let _guard = self.locks.acquire(user_key(user_id)).await;

            let derived = storage::assign_apis_to_user(&self.db, user_id, api_ids).await?;
            self.replace_user_policies(user_id, &derived).await?;
            self.reload().await;

            self.emit(actor, "user.apis.assign", user_key(user_id), format!("{api_ids:?}"));
            Ok(derived)
        })
        .await
    }

    pub async fn revoke_apis_from_user(
        &self,
        actor: &str,
        user_id: i64,
        api_ids: &[i64],
    ) -> Result<Vec<PolicyRule>, PortcullisError> {
        if self.is_super_admin(user_id) {
            self.emit(actor, "user.apis.revoke", user_key(user_id), "ignored");
            return self
                .bounded("derive_user_policies", storage::derive_user_policies(&self.db, user_id))
                .await;
        }
        self.bounded("revoke_apis_from_user", async {
            let _gate = self.gate.read().await;
            let _guard = self.locks.acquire(user_key(user_id)).await;

            let derived = storage::revoke_apis_from_user(&self.db, user_id, api_ids).await?;
            self.replace_user_policies(user_id, &derived).await?;
            self.reload().await;

            self.emit(actor, "user.apis.revoke", user_key(user_id), format!("{api_ids:?}"));
            Ok(derived)
        })
        .await
    }

    // ---------- re-derivation ----------

    async fn resync_role_locked(&self, role: &role::Model) -> Result<Vec<PolicyRule>, PortcullisError> {
        let derived = storage::derive_role_policies(&self.db, role).await?;
        self.replace_role_policies(&role.name, &derived).await?;
        Ok(derived)
    }

    /// Recompute one role's triples from the relational rows.
    pub async fn resync_role(&self, role_id: i64) -> Result<Vec<PolicyRule>, PortcullisError> {
        self.bounded("resync_role", async {
            let _gate = self.gate.read().await;
            let _guard = self.locks.acquire(role_key(role_id)).await;

            let role = storage::get_role(&self.db, role_id)
                .await?
                .ok_or_else(|| PortcullisError::NotFound(format!("role {role_id}")))?;
            let derived = self.resync_role_locked(&role).await?;
            self.reload().await;
            Ok(derived)
        })
        .await
    }

    /// Recompute one user's tuples and direct triples.
    pub async fn resync_user(&self, user_id: i64) -> Result<(), PortcullisError> {
        self.bounded("resync_user", async {
            let _gate = self.gate.read().await;
            let _guard = self.locks.acquire(user_key(user_id)).await;

            storage::get_user(&self.db, user_id)
                .await?
                .ok_or_else(|| PortcullisError::NotFound(format!("user {user_id}")))?;
            let groupings = storage::derive_user_groupings(&self.db, user_id).await?;
            let policies = storage::derive_user_policies(&self.db, user_id).await?;
            self.replace_user_groupings(user_id, &groupings).await?;
            self.replace_user_policies(user_id, &policies).await?;
            self.reload().await;
            Ok(())
        })
        .await
    }

    /// Recompute the whole store from relational state in one swap. Rows for
    /// subjects that no longer exist disappear. Returns (policies, groupings)
    /// written.
    pub async fn rebuild_all(&self) -> Result<(usize, usize), PortcullisError> {
        self.bounded("rebuild_all", async {
            let _gate = self.gate.write().await;

            let mut policies = Vec::new();
            for role in storage::list_roles(&self.db).await? {
                policies.extend(storage::derive_role_policies(&self.db, &role).await?);
            }
            let mut groupings = Vec::new();
            for user in storage::list_users(&self.db).await? {
                policies.extend(storage::derive_user_policies(&self.db, user.id).await?);
                groupings.extend(storage::derive_user_groupings(&self.db, user.id).await?);
            }

            let written = self.store.replace_all(&policies, &groupings).await?;
            self.reload().await;
            tracing::info!(policies = written.0, groupings = written.1, "Rebuilt policy store");
            Ok(written)
        })
        .await
    }

    /// Ensure the super-admin role and user exist and are reflected in the
    /// store.
    pub async fn bootstrap(&self) -> Result<(), PortcullisError> {
        let (role, user) = self
            .bounded(
                "bootstrap",
                storage::ensure_super_admin(&self.db, self.super_admin_user_id, &self.super_admin_role),
            )
            .await?;
        self.resync_role(role.id).await?;
        self.resync_user(user.id).await?;
        tracing::info!(user_id = user.id, role = %role.name, "Super-admin bootstrap complete");
        Ok(())
    }
}
