use std::sync::Arc;

use crate::audit::{AuditEvent, AuditSink};
use crate::authz::store::{PolicySnapshot, PolicyStore};
use crate::authz::types::{user_subject, Decision, HttpMethod, PermissionsResponse, PolicyRule};
use crate::errors::PortcullisError;
use crate::settings::Settings;

pub const REASON_ADMIN: &str = "admin";
pub const REASON_UNSUPPORTED_METHOD: &str = "unsupported method";
pub const REASON_NO_MATCH: &str = "no matching policy";

/// The read path. Answers from the current policy snapshot without
/// touching the database.
pub struct AuthorizationChecker {
    store: Arc<PolicyStore>,
    audit: AuditSink,
    super_admin_user_id: i64,
    super_admin_role: String,
}

impl AuthorizationChecker {
    pub fn new(store: Arc<PolicyStore>, audit: AuditSink, settings: &Settings) -> Self {
        Self {
            store,
            audit,
            super_admin_user_id: settings.authz.super_admin_user_id,
            super_admin_role: settings.authz.super_admin_role.clone(),
        }
    }

    /// Decide whether `principal_id` may call `method path`.
    pub async fn check(
        &self,
        principal_id: i64,
        path: &str,
        method: &str,
    ) -> Result<Decision, PortcullisError> {
        let decision = self.decide(principal_id, path, method).await?;
        self.audit.record(AuditEvent::new(
            principal_id.to_string(),
            "check",
            format!("{} {path}", method.trim().to_ascii_uppercase()),
            format!(
                "{}: {}",
                if decision.allowed { "allowed" } else { "denied" },
                decision.reason
            ),
        ));
        tracing::debug!(
            principal_id,
            path,
            method,
            allowed = decision.allowed,
            reason = %decision.reason,
            "authorization decision"
        );
        Ok(decision)
    }

    async fn decide(
        &self,
        principal_id: i64,
        path: &str,
        method: &str,
    ) -> Result<Decision, PortcullisError> {
        // 1. Super-admin bypass, before the store is touched
        if principal_id == self.super_admin_user_id {
            return Ok(Decision::allow(REASON_ADMIN));
        }

        // 2. Method string must map to the fixed enum
        let Ok(method) = method.parse::<HttpMethod>() else {
            return Ok(Decision::deny(REASON_UNSUPPORTED_METHOD));
        };
        let action = method.as_str();

        // 3. Pin one snapshot for the whole decision
        let snapshot = self.store.snapshot();
        let subject = user_subject(principal_id);
        let roles = self.active_roles(&snapshot, &subject);

        // 4. Roles first, then direct grants; first match wins
        for role in &roles {
            if snapshot.first_match(role, path, action).is_some() {
                return Ok(Decision::allow(format!("role {role}")));
            }
        }
        if snapshot.first_match(&subject, path, action).is_some() {
            return Ok(Decision::allow("direct grant"));
        }

        Ok(Decision::deny(REASON_NO_MATCH))
    }

    /// Roles from the grouping tuples whose rows were live and enabled at
    /// load time. The super-admin role counts even when disabled.
    fn active_roles(&self, snapshot: &PolicySnapshot, subject: &str) -> Vec<String> {
        snapshot
            .roles_for(subject)
            .iter()
            .filter(|role| snapshot.is_role_active(role) || **role == self.super_admin_role)
            .cloned()
            .collect()
    }

    /// Every triple the principal can reach through active roles and direct
    /// grants, as of the current snapshot.
    pub async fn effective_permissions(
        &self,
        principal_id: i64,
    ) -> Result<PermissionsResponse, PortcullisError> {
        let snapshot = self.store.snapshot();
        let subject = user_subject(principal_id);
        let roles = self.active_roles(&snapshot, &subject);

        let permissions: Vec<PolicyRule> = roles
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(subject.as_str()))
            .flat_map(|s| snapshot.policies_for(s))
            .cloned()
            .collect();

        Ok(PermissionsResponse {
            principal_id,
            roles,
            permissions,
        })
    }
}
