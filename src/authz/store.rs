//! Persisted policy triples and grouping tuples with a copy-on-reload
//! in-memory snapshot.
//!
//! Mutations write through to the `policy_rules` table only. Readers keep
//! seeing the current [`PolicySnapshot`] until [`PolicyStore::reload`] swaps
//! in a freshly read one, so a reader never observes a half-applied batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;

use crate::authz::errors::AuthzError;
use crate::authz::matcher;
use crate::authz::types::{GroupingRule, PolicyRule, PTYPE_GROUPING, PTYPE_POLICY};
use crate::entities::policy_rule::{self, Column, Entity};
use crate::entities::role;

const VALUE_COLUMNS: usize = 6;

fn value_column(index: usize) -> Column {
    match index {
        0 => Column::V0,
        1 => Column::V1,
        2 => Column::V2,
        3 => Column::V3,
        4 => Column::V4,
        _ => Column::V5,
    }
}

/// Build the row filter for a partial match starting at `field_index`.
/// An empty value leaves its column unconstrained.
fn filter_condition(ptype: &str, field_index: usize, values: &[&str]) -> Result<Condition, AuthzError> {
    if field_index + values.len() > VALUE_COLUMNS {
        return Err(AuthzError::InvalidFilter(format!(
            "field_index {field_index} with {} values",
            values.len()
        )));
    }
    if values.iter().all(|v| v.is_empty()) {
        return Err(AuthzError::InvalidFilter(
            "at least one filter value must be non-empty".to_string(),
        ));
    }
    let mut cond = Condition::all().add(Column::Ptype.eq(ptype));
    for (offset, value) in values.iter().enumerate() {
        if !value.is_empty() {
            cond = cond.add(value_column(field_index + offset).eq(*value));
        }
    }
    Ok(cond)
}

fn filter_matches(row: &[&str], field_index: usize, values: &[&str]) -> bool {
    values.iter().enumerate().all(|(offset, value)| {
        value.is_empty() || row.get(field_index + offset).copied().unwrap_or("") == *value
    })
}

fn row_condition(ptype: &str, values: &[&str]) -> Condition {
    let mut cond = Condition::all().add(Column::Ptype.eq(ptype));
    for index in 0..VALUE_COLUMNS {
        cond = cond.add(value_column(index).eq(values.get(index).copied().unwrap_or("")));
    }
    cond
}

fn new_row(ptype: &str, values: &[&str]) -> policy_rule::ActiveModel {
    let v = |i: usize| values.get(i).copied().unwrap_or("").to_string();
    policy_rule::ActiveModel {
        ptype: Set(ptype.to_string()),
        v0: Set(v(0)),
        v1: Set(v(1)),
        v2: Set(v(2)),
        v3: Set(v(3)),
        v4: Set(v(4)),
        v5: Set(v(5)),
        ..Default::default()
    }
}

/// Immutable view of every policy and grouping row, indexed by subject.
#[derive(Debug, Default)]
pub struct PolicySnapshot {
    /// subject -> triples, in row order
    policies: HashMap<String, Vec<PolicyRule>>,
    /// user -> role names, in row order
    groupings: HashMap<String, Vec<String>>,
    /// names of live, enabled roles at load time
    active_roles: HashSet<String>,
    policy_count: usize,
    grouping_count: usize,
    loaded_at: i64,
}

impl PolicySnapshot {
    pub fn from_rows(rows: Vec<policy_rule::Model>, active_roles: HashSet<String>) -> Self {
        let mut snapshot = PolicySnapshot {
            active_roles,
            loaded_at: Utc::now().timestamp(),
            ..Default::default()
        };
        for row in rows {
            match row.ptype.as_str() {
                PTYPE_POLICY => {
                    snapshot
                        .policies
                        .entry(row.v0.clone())
                        .or_default()
                        .push(PolicyRule::new(row.v0, row.v1, row.v2));
                    snapshot.policy_count += 1;
                }
                PTYPE_GROUPING => {
                    snapshot.groupings.entry(row.v0).or_default().push(row.v1);
                    snapshot.grouping_count += 1;
                }
                other => {
                    tracing::warn!(ptype = other, id = row.id, "skipping policy row with unknown ptype");
                }
            }
        }
        snapshot
    }

    /// True iff some triple `(subject, pattern, action)` has a pattern that
    /// matches `object`.
    pub fn enforce(&self, subject: &str, object: &str, action: &str) -> bool {
        self.first_match(subject, object, action).is_some()
    }

    /// First triple of `subject` granting `(object, action)`.
    pub fn first_match(&self, subject: &str, object: &str, action: &str) -> Option<&PolicyRule> {
        self.policies_for(subject)
            .iter()
            .find(|rule| rule.action == action && matcher::matches(&rule.object, object))
    }

    pub fn policies_for(&self, subject: &str) -> &[PolicyRule] {
        self.policies.get(subject).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn roles_for(&self, user: &str) -> &[String] {
        self.groupings.get(user).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Whether `role` was live and enabled when this snapshot was read.
    pub fn is_role_active(&self, role: &str) -> bool {
        self.active_roles.contains(role)
    }

    pub fn filtered_policies(&self, field_index: usize, values: &[&str]) -> Vec<PolicyRule> {
        let mut out: Vec<PolicyRule> = self
            .policies
            .values()
            .flatten()
            .filter(|rule| filter_matches(&rule.values(), field_index, values))
            .cloned()
            .collect();
        out.sort();
        out
    }

    pub fn filtered_groupings(&self, field_index: usize, values: &[&str]) -> Vec<GroupingRule> {
        let mut out: Vec<GroupingRule> = self
            .groupings
            .iter()
            .flat_map(|(user, roles)| roles.iter().map(move |role| GroupingRule::new(user, role)))
            .filter(|rule| filter_matches(&rule.values(), field_index, values))
            .collect();
        out.sort();
        out
    }

}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub policies: usize,
    pub groupings: usize,
    pub loaded_at: i64,
}

/// Durable policy store. Cheap to share behind an `Arc`; reads never take
/// a lock.
pub struct PolicyStore {
    db: DatabaseConnection,
    snapshot: ArcSwap<PolicySnapshot>,
}

impl PolicyStore {
    /// Store with an empty snapshot; call [`reload`](Self::reload) before use.
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            snapshot: ArcSwap::from_pointee(PolicySnapshot::default()),
        }
    }

    /// Open the store and load the initial snapshot.
    pub async fn load(db: DatabaseConnection) -> Result<Self, AuthzError> {
        let store = Self::new(db);
        store.reload().await?;
        Ok(store)
    }

    /// Current snapshot. Holding it pins that version for the caller.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.snapshot.load_full()
    }

    pub fn enforce(&self, subject: &str, object: &str, action: &str) -> bool {
        self.snapshot.load().enforce(subject, object, action)
    }

    pub fn stats(&self) -> StoreStats {
        let snap = self.snapshot.load();
        StoreStats {
            policies: snap.policy_count,
            groupings: snap.grouping_count,
            loaded_at: snap.loaded_at,
        }
    }

    /// Re-read every row, and the role status the checker filters on, then
    /// swap in the new snapshot.
    pub async fn reload(&self) -> Result<(), AuthzError> {
        let rows = Entity::find()
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?;
        let active_roles: HashSet<String> = role::Entity::find()
            .filter(role::Column::Deleted.eq(0))
            .filter(role::Column::Enabled.eq(1))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect();
        let snapshot = PolicySnapshot::from_rows(rows, active_roles);
        tracing::info!(
            policies = snapshot.policy_count,
            groupings = snapshot.grouping_count,
            "Reloaded policy snapshot"
        );
        self.snapshot.store(Arc::new(snapshot));
        Ok(())
    }

    /// Persist triples; already-present ones are skipped. Returns how many
    /// rows were newly written.
    pub async fn add_policies(&self, rules: &[PolicyRule]) -> Result<usize, AuthzError> {
        let rows: Vec<[&str; 3]> = rules.iter().map(|r| r.values()).collect();
        self.add_rows(PTYPE_POLICY, rows.iter().map(|r| &r[..])).await
    }

    pub async fn add_grouping_policies(&self, rules: &[GroupingRule]) -> Result<usize, AuthzError> {
        let rows: Vec<[&str; 2]> = rules.iter().map(|r| r.values()).collect();
        self.add_rows(PTYPE_GROUPING, rows.iter().map(|r| &r[..])).await
    }

    /// Remove every triple matching `values` starting at column
    /// `field_index`. Returns whether anything was removed.
    pub async fn remove_filtered_policy(
        &self,
        field_index: usize,
        values: &[&str],
    ) -> Result<bool, AuthzError> {
        self.remove_rows(PTYPE_POLICY, field_index, values).await
    }

    pub async fn remove_filtered_grouping_policy(
        &self,
        field_index: usize,
        values: &[&str],
    ) -> Result<bool, AuthzError> {
        self.remove_rows(PTYPE_GROUPING, field_index, values).await
    }

    /// Swap the whole backing table for exactly these rows in one
    /// transaction. Does not reload.
    pub async fn replace_all(
        &self,
        policies: &[PolicyRule],
        groupings: &[GroupingRule],
    ) -> Result<(usize, usize), AuthzError> {
        let txn = self.db.begin().await?;
        Entity::delete_many().exec(&txn).await?;

        let mut seen = HashSet::new();
        let mut added_policies = 0;
        for rule in policies {
            if seen.insert(rule) && insert_if_absent(&txn, PTYPE_POLICY, &rule.values()).await? {
                added_policies += 1;
            }
        }
        let mut seen = HashSet::new();
        let mut added_groupings = 0;
        for rule in groupings {
            if seen.insert(rule) && insert_if_absent(&txn, PTYPE_GROUPING, &rule.values()).await? {
                added_groupings += 1;
            }
        }

        txn.commit().await?;
        Ok((added_policies, added_groupings))
    }

    /// Snapshot query; reflects the state as of the last reload.
    pub fn get_filtered_policy(&self, field_index: usize, values: &[&str]) -> Vec<PolicyRule> {
        self.snapshot.load().filtered_policies(field_index, values)
    }

    pub fn get_filtered_grouping_policy(
        &self,
        field_index: usize,
        values: &[&str],
    ) -> Vec<GroupingRule> {
        self.snapshot.load().filtered_groupings(field_index, values)
    }

    /// Backing-table query; sees writes not yet reloaded.
    pub async fn load_filtered_policy(
        &self,
        field_index: usize,
        values: &[&str],
    ) -> Result<Vec<PolicyRule>, AuthzError> {
        let rows = self.find_rows(PTYPE_POLICY, field_index, values).await?;
        Ok(rows
            .into_iter()
            .map(|r| PolicyRule::new(r.v0, r.v1, r.v2))
            .collect())
    }

    pub async fn load_filtered_grouping_policy(
        &self,
        field_index: usize,
        values: &[&str],
    ) -> Result<Vec<GroupingRule>, AuthzError> {
        let rows = self.find_rows(PTYPE_GROUPING, field_index, values).await?;
        Ok(rows
            .into_iter()
            .map(|r| GroupingRule::new(r.v0, r.v1))
            .collect())
    }

    async fn find_rows(
        &self,
        ptype: &str,
        field_index: usize,
        values: &[&str],
    ) -> Result<Vec<policy_rule::Model>, AuthzError> {
        let cond = filter_condition(ptype, field_index, values)?;
        Ok(Entity::find()
            .filter(cond)
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?)
    }

    async fn add_rows<'a>(
        &self,
        ptype: &str,
        rows: impl Iterator<Item = &'a [&'a str]>,
    ) -> Result<usize, AuthzError> {
        let txn = self.db.begin().await?;
        let mut seen = HashSet::new();
        let mut added = 0;
        for values in rows {
            if !seen.insert(values.to_vec()) {
                continue;
            }
            if insert_if_absent(&txn, ptype, values).await? {
                added += 1;
            }
        }
        txn.commit().await?;
        Ok(added)
    }

    async fn remove_rows(
        &self,
        ptype: &str,
        field_index: usize,
        values: &[&str],
    ) -> Result<bool, AuthzError> {
        let cond = filter_condition(ptype, field_index, values)?;
        let result = Entity::delete_many().filter(cond).exec(&self.db).await?;
        Ok(result.rows_affected > 0)
    }
}

async fn insert_if_absent<C: ConnectionTrait>(
    conn: &C,
    ptype: &str,
    values: &[&str],
) -> Result<bool, AuthzError> {
    let existing = Entity::find()
        .filter(row_condition(ptype, values))
        .count(conn)
        .await?;
    if existing > 0 {
        return Ok(false);
    }
    Entity::insert(new_row(ptype, values)).exec(conn).await?;
    Ok(true)
}
