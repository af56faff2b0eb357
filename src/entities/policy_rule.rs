use sea_orm::entity::prelude::*;

/// Persisted policy row. `ptype` is `p` for (subject, object, action)
/// triples and `g` for (user, role) grouping tuples.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "policy_rules")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub ptype: String,
    pub v0: String,
    pub v1: String,
    pub v2: String,
    pub v3: String,
    pub v4: String,
    pub v5: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Value columns in order, trailing empty columns dropped.
    pub fn values(&self) -> Vec<String> {
        let mut values = vec![
            self.v0.clone(),
            self.v1.clone(),
            self.v2.clone(),
            self.v3.clone(),
            self.v4.clone(),
            self.v5.clone(),
        ];
        while values.last().is_some_and(|v| v.is_empty()) {
            values.pop();
        }
        values
    }
}
