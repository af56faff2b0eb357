use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "apis")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Resource pattern, object of policy triples
    pub path: String,
    /// Method code, see `authz::types::HttpMethod`
    pub method: i32,
    pub name: String,
    pub description: Option<String>,
    pub is_public: i64,
    pub deleted: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
