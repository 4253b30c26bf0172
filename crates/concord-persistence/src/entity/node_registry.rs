//! `SeaORM` Entity for node_registry table

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "node_registry")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub nodeindex: i64,
    /// Comma-separated list of reachable addresses
    #[sea_orm(column_type = "Text")]
    pub ips: String,
    pub command_port: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
