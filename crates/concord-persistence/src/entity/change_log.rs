//! `SeaORM` Entity for change_log table

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One committed change to one object, appended by the storage engine
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "change_log")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(indexed)]
    pub class_name: String,
    pub object_id: i64,
    /// Commit serial of the change
    pub serial: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
