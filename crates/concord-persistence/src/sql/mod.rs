//! SQL-based persistence backend (MySQL/PostgreSQL via SeaORM)
//!
//! Stores the node registry in the `node_registry` table and committed
//! object changes in the `change_log` table of the shared relational
//! backing store.

use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Schema, SqlErr, prelude::Expr,
};
use tracing::{debug, info};

use concord_common::{ClassId, ConcordError, NodeId, ObjectId, Result, Serial};

use crate::entity::{change_log, node_registry};
use crate::model::NodeRegistration;
use crate::traits::{ChangeLogPersistence, NodeRegistryPersistence};

/// External database persistence service
///
/// Wraps a SeaORM `DatabaseConnection` and implements the registry and
/// change-log traits with direct queries against their tables.
pub struct ExternalDbPersistService {
    db: DatabaseConnection,
}

impl ExternalDbPersistService {
    /// Create a new ExternalDbPersistService with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Connect to the database at `url`
    pub async fn connect(url: &str) -> Result<Self> {
        let db = sea_orm::Database::connect(url).await.map_err(db_error)?;
        info!("Connected node registry database");
        Ok(Self::new(db))
    }

    /// Get a reference to the underlying database connection
    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Create the change-log table if it does not exist yet
    pub async fn ensure_change_log(&self) -> Result<()> {
        let backend = self.db.get_database_backend();
        let mut statement = Schema::new(backend).create_table_from_entity(change_log::Entity);
        statement.if_not_exists();

        self.db
            .execute(backend.build(&statement))
            .await
            .map_err(db_error)?;
        Ok(())
    }

    /// Append a committed change to an object
    pub async fn record_change(&self, object: &ObjectId, serial: Serial) -> Result<()> {
        change_log::ActiveModel {
            class_name: Set(object.class.as_str().to_string()),
            object_id: Set(object.id),
            serial: Set(serial.value()),
            ..Default::default()
        }
        .insert(&self.db)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn max_serial(&self, select: sea_orm::Select<change_log::Entity>) -> Result<Option<Serial>> {
        let max = select
            .select_only()
            .column_as(Expr::col(change_log::Column::Serial).max(), "serial")
            .into_tuple::<Option<i64>>()
            .one(&self.db)
            .await
            .map_err(db_error)?;
        Ok(max.flatten().map(Serial))
    }

    fn to_active_model(registration: &NodeRegistration) -> node_registry::ActiveModel {
        node_registry::ActiveModel {
            nodeindex: Set(registration.node_index),
            ips: Set(registration.ips_column()),
            command_port: Set(registration.command_port as i32),
        }
    }
}

fn db_error(err: DbErr) -> ConcordError {
    ConcordError::Persistence(err.to_string())
}

#[async_trait]
impl NodeRegistryPersistence for ExternalDbPersistService {
    async fn ensure_table(&self) -> Result<()> {
        let backend = self.db.get_database_backend();
        let schema = Schema::new(backend);
        let mut statement = schema.create_table_from_entity(node_registry::Entity);
        statement.if_not_exists();

        self.db
            .execute(backend.build(&statement))
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn search_all(&self) -> Result<Vec<NodeRegistration>> {
        let rows = node_registry::Entity::find()
            .order_by_asc(node_registry::Column::Nodeindex)
            .all(&self.db)
            .await
            .map_err(db_error)?;

        Ok(rows.into_iter().map(NodeRegistration::from).collect())
    }

    async fn insert(&self, registration: &NodeRegistration) -> Result<bool> {
        match Self::to_active_model(registration).insert(&self.db).await {
            Ok(_) => Ok(true),
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                debug!(
                    "Node index {} already registered by another node",
                    registration.node_index
                );
                Ok(false)
            }
            Err(err) => Err(db_error(err)),
        }
    }

    async fn save(&self, registration: &NodeRegistration) -> Result<()> {
        match Self::to_active_model(registration).update(&self.db).await {
            Ok(_) => Ok(()),
            Err(DbErr::RecordNotUpdated) => {
                Self::to_active_model(registration)
                    .insert(&self.db)
                    .await
                    .map_err(db_error)?;
                Ok(())
            }
            Err(err) => Err(db_error(err)),
        }
    }

    async fn remove(&self, node_index: NodeId) -> Result<bool> {
        let result = node_registry::Entity::delete_by_id(node_index)
            .exec(&self.db)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected > 0)
    }
}

#[async_trait]
impl ChangeLogPersistence for ExternalDbPersistService {
    async fn last_object_change(&self, object: &ObjectId) -> Result<Option<Serial>> {
        self.max_serial(
            change_log::Entity::find()
                .filter(change_log::Column::ClassName.eq(object.class.as_str()))
                .filter(change_log::Column::ObjectId.eq(object.id)),
        )
        .await
    }

    async fn last_class_change(&self, classes: &[ClassId]) -> Result<Option<Serial>> {
        if classes.is_empty() {
            return Ok(None);
        }
        self.max_serial(
            change_log::Entity::find().filter(
                change_log::Column::ClassName.is_in(classes.iter().map(|c| c.as_str().to_string())),
            ),
        )
        .await
    }
}
