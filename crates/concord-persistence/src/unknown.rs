//! Change log for nodes that cannot see the storage engine's history
//!
//! Every lookup reports a change at `Serial::MAX`, so the modification
//! cache answers "not current" whenever its own window cannot vouch for a
//! serial.

use async_trait::async_trait;

use concord_common::{ClassId, ObjectId, Result, Serial};

use crate::traits::ChangeLogPersistence;

#[derive(Debug, Default, Clone, Copy)]
pub struct UnknownChangeLog;

#[async_trait]
impl ChangeLogPersistence for UnknownChangeLog {
    async fn last_object_change(&self, _object: &ObjectId) -> Result<Option<Serial>> {
        Ok(Some(Serial::MAX))
    }

    async fn last_class_change(&self, _classes: &[ClassId]) -> Result<Option<Serial>> {
        Ok(Some(Serial::MAX))
    }
}
