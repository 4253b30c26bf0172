//! Change-log lookup trait

use async_trait::async_trait;

use concord_common::{ClassId, ObjectId, Result, Serial};

/// Direct storage lookup of committed change serials.
///
/// Implemented by the storage engine; used when the in-memory modification
/// window does not cover the serial being asked about.
#[async_trait]
pub trait ChangeLogPersistence: Send + Sync {
    /// Serial of the last committed change to the object, `None` if unknown
    async fn last_object_change(&self, object: &ObjectId) -> Result<Option<Serial>>;

    /// Highest committed change serial across all the given classes
    async fn last_class_change(&self, classes: &[ClassId]) -> Result<Option<Serial>>;
}
