//! Error taxonomy for Concord
//!
//! Every variant is serializable so a failure raised inside a remote
//! handler can be shipped back to the caller and rebuilt unchanged.

use serde::{Deserialize, Serialize};

use crate::model::LockTarget;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, ConcordError>;

/// Application-specific error types
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ConcordError {
    /// A lock could not be granted because another owner holds a conflicting entry
    #[error("lock conflict on {targets:?} (holder session: {session_info:?})")]
    LockConflict {
        session_info: Option<String>,
        targets: Vec<LockTarget>,
    },

    /// The transport failed or the connection was declared dead
    #[error("communication failure: {0}")]
    CommunicationFailure(String),

    /// Serial time moved backward or the sub-serial space was exhausted
    #[error("fatal ordering violation: {0}")]
    FatalOrdering(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no handler registered for {service}.{method}")]
    UnknownOperation { service: String, method: String },
}

impl ConcordError {
    /// Whether a coordinator call failing with this error may be retried
    pub fn is_transport(&self) -> bool {
        matches!(self, ConcordError::CommunicationFailure(_))
    }

    /// Whether the error is unrecoverable for the issuing coordinator
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConcordError::FatalOrdering(_))
    }
}

impl From<serde_json::Error> for ConcordError {
    fn from(value: serde_json::Error) -> Self {
        ConcordError::Serialization(value.to_string())
    }
}

impl From<std::io::Error> for ConcordError {
    fn from(value: std::io::Error) -> Self {
        ConcordError::CommunicationFailure(value.to_string())
    }
}

impl From<config::ConfigError> for ConcordError {
    fn from(value: config::ConfigError) -> Self {
        ConcordError::Config(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassId, ObjectId};

    #[test]
    fn test_error_survives_wire_round_trip() {
        let err = ConcordError::LockConflict {
            session_info: Some("tx-7@node-2".to_string()),
            targets: vec![LockTarget::Object(ObjectId::new(ClassId::new("Order"), 42))],
        };

        let json = serde_json::to_string(&err).unwrap();
        let back: ConcordError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_error_classification() {
        assert!(ConcordError::CommunicationFailure("reset".into()).is_transport());
        assert!(!ConcordError::IllegalState("x".into()).is_transport());
        assert!(ConcordError::FatalOrdering("clock".into()).is_fatal());
    }

    #[test]
    fn test_io_error_maps_to_communication_failure() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let err: ConcordError = io.into();
        assert!(err.is_transport());
    }
}
