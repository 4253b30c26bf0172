//! Core model types shared by every Concord node

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Node identifier, unique among live nodes
pub type NodeId = i64;

/// Totally ordered logical timestamp.
///
/// The coarse part is `millis * 10000 (+ offset)`, the fine part a sub-index
/// in `0..10000` so more than one ordered value can be issued per millisecond.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Serial(pub i64);

impl Serial {
    /// Number of sub-serials available inside one millisecond
    pub const SUB_SERIALS: i64 = 10_000;

    pub const ZERO: Serial = Serial(0);

    pub const MAX: Serial = Serial(i64::MAX);

    pub fn value(self) -> i64 {
        self.0
    }

    /// Serial corresponding to the start of the given millisecond
    pub fn from_millis(millis: i64) -> Self {
        Serial(millis.saturating_mul(Self::SUB_SERIALS))
    }
}

impl Display for Serial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Serial {
    fn from(value: i64) -> Self {
        Serial(value)
    }
}

/// Role a connected node plays in the group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    /// Not connected yet, no role decided
    #[default]
    Undecided,
    /// Authoritative for serials, locks, and commit fencing
    Coordinator,
    /// Forwards coordination calls to the coordinator
    Participant,
}

impl Display for NodeRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Undecided => write!(f, "UNDECIDED"),
            NodeRole::Coordinator => write!(f, "COORDINATOR"),
            NodeRole::Participant => write!(f, "PARTICIPANT"),
        }
    }
}

/// Node lifecycle state, moved one level at a time
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    #[default]
    Offline,
    Uninitialized,
    Initialized,
    Connected,
}

impl NodeState {
    /// The next state up, if any
    pub fn up(self) -> Option<NodeState> {
        match self {
            NodeState::Offline => Some(NodeState::Uninitialized),
            NodeState::Uninitialized => Some(NodeState::Initialized),
            NodeState::Initialized => Some(NodeState::Connected),
            NodeState::Connected => None,
        }
    }

    /// The next state down, if any
    pub fn down(self) -> Option<NodeState> {
        match self {
            NodeState::Offline => None,
            NodeState::Uninitialized => Some(NodeState::Offline),
            NodeState::Initialized => Some(NodeState::Uninitialized),
            NodeState::Connected => Some(NodeState::Initialized),
        }
    }
}

impl Display for NodeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Offline => write!(f, "OFFLINE"),
            NodeState::Uninitialized => write!(f, "UNINITIALIZED"),
            NodeState::Initialized => write!(f, "INITIALIZED"),
            NodeState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Identifier of a persistent class or interface
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassId(pub String);

impl ClassId {
    pub fn new(name: impl Into<String>) -> Self {
        ClassId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ClassId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClassId {
    fn from(value: &str) -> Self {
        ClassId(value.to_string())
    }
}

/// Identity of a persisted object: its concrete class plus numeric id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    pub class: ClassId,
    pub id: i64,
}

impl ObjectId {
    pub fn new(class: ClassId, id: i64) -> Self {
        Self { class, id }
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.class, self.id)
    }
}

/// Something that can be locked: a whole class hierarchy node or one object.
///
/// The derived ordering is the canonical acquisition order: every class
/// target sorts before every object target, then by identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockTarget {
    Class(ClassId),
    Object(ObjectId),
}

impl LockTarget {
    pub fn class(name: impl Into<String>) -> Self {
        LockTarget::Class(ClassId::new(name))
    }

    pub fn object(class: impl Into<String>, id: i64) -> Self {
        LockTarget::Object(ObjectId::new(ClassId::new(class), id))
    }

    /// The class this target belongs to (the class itself for class targets)
    pub fn class_id(&self) -> &ClassId {
        match self {
            LockTarget::Class(class) => class,
            LockTarget::Object(object) => &object.class,
        }
    }

    pub fn is_class(&self) -> bool {
        matches!(self, LockTarget::Class(_))
    }
}

impl Display for LockTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LockTarget::Class(class) => write!(f, "class:{}", class),
            LockTarget::Object(object) => write!(f, "object:{}", object),
        }
    }
}
