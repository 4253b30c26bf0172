//! `SeaORM` entities

pub mod change_log;
pub mod node_registry;

pub mod prelude {
    pub use super::change_log::Entity as ChangeLog;
    pub use super::node_registry::Entity as NodeRegistry;
}
