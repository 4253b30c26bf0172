//! Domain model types for persistence operations

use serde::{Deserialize, Serialize};

use concord_common::NodeId;

use crate::entity::node_registry;

/// One row of the shared node registry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub node_index: NodeId,
    pub ips: Vec<String>,
    pub command_port: u16,
}

impl NodeRegistration {
    pub fn new(node_index: NodeId, ips: Vec<String>, command_port: u16) -> Self {
        Self {
            node_index,
            ips,
            command_port,
        }
    }

    /// Every `ip:port` this node can be probed at, in published order
    pub fn socket_addresses(&self) -> Vec<String> {
        self.ips
            .iter()
            .map(|ip| format!("{}:{}", ip, self.command_port))
            .collect()
    }

    /// Comma-separated address column value
    pub fn ips_column(&self) -> String {
        self.ips.join(",")
    }

    /// Split the address column into individual addresses
    pub fn parse_ips(column: &str) -> Vec<String> {
        column
            .split(',')
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .map(|e| e.to_string())
            .collect()
    }
}

impl From<node_registry::Model> for NodeRegistration {
    fn from(model: node_registry::Model) -> Self {
        Self {
            node_index: model.nodeindex,
            ips: Self::parse_ips(&model.ips),
            command_port: model.command_port as u16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ips_column() {
        let reg = NodeRegistration::new(3, vec!["10.0.0.1".into(), "192.168.1.4".into()], 7400);
        assert_eq!(reg.ips_column(), "10.0.0.1,192.168.1.4");
        assert_eq!(
            reg.socket_addresses(),
            vec!["10.0.0.1:7400", "192.168.1.4:7400"]
        );
    }

    #[test]
    fn test_from_model_skips_blank_addresses() {
        let model = node_registry::Model {
            nodeindex: 7,
            ips: " 10.0.0.1, ,10.0.0.2 ".to_string(),
            command_port: 9000,
        };
        let reg = NodeRegistration::from(model);
        assert_eq!(reg.node_index, 7);
        assert_eq!(reg.ips, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(reg.command_port, 9000);
    }
}
