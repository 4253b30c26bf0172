//! Node manager settings

use std::time::Duration;

use concord_common::Configuration;

use crate::transport::{EndpointConfig, WorkerPoolConfig};

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Addresses published in the registry for this node
    pub hosts: Vec<String>,
    /// Command port, 0 picks an ephemeral one
    pub port: u16,
    /// Connect timeout when probing a lower-id node
    pub probe_timeout: Duration,
    /// Upper bound on one remote call, `None` waits until the connection dies
    pub request_timeout: Option<Duration>,
    /// Retries for coordinator calls failing at the transport level
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Attempts at claiming a free registry row
    pub register_attempts: u32,
    pub endpoint: EndpointConfig,
    pub workers: WorkerPoolConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1".to_string()],
            port: 0,
            probe_timeout: Duration::from_millis(500),
            request_timeout: None,
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
            register_attempts: 5,
            endpoint: EndpointConfig::default(),
            workers: WorkerPoolConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_configuration(config: &Configuration) -> Self {
        let request_timeout = config.node_request_timeout_ms();
        Self {
            hosts: config.node_hosts(),
            port: config.node_port(),
            probe_timeout: Duration::from_millis(config.node_probe_timeout_ms()),
            request_timeout: (request_timeout > 0).then(|| Duration::from_millis(request_timeout)),
            max_retries: config.node_max_retries(),
            retry_delay: Duration::from_millis(config.node_retry_delay_ms()),
            register_attempts: config.node_register_attempts().max(1),
            endpoint: EndpointConfig {
                response_ttl: Duration::from_millis(config.transport_response_ttl_ms()),
            },
            workers: WorkerPoolConfig {
                max_workers: config.transport_worker_max(),
                idle_timeout: Duration::from_millis(config.transport_worker_idle_ms()),
            },
        }
    }

    /// Loopback-only hosts bind to loopback, anything else binds every interface
    pub fn bind_host(&self) -> &'static str {
        let loopback_only = !self.hosts.is_empty()
            && self
                .hosts
                .iter()
                .all(|h| h == "localhost" || h.parse::<std::net::IpAddr>().is_ok_and(|ip| ip.is_loopback()));
        if loopback_only { "127.0.0.1" } else { "0.0.0.0" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_common::config::{NODE_HOST, NODE_REQUEST_TIMEOUT, TRANSPORT_WORKER_MAX};

    #[test]
    fn test_from_configuration() {
        let config = Configuration::load(
            None,
            &[
                (NODE_HOST, "127.0.0.1".to_string()),
                (NODE_REQUEST_TIMEOUT, "1500".to_string()),
                (TRANSPORT_WORKER_MAX, "8".to_string()),
            ],
        )
        .unwrap();

        let node = NodeConfig::from_configuration(&config);
        assert_eq!(node.hosts, vec!["127.0.0.1"]);
        assert_eq!(node.request_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(node.workers.max_workers, 8);
        assert_eq!(node.max_retries, 3);
        assert_eq!(node.bind_host(), "127.0.0.1");
    }

    #[test]
    fn test_unbounded_request_timeout_and_wildcard_bind() {
        let config = Configuration::load(None, &[(NODE_HOST, "10.1.2.3".to_string())]).unwrap();
        let node = NodeConfig::from_configuration(&config);
        assert_eq!(node.request_timeout, None);
        assert_eq!(node.bind_host(), "0.0.0.0");
    }
}
