//! Application configuration wrapper
//!
//! Values are layered: an optional YAML file, then `CONCORD_`-prefixed
//! environment variables, then explicit overrides from the command line.
//!
//! Environment names are derived from the keys: `concord.node.probe-timeout`
//! is read from `CONCORD_NODE_PROBE_TIMEOUT`, `db.url` from `CONCORD_DB_URL`.

use config::{Config, File};

use crate::error::Result;
use crate::utils::local_ips;

pub const NODE_HOST: &str = "concord.node.host";
pub const NODE_PORT: &str = "concord.node.port";
pub const NODE_PROBE_TIMEOUT: &str = "concord.node.probe-timeout";
pub const NODE_REQUEST_TIMEOUT: &str = "concord.node.request-timeout";
pub const NODE_MAX_RETRIES: &str = "concord.node.max-retries";
pub const NODE_RETRY_DELAY: &str = "concord.node.retry-delay";
pub const NODE_REGISTER_ATTEMPTS: &str = "concord.node.register-attempts";
pub const TRANSPORT_RESPONSE_TTL: &str = "concord.transport.response-ttl";
pub const TRANSPORT_WORKER_MAX: &str = "concord.transport.worker-max";
pub const TRANSPORT_WORKER_IDLE: &str = "concord.transport.worker-idle";
pub const MODIFICATION_MAX_RECORDS: &str = "concord.modification.max-records";
pub const MODIFICATION_MAX_AGE: &str = "concord.modification.max-age";
pub const DB_URL: &str = "db.url";

/// Keys that can be set from the environment
pub const ENV_KEYS: &[&str] = &[
    NODE_HOST,
    NODE_PORT,
    NODE_PROBE_TIMEOUT,
    NODE_REQUEST_TIMEOUT,
    NODE_MAX_RETRIES,
    NODE_RETRY_DELAY,
    NODE_REGISTER_ATTEMPTS,
    TRANSPORT_RESPONSE_TTL,
    TRANSPORT_WORKER_MAX,
    TRANSPORT_WORKER_IDLE,
    MODIFICATION_MAX_RECORDS,
    MODIFICATION_MAX_AGE,
    DB_URL,
];

/// Environment variable read for a configuration key
pub fn env_var_name(key: &str) -> String {
    let key = key.strip_prefix("concord.").unwrap_or(key);
    format!("CONCORD_{}", key.replace(['.', '-'], "_").to_uppercase())
}

#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    /// Create a new configuration from a Config instance
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// Load configuration from an optional file plus the environment,
    /// applying the given `(key, value)` overrides last
    pub fn load(file: Option<&str>, overrides: &[(&str, String)]) -> Result<Self> {
        Self::load_with_env(file, std::env::vars(), overrides)
    }

    /// Like [`Configuration::load`] with an explicit environment
    pub fn load_with_env(
        file: Option<&str>,
        env: impl IntoIterator<Item = (String, String)>,
        overrides: &[(&str, String)],
    ) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        let names: Vec<(String, &str)> = ENV_KEYS.iter().map(|k| (env_var_name(k), *k)).collect();
        for (name, value) in env {
            if let Some((_, key)) = names.iter().find(|(n, _)| *n == name) {
                builder = builder.set_override(*key, value)?;
            }
        }

        for (key, value) in overrides {
            builder = builder.set_override(*key, value.as_str())?;
        }

        Ok(Self {
            config: builder.build()?,
        })
    }

    // ===================== Node Configuration =====================

    /// Addresses published to the node registry.
    /// Defaults to every non-loopback IPv4 address of this host.
    pub fn node_hosts(&self) -> Vec<String> {
        self.config
            .get_string(NODE_HOST)
            .map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .ok()
            .filter(|hosts| !hosts.is_empty())
            .unwrap_or_else(local_ips)
    }

    /// Listening port for the command endpoint (0 = ephemeral)
    pub fn node_port(&self) -> u16 {
        self.config.get_int(NODE_PORT).unwrap_or(0) as u16
    }

    /// Liveness probe timeout in milliseconds (default: 500ms)
    pub fn node_probe_timeout_ms(&self) -> u64 {
        self.config.get_int(NODE_PROBE_TIMEOUT).unwrap_or(500) as u64
    }

    /// Request timeout in milliseconds (default: 0 = wait until the connection dies)
    pub fn node_request_timeout_ms(&self) -> u64 {
        self.config.get_int(NODE_REQUEST_TIMEOUT).unwrap_or(0) as u64
    }

    /// Retries for coordinator calls failing at the transport level (default: 3)
    pub fn node_max_retries(&self) -> u32 {
        self.config.get_int(NODE_MAX_RETRIES).unwrap_or(3) as u32
    }

    /// Delay between coordinator call retries in milliseconds (default: 200ms)
    pub fn node_retry_delay_ms(&self) -> u64 {
        self.config.get_int(NODE_RETRY_DELAY).unwrap_or(200) as u64
    }

    /// Attempts at claiming a registry row before giving up (default: 5)
    pub fn node_register_attempts(&self) -> u32 {
        self.config.get_int(NODE_REGISTER_ATTEMPTS).unwrap_or(5) as u32
    }

    // ===================== Transport Configuration =====================

    /// How long an unclaimed response is kept, in milliseconds (default: 60s)
    pub fn transport_response_ttl_ms(&self) -> u64 {
        self.config
            .get_int(TRANSPORT_RESPONSE_TTL)
            .unwrap_or(60_000) as u64
    }

    /// Upper bound on concurrent handler workers per endpoint (default: 256)
    pub fn transport_worker_max(&self) -> usize {
        self.config.get_int(TRANSPORT_WORKER_MAX).unwrap_or(256) as usize
    }

    /// Idle time after which a handler worker exits, in milliseconds (default: 30s)
    pub fn transport_worker_idle_ms(&self) -> u64 {
        self.config
            .get_int(TRANSPORT_WORKER_IDLE)
            .unwrap_or(30_000) as u64
    }

    // ===================== Modification Cache Configuration =====================

    /// Maximum number of cached modification records (default: 10000)
    pub fn modification_max_records(&self) -> usize {
        self.config
            .get_int(MODIFICATION_MAX_RECORDS)
            .unwrap_or(10_000) as usize
    }

    /// Maximum age of a modification record in milliseconds (default: 10 minutes)
    pub fn modification_max_age_ms(&self) -> u64 {
        self.config
            .get_int(MODIFICATION_MAX_AGE)
            .unwrap_or(600_000) as u64
    }

    // ===================== Storage Configuration =====================

    pub fn db_url(&self) -> Option<String> {
        self.config.get_string(DB_URL).ok().filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Configuration {
        let config = Config::builder()
            .set_default(NODE_HOST, "10.0.0.5, 10.0.0.6")
            .unwrap()
            .set_default(NODE_PORT, 7400)
            .unwrap()
            .set_default(MODIFICATION_MAX_RECORDS, 50)
            .unwrap()
            .build()
            .unwrap();
        Configuration::from_config(config)
    }

    #[test]
    fn test_explicit_values() {
        let config = test_config();
        assert_eq!(config.node_hosts(), vec!["10.0.0.5", "10.0.0.6"]);
        assert_eq!(config.node_port(), 7400);
        assert_eq!(config.modification_max_records(), 50);
    }

    #[test]
    fn test_defaults() {
        let config = Configuration::default();
        assert_eq!(config.node_port(), 0);
        assert_eq!(config.node_probe_timeout_ms(), 500);
        assert_eq!(config.node_max_retries(), 3);
        assert_eq!(config.transport_worker_max(), 256);
        assert!(config.db_url().is_none());
        assert!(!config.node_hosts().is_empty());
    }

    #[test]
    fn test_env_var_names() {
        assert_eq!(env_var_name(NODE_PROBE_TIMEOUT), "CONCORD_NODE_PROBE_TIMEOUT");
        assert_eq!(env_var_name(MODIFICATION_MAX_RECORDS), "CONCORD_MODIFICATION_MAX_RECORDS");
        assert_eq!(env_var_name(DB_URL), "CONCORD_DB_URL");
    }

    #[test]
    fn test_hyphenated_keys_from_env() {
        let env = vec![
            ("CONCORD_NODE_PROBE_TIMEOUT".to_string(), "750".to_string()),
            ("CONCORD_NODE_PORT".to_string(), "7600".to_string()),
            ("CONCORD_DB_URL".to_string(), "postgres://db/concord".to_string()),
            ("UNRELATED".to_string(), "1".to_string()),
        ];
        let config =
            Configuration::load_with_env(None, env, &[(NODE_PORT, "7700".to_string())]).unwrap();

        assert_eq!(config.node_probe_timeout_ms(), 750);
        assert_eq!(config.db_url().as_deref(), Some("postgres://db/concord"));
        // Command-line overrides beat the environment
        assert_eq!(config.node_port(), 7700);
    }

    #[test]
    fn test_overrides_win() {
        let config = Configuration::load(None, &[(NODE_PORT, "7555".to_string())]).unwrap();
        assert_eq!(config.node_port(), 7555);
    }
}
