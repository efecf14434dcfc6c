use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Master-side configuration. Layered `defaults ≺ YAML file ≺ environment ≺
/// CLI flags`, each layer overriding the previous one field-by-field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MasterConfig {
    pub bind_address: String,
    pub heartbeat_timeout_secs: u64,
    pub result_buffer_capacity: usize,
    pub log_level: String,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7070".to_string(),
            heartbeat_timeout_secs: 30,
            result_buffer_capacity: 10_000,
            log_level: "info".to_string(),
            extra: HashMap::new(),
        }
    }
}

/// Slave-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SlaveConfig {
    pub master_address: String,
    pub slave_id: Option<String>,
    pub capabilities: Vec<String>,
    pub labels: HashMap<String, String>,
    pub heartbeat_interval_secs: u64,
    pub flush_interval_ms: u64,
    pub buffer_capacity: usize,
    pub log_level: String,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            master_address: "127.0.0.1:7070".to_string(),
            slave_id: None,
            capabilities: Vec::new(),
            labels: HashMap::new(),
            heartbeat_interval_secs: 10,
            flush_interval_ms: 500,
            buffer_capacity: 10_000,
            log_level: "info".to_string(),
        }
    }
}

/// Validate that an address string parses as `host:port`.
pub fn validate_address(address: &str) -> Result<(), Error> {
    address
        .parse::<SocketAddr>()
        .map(|_| ())
        .or_else(|_| {
            // Hostnames (non-IP) are accepted as long as they carry a port.
            let mut parts = address.rsplitn(2, ':');
            let port = parts.next().ok_or_else(|| invalid_address(address))?;
            let host = parts.next().ok_or_else(|| invalid_address(address))?;
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(invalid_address(address));
            }
            Ok(())
        })
}

fn invalid_address(address: &str) -> Error {
    Error::Validation(format!("invalid address: {address}"))
}

fn load_yaml_layer<T>(path: &Path) -> Result<Option<T>, Error>
where
    T: serde::de::DeserializeOwned,
{
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)?;
    let value: T = serde_yaml::from_str(&contents)?;
    Ok(Some(value))
}

/// Environment variable layer: `LOADMESH_<FIELD>`, double underscores
/// nesting into `extra`. Only scalar top-level fields are supported; nested
/// overrides are merged into `extra` as raw JSON.
fn apply_env_layer(config: &mut MasterConfig, prefix: &str) {
    let env_key = |name: &str| format!("{prefix}_{name}");
    if let Ok(v) = std::env::var(env_key("BIND_ADDRESS")) {
        config.bind_address = v;
    }
    if let Ok(v) = std::env::var(env_key("HEARTBEAT_TIMEOUT_SECS")) {
        if let Ok(n) = v.parse() {
            config.heartbeat_timeout_secs = n;
        }
    }
    if let Ok(v) = std::env::var(env_key("RESULT_BUFFER_CAPACITY")) {
        if let Ok(n) = v.parse() {
            config.result_buffer_capacity = n;
        }
    }
    if let Ok(v) = std::env::var(env_key("LOG_LEVEL")) {
        config.log_level = v;
    }
}

impl MasterConfig {
    /// Build the layered config: defaults, then an optional YAML file, then
    /// `LOADMESH_*` environment variables. CLI-flag overrides are applied by
    /// the binary after this call, since they are parsed with `clap` there.
    pub fn load(yaml_path: Option<&Path>) -> Result<Self, Error> {
        let mut config = MasterConfig::default();
        if let Some(path) = yaml_path {
            if let Some(layer) = load_yaml_layer::<MasterConfig>(path)? {
                config = layer;
            }
        }
        apply_env_layer(&mut config, "LOADMESH");
        validate_address(&config.bind_address)?;
        Ok(config)
    }
}

impl SlaveConfig {
    pub fn load(yaml_path: Option<&Path>) -> Result<Self, Error> {
        let mut config = SlaveConfig::default();
        if let Some(path) = yaml_path {
            if let Some(layer) = load_yaml_layer::<SlaveConfig>(path)? {
                config = layer;
            }
        }
        if let Ok(v) = std::env::var("LOADMESH_MASTER_ADDRESS") {
            config.master_address = v;
        }
        if let Ok(v) = std::env::var("LOADMESH_SLAVE_ID") {
            config.slave_id = Some(v);
        }
        if let Ok(v) = std::env::var("LOADMESH_LOG_LEVEL") {
            config.log_level = v;
        }
        validate_address(&config.master_address)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_master_config_has_valid_address() {
        let config = MasterConfig::default();
        assert!(validate_address(&config.bind_address).is_ok());
    }

    #[test]
    fn validate_address_accepts_ip_port() {
        assert!(validate_address("127.0.0.1:8080").is_ok());
    }

    #[test]
    fn validate_address_accepts_hostname_port() {
        assert!(validate_address("master.internal:7070").is_ok());
    }

    #[test]
    fn validate_address_rejects_missing_port() {
        assert!(validate_address("127.0.0.1").is_err());
    }

    #[test]
    fn validate_address_rejects_empty_host() {
        assert!(validate_address(":7070").is_err());
    }

    #[test]
    fn yaml_layer_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bind_address: \"0.0.0.0:9999\"").unwrap();
        writeln!(file, "heartbeat_timeout_secs: 60").unwrap();
        writeln!(file, "result_buffer_capacity: 5000").unwrap();
        writeln!(file, "log_level: \"debug\"").unwrap();
        let config = MasterConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:9999");
        assert_eq!(config.heartbeat_timeout_secs, 60);
    }

    #[test]
    fn missing_yaml_file_falls_back_to_defaults() {
        let config = MasterConfig::load(Some(Path::new("/nonexistent/path.yaml"))).unwrap();
        assert_eq!(config.bind_address, MasterConfig::default().bind_address);
    }

    #[test]
    fn env_layer_overrides_yaml_layer() {
        std::env::set_var("LOADMESH_LOG_LEVEL", "trace");
        let config = MasterConfig::load(None).unwrap();
        assert_eq!(config.log_level, "trace");
        std::env::remove_var("LOADMESH_LOG_LEVEL");
    }

    #[test]
    fn slave_config_round_trip() {
        let config = SlaveConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SlaveConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.master_address, config.master_address);
    }
}
