use oss_lib::{OssError, OssResult, RouteConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_meta_db_path() -> String {
    "oss_meta.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,
}

/// Routing-core knobs, all optional in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteSettings {
    pub limit_num: usize,
    pub conn_pool_capacity: usize,
    pub io_timeout_ms: u64,
    pub topology_interval_ms: u64,
    pub fid_interval_ms: u64,
    pub fid_low_water: u64,
}

impl Default for RouteSettings {
    fn default() -> Self {
        let defaults = RouteConfig::default();
        Self {
            limit_num: defaults.limit_num,
            conn_pool_capacity: defaults.conn_pool_capacity,
            io_timeout_ms: defaults.io_timeout.as_millis() as u64,
            topology_interval_ms: defaults.topology_interval.as_millis() as u64,
            fid_interval_ms: defaults.fid_interval.as_millis() as u64,
            fid_low_water: defaults.fid_low_water,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub master: MasterConfig,
    #[serde(default)]
    pub route: RouteSettings,
    #[serde(default = "default_meta_db_path")]
    pub meta_db_path: String,
}

impl ApiServerConfig {
    pub fn load(path: &str) -> OssResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OssError::IoError(format!("read config {} failed: {}", path, e))
        })?;
        toml::from_str(&content).map_err(|e| {
            OssError::InvalidParam(format!("parse config {} failed: {}", path, e))
        })
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.route.io_timeout_ms)
    }

    pub fn route_config(&self) -> RouteConfig {
        RouteConfig {
            limit_num: self.route.limit_num,
            conn_pool_capacity: self.route.conn_pool_capacity,
            io_timeout: self.io_timeout(),
            topology_interval: Duration::from_millis(self.route.topology_interval_ms),
            fid_interval: Duration::from_millis(self.route.fid_interval_ms),
            fid_low_water: self.route.fid_low_water,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: ApiServerConfig = toml::from_str(
            r#"
            [master]
            host = "10.0.0.5"
            port = 8099
            "#,
        )
        .unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.master.host, "10.0.0.5");
        assert_eq!(config.route.limit_num, RouteConfig::default().limit_num);
        assert_eq!(config.meta_db_path, "oss_meta.db");
    }

    #[test]
    fn test_full_config_round_trip() {
        let config: ApiServerConfig = toml::from_str(
            r#"
            host = "127.0.0.1"
            port = 9980
            meta_db_path = "/var/lib/oss/meta.db"

            [master]
            host = "master.internal"
            port = 8099

            [route]
            limit_num = 3
            conn_pool_capacity = 16
            io_timeout_ms = 5000
            topology_interval_ms = 2000
            fid_interval_ms = 2000
            fid_low_water = 512
            "#,
        )
        .unwrap();
        let route = config.route_config();
        assert_eq!(route.limit_num, 3);
        assert_eq!(route.conn_pool_capacity, 16);
        assert_eq!(route.io_timeout, Duration::from_secs(5));
        assert_eq!(route.fid_low_water, 512);
    }
}
