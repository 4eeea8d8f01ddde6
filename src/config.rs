use crate::model::{CheckMethod, CheckStatus, OwnerId, ProbeTarget, TargetId, TargetKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    #[serde(default = "default_device_ports")]
    pub device_ports: Vec<u16>,
    #[serde(default = "default_device_attempt_timeout_ms")]
    pub device_attempt_timeout_ms: u64,
    #[serde(default = "default_ping_fallback")]
    pub ping_fallback: bool,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_tcp_timeout_ms")]
    pub tcp_timeout_ms: u64,
    #[serde(default = "default_ping_method_ports")]
    pub ping_method_ports: Vec<u16>,
    #[serde(default = "default_ping_method_timeout_ms")]
    pub ping_method_timeout_ms: u64,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatsConfig {
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,
    #[serde(default = "default_stats_timeout_ms")]
    pub stats_timeout_ms: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_history_interval_secs")]
    pub history_interval_secs: u64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_cpu_sample_window_ms")]
    pub cpu_sample_window_ms: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_push_interval_secs")]
    pub push_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    #[serde(default = "default_ping_host")]
    pub ping_host: String,
    #[serde(default = "default_speedtest_url")]
    pub speedtest_url: String,
    #[serde(default = "default_speedtest_timeout_secs")]
    pub speedtest_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InventoryConfig {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub id: TargetId,
    pub owner_id: OwnerId,
    pub name: String,
    pub ip: String,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub id: TargetId,
    pub owner_id: OwnerId,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub method: CheckMethod,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            device_ports: default_device_ports(),
            device_attempt_timeout_ms: default_device_attempt_timeout_ms(),
            ping_fallback: default_ping_fallback(),
            ping_timeout_ms: default_ping_timeout_ms(),
            tcp_timeout_ms: default_tcp_timeout_ms(),
            ping_method_ports: default_ping_method_ports(),
            ping_method_timeout_ms: default_ping_method_timeout_ms(),
            http_timeout_ms: default_http_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            docker_socket: default_docker_socket(),
            stats_timeout_ms: default_stats_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            history_interval_secs: default_history_interval_secs(),
            history_capacity: default_history_capacity(),
            cpu_sample_window_ms: default_cpu_sample_window_ms(),
            stop_grace_secs: default_stop_grace_secs(),
            push_interval_secs: default_push_interval_secs(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ping_host: default_ping_host(),
            speedtest_url: default_speedtest_url(),
            speedtest_timeout_secs: default_speedtest_timeout_secs(),
        }
    }
}

impl ProbeConfig {
    pub fn device_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.device_attempt_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_timeout_ms)
    }

    pub fn ping_method_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_method_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

impl StatsConfig {
    pub fn stats_timeout(&self) -> Duration {
        Duration::from_millis(self.stats_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn history_interval(&self) -> Duration {
        Duration::from_secs(self.history_interval_secs)
    }

    pub fn cpu_sample_window(&self) -> Duration {
        Duration::from_millis(self.cpu_sample_window_ms)
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.push_interval_secs)
    }
}

impl NetworkConfig {
    pub fn speedtest_timeout(&self) -> Duration {
        Duration::from_secs(self.speedtest_timeout_secs)
    }
}

impl DeviceConfig {
    pub fn to_target(&self) -> ProbeTarget {
        ProbeTarget {
            id: self.id,
            owner_id: self.owner_id,
            kind: TargetKind::Device,
            name: self.name.clone(),
            host: self.ip.clone(),
            port: None,
            method: CheckMethod::Ping,
            active: self.active,
            category: None,
            mac: self.mac.clone().filter(|m| !m.trim().is_empty()),
            last_status: CheckStatus::Unknown,
            last_checked_unix: None,
            last_seen_unix: None,
        }
    }
}

impl ServiceConfig {
    pub fn to_target(&self) -> ProbeTarget {
        ProbeTarget {
            id: self.id,
            owner_id: self.owner_id,
            kind: TargetKind::Service,
            name: self.name.clone(),
            host: self.url.clone(),
            port: self.port.filter(|p| *p > 0),
            method: self.method,
            active: self.active,
            category: self.category.clone(),
            mac: None,
            last_status: CheckStatus::Unknown,
            last_checked_unix: None,
            last_seen_unix: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a host:port socket address".to_string(),
            ));
        }

        validate_probe(&self.probe)?;
        validate_stats(&self.stats)?;
        validate_inventory(&self.inventory)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_probe(cfg: &ProbeConfig) -> Result<(), ConfigError> {
    if cfg.device_ports.is_empty() {
        return Err(ConfigError::Validation(
            "probe.device_ports must not be empty".to_string(),
        ));
    }
    if cfg.device_ports.contains(&0) || cfg.ping_method_ports.contains(&0) {
        return Err(ConfigError::Validation(
            "probe ports must be in range 1..65535".to_string(),
        ));
    }
    let timeouts = [
        ("device_attempt_timeout_ms", cfg.device_attempt_timeout_ms),
        ("ping_timeout_ms", cfg.ping_timeout_ms),
        ("tcp_timeout_ms", cfg.tcp_timeout_ms),
        ("ping_method_timeout_ms", cfg.ping_method_timeout_ms),
        ("http_timeout_ms", cfg.http_timeout_ms),
    ];
    for (name, value) in timeouts {
        if value == 0 {
            return Err(ConfigError::Validation(format!("probe.{name} must be > 0")));
        }
        if value > 10_000 {
            return Err(ConfigError::Validation(format!(
                "probe.{name} must be <= 10000"
            )));
        }
    }
    Ok(())
}

fn validate_stats(cfg: &StatsConfig) -> Result<(), ConfigError> {
    if cfg.stats_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "stats.stats_timeout_ms must be > 0".to_string(),
        ));
    }
    if cfg.history_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "stats.history_interval_secs must be >= 1".to_string(),
        ));
    }
    if cfg.history_capacity < 1 {
        return Err(ConfigError::Validation(
            "stats.history_capacity must be >= 1".to_string(),
        ));
    }
    if cfg.push_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "stats.push_interval_secs must be >= 1".to_string(),
        ));
    }
    if cfg.cpu_sample_window_ms < 100 {
        return Err(ConfigError::Validation(
            "stats.cpu_sample_window_ms must be >= 100".to_string(),
        ));
    }
    Ok(())
}

fn validate_inventory(cfg: &InventoryConfig) -> Result<(), ConfigError> {
    let mut ids = HashSet::new();
    for device in &cfg.devices {
        if device.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "inventory.devices[*].name must not be empty".to_string(),
            ));
        }
        if device.ip.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "device '{}' ip must not be empty",
                device.name
            )));
        }
        if !ids.insert(device.id) {
            return Err(ConfigError::Validation(format!(
                "device id {} must be unique",
                device.id
            )));
        }
    }

    let mut ids = HashSet::new();
    for service in &cfg.services {
        if service.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "inventory.services[*].name must not be empty".to_string(),
            ));
        }
        if service.url.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "service '{}' url must not be empty",
                service.name
            )));
        }
        if !ids.insert(service.id) {
            return Err(ConfigError::Validation(format!(
                "service id {} must be unique",
                service.id
            )));
        }
    }
    Ok(())
}

fn default_device_ports() -> Vec<u16> {
    vec![
        80, 443, 8080, 22, 3389, // web, ssh, rdp
        554, 8000, 8443, 37777, 34567, // rtsp and camera/NVR web ports
        9000, 5000, 21, 23,
    ]
}

const fn default_device_attempt_timeout_ms() -> u64 {
    300
}

const fn default_ping_fallback() -> bool {
    true
}

const fn default_ping_timeout_ms() -> u64 {
    1000
}

const fn default_tcp_timeout_ms() -> u64 {
    1000
}

fn default_ping_method_ports() -> Vec<u16> {
    vec![80, 443, 22]
}

const fn default_ping_method_timeout_ms() -> u64 {
    500
}

const fn default_http_timeout_ms() -> u64 {
    2000
}

fn default_user_agent() -> String {
    "Homelab-Monitor/1.0".to_string()
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

const fn default_stats_timeout_ms() -> u64 {
    3000
}

const fn default_cache_ttl_secs() -> u64 {
    5
}

const fn default_history_interval_secs() -> u64 {
    30
}

const fn default_history_capacity() -> usize {
    100
}

const fn default_cpu_sample_window_ms() -> u64 {
    200
}

const fn default_stop_grace_secs() -> u64 {
    10
}

const fn default_push_interval_secs() -> u64 {
    2
}

fn default_ping_host() -> String {
    "8.8.8.8".to_string()
}

fn default_speedtest_url() -> String {
    "https://speed.cloudflare.com/__down?bytes=10000000".to_string()
}

const fn default_speedtest_timeout_secs() -> u64 {
    60
}

const fn default_active() -> bool {
    true
}
