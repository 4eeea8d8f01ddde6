use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

pub type TargetId = u64;
pub type OwnerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Device,
    Service,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Device => f.write_str("device"),
            TargetKind::Service => f.write_str("service"),
        }
    }
}

/// How a service target is checked. Resolved once when the inventory is
/// loaded; everything past that boundary matches on the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CheckMethod {
    #[default]
    Http,
    Tcp,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown check method '{0}'")]
pub struct UnknownMethod(pub String);

impl FromStr for CheckMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "HTTP" | "HTTPS" | "GET" | "HEAD" | "POST" => Ok(CheckMethod::Http),
            "TCP" => Ok(CheckMethod::Tcp),
            "PING" => Ok(CheckMethod::Ping),
            _ => Err(UnknownMethod(s.to_string())),
        }
    }
}

impl TryFrom<String> for CheckMethod {
    type Error = UnknownMethod;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CheckMethod> for String {
    fn from(value: CheckMethod) -> Self {
        value.as_str().to_string()
    }
}

impl CheckMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckMethod::Http => "HTTP",
            CheckMethod::Tcp => "TCP",
            CheckMethod::Ping => "PING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Online,
    Offline,
    /// Reachable but rejecting (HTTP 4xx) or not checkable at all.
    Error,
    Disabled,
    #[default]
    Unknown,
}

impl CheckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckStatus::Online => "online",
            CheckStatus::Offline => "offline",
            CheckStatus::Error => "error",
            CheckStatus::Disabled => "disabled",
            CheckStatus::Unknown => "unknown",
        }
    }
}

/// An inventory entity as read from the store. The engine never mutates
/// one; status changes go back through `TargetStore::update_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeTarget {
    pub id: TargetId,
    pub owner_id: OwnerId,
    pub kind: TargetKind,
    pub name: String,
    /// Device IP/hostname, or service URL (HTTP) / host (TCP, PING).
    pub host: String,
    pub port: Option<u16>,
    pub method: CheckMethod,
    pub active: bool,
    pub category: Option<String>,
    pub mac: Option<String>,
    pub last_status: CheckStatus,
    pub last_checked_unix: Option<i64>,
    pub last_seen_unix: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("invalid url '{url}': {reason}")]
    Url { url: String, reason: String },
    #[error("tcp target '{0}' has no port")]
    MissingPort(String),
}

impl ProbeTarget {
    /// Rejects addresses no check could ever succeed against. Applied at the
    /// lookup boundary so a typo is reported as an input error, not "offline".
    pub fn validate_address(&self) -> Result<(), AddressError> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(AddressError::Empty);
        }
        if self.kind == TargetKind::Device {
            return Ok(());
        }
        match self.method {
            CheckMethod::Http => {
                let url = normalize_url(host);
                reqwest::Url::parse(&url)
                    .map(|_| ())
                    .map_err(|err| AddressError::Url {
                        url,
                        reason: err.to_string(),
                    })
            }
            CheckMethod::Tcp => {
                if self.port.is_some() || split_host_port(host).is_some() {
                    Ok(())
                } else {
                    Err(AddressError::MissingPort(host.to_string()))
                }
            }
            CheckMethod::Ping => Ok(()),
        }
    }
}

/// Prefixes bare hosts with `http://`.
pub fn normalize_url(address: &str) -> String {
    let address = address.trim();
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

/// Splits `host:port`, leaving bare IPv6 literals alone.
pub fn split_host_port(address: &str) -> Option<(&str, u16)> {
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?.parse().ok()?;
        return Some((host, port));
    }
    let (host, port) = address.rsplit_once(':')?;
    if host.contains(':') {
        return None;
    }
    Some((host, port.parse().ok()?))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub target_id: TargetId,
    pub status: CheckStatus,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub checked_at_unix: i64,
}

/// Target record paired with the outcome reported for it in a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetReport {
    pub target: ProbeTarget,
    pub check: CheckResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSample {
    pub cpu: CpuSample,
    pub memory: MemorySample,
    pub disks: Vec<DiskSample>,
    pub network: Vec<NetSample>,
    pub uptime_seconds: u64,
    pub sampled_at_unix: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuSample {
    pub usage_percent: f64,
    pub per_core_percent: Vec<f64>,
    pub model_name: String,
    pub frequency_mhz: u64,
    pub physical_cores: usize,
    pub logical_cores: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemorySample {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
    pub swap_free_bytes: u64,
    pub swap_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskSample {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub used_percent: f64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetSample {
    pub iface: String,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errors_in: u64,
    pub errors_out: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub timestamp_unix: i64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub network_in: u64,
    pub network_out: u64,
}

impl From<&ResourceSample> for HistoryPoint {
    fn from(sample: &ResourceSample) -> Self {
        Self {
            timestamp_unix: sample.sampled_at_unix,
            cpu_usage: sample.cpu.usage_percent,
            memory_usage: sample.memory.used_percent,
            disk_usage: sample.disks.first().map(|d| d.used_percent).unwrap_or(0.0),
            network_in: sample.network.iter().map(|n| n.bytes_recv).sum(),
            network_out: sample.network.iter().map(|n| n.bytes_sent).sum(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
    pub pids: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub command: String,
    pub created_unix: i64,
    pub state: String,
    pub status: String,
    pub ports: Vec<ContainerPort>,
    pub labels: HashMap<String, String>,
    pub network_mode: String,
    pub mounts: Vec<ContainerMount>,
    pub health: String,
    pub stats: Option<ContainerStats>,
}

impl Container {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerPort {
    pub ip: String,
    pub private_port: u16,
    pub public_port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerMount {
    pub kind: String,
    pub name: String,
    pub source: String,
    pub destination: String,
    pub mode: String,
    pub rw: bool,
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(method: CheckMethod, host: &str, port: Option<u16>) -> ProbeTarget {
        ProbeTarget {
            id: 1,
            owner_id: 1,
            kind: TargetKind::Service,
            name: "svc".to_string(),
            host: host.to_string(),
            port,
            method,
            active: true,
            category: None,
            mac: None,
            last_status: CheckStatus::Unknown,
            last_checked_unix: None,
            last_seen_unix: None,
        }
    }

    #[test]
    fn method_parses_http_verbs_and_heuristics() {
        assert_eq!("GET".parse::<CheckMethod>().unwrap(), CheckMethod::Http);
        assert_eq!("head".parse::<CheckMethod>().unwrap(), CheckMethod::Http);
        assert_eq!("".parse::<CheckMethod>().unwrap(), CheckMethod::Http);
        assert_eq!("tcp".parse::<CheckMethod>().unwrap(), CheckMethod::Tcp);
        assert_eq!("PING".parse::<CheckMethod>().unwrap(), CheckMethod::Ping);
        assert!("ICMP".parse::<CheckMethod>().is_err());
    }

    #[test]
    fn split_host_port_handles_ipv6() {
        assert_eq!(split_host_port("nas.lan:5000"), Some(("nas.lan", 5000)));
        assert_eq!(split_host_port("[::1]:22"), Some(("::1", 22)));
        assert_eq!(split_host_port("::1"), None);
        assert_eq!(split_host_port("nas.lan"), None);
    }

    #[test]
    fn tcp_target_without_port_is_invalid() {
        let target = service(CheckMethod::Tcp, "nas.lan", None);
        assert_eq!(
            target.validate_address(),
            Err(AddressError::MissingPort("nas.lan".to_string()))
        );
        assert!(service(CheckMethod::Tcp, "nas.lan:22", None)
            .validate_address()
            .is_ok());
        assert!(service(CheckMethod::Tcp, "nas.lan", Some(22))
            .validate_address()
            .is_ok());
    }

    #[test]
    fn http_target_with_bare_host_is_normalized() {
        assert!(service(CheckMethod::Http, "jellyfin.lan:8096", None)
            .validate_address()
            .is_ok());
        assert!(matches!(
            service(CheckMethod::Http, "http://exa mple", None).validate_address(),
            Err(AddressError::Url { .. })
        ));
        assert_eq!(
            service(CheckMethod::Ping, "  ", None).validate_address(),
            Err(AddressError::Empty)
        );
    }
}
