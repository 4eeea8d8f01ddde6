//! Container runtime seam and a minimal Docker Engine API client speaking
//! HTTP/1.0 over the local Unix socket.

use crate::model::{Container, ContainerMount, ContainerPort};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
#[cfg(unix)]
use tokio::io::{AsyncReadExt, AsyncWriteExt};
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime is not available")]
    Unavailable,
    #[error("container {0} not found")]
    NotFound(String),
    #[error("runtime returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("runtime socket error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to decode runtime response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("runtime call timed out")]
    Timeout,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;
    /// Every container, running or not. `stats` is left empty.
    async fn list(&self) -> Result<Vec<Container>, RuntimeError>;
    async fn inspect(&self, id: &str) -> Result<Container, RuntimeError>;
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;
    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;
    async fn restart(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;
    /// One non-streamed stats sample; `precpu_stats` holds the previous read.
    async fn stats(&self, id: &str) -> Result<DockerStats, RuntimeError>;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerStats {
    #[serde(default)]
    pub cpu_stats: DockerCpuStats,
    #[serde(default)]
    pub precpu_stats: DockerCpuStats,
    #[serde(default)]
    pub memory_stats: DockerMemoryStats,
    #[serde(default)]
    pub networks: Option<HashMap<String, DockerNetworkStats>>,
    #[serde(default)]
    pub blkio_stats: DockerBlkioStats,
    #[serde(default)]
    pub pids_stats: DockerPidsStats,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerCpuStats {
    #[serde(default)]
    pub cpu_usage: DockerCpuUsage,
    #[serde(default)]
    pub system_cpu_usage: Option<u64>,
    #[serde(default)]
    pub online_cpus: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerCpuUsage {
    #[serde(default)]
    pub total_usage: u64,
    #[serde(default)]
    pub percpu_usage: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerMemoryStats {
    #[serde(default)]
    pub usage: u64,
    #[serde(default)]
    pub limit: u64,
    /// cgroup v1 reports `cache`, v2 only the inactive-file counters.
    #[serde(default)]
    pub stats: Option<HashMap<String, u64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerNetworkStats {
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerBlkioStats {
    #[serde(default)]
    pub io_service_bytes_recursive: Option<Vec<DockerBlkioEntry>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerBlkioEntry {
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub value: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerPidsStats {
    #[serde(default)]
    pub current: Option<u64>,
}

/// Entry of `GET /containers/json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    image: String,
    #[serde(rename = "ImageID", default)]
    image_id: String,
    #[serde(default)]
    command: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    state: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    ports: Vec<ListPort>,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
    #[serde(default)]
    host_config: Option<HostConfig>,
    #[serde(default)]
    mounts: Vec<MountEntry>,
}

#[derive(Debug, Deserialize)]
struct ListPort {
    #[serde(rename = "IP", default)]
    ip: String,
    #[serde(rename = "PrivatePort", default)]
    private_port: u16,
    #[serde(rename = "PublicPort", default)]
    public_port: u16,
    #[serde(rename = "Type", default)]
    protocol: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    #[serde(default)]
    network_mode: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MountEntry {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    destination: String,
    #[serde(default)]
    mode: String,
    #[serde(rename = "RW", default)]
    rw: bool,
}

/// Body of `GET /containers/{id}/json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    created: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    image: String,
    #[serde(default)]
    state: InspectState,
    #[serde(default)]
    config: InspectConfig,
    #[serde(default)]
    host_config: Option<HostConfig>,
    #[serde(default)]
    mounts: Vec<MountEntry>,
    #[serde(default)]
    network_settings: InspectNetwork,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    exit_code: i64,
    #[serde(default)]
    started_at: String,
    #[serde(default)]
    finished_at: String,
    #[serde(default)]
    health: Option<InspectHealth>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHealth {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<PortBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: String,
}

pub struct DockerClient {
    socket_path: String,
}

impl DockerClient {
    pub fn new(socket_path: &str) -> Self {
        Self {
            socket_path: socket_path.to_string(),
        }
    }

    async fn request(&self, method: &str, path: &str) -> Result<(u16, String), RuntimeError> {
        let request = format!(
            "{method} {path} HTTP/1.0\r\nHost: localhost\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
        );
        let raw = self.roundtrip(&request).await?;
        let (status, body) = parse_response(&raw)?;
        debug!(method, path, status, "docker api call");
        Ok((status, body))
    }

    /// The write half stays open until the daemon closes the connection;
    /// dockerd cancels a request whose client half-closes early.
    #[cfg(unix)]
    async fn roundtrip(&self, request: &str) -> Result<Vec<u8>, RuntimeError> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        stream.write_all(request.as_bytes()).await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok(response)
    }

    #[cfg(not(unix))]
    async fn roundtrip(&self, _request: &str) -> Result<Vec<u8>, RuntimeError> {
        Err(RuntimeError::Unavailable)
    }

    async fn command(&self, path: &str, id: &str) -> Result<(), RuntimeError> {
        let (status, body) = self.request("POST", path).await?;
        // 304: already in the requested state.
        if status == 304 {
            return Ok(());
        }
        check_status(status, &body, id).map(|_| ())
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn ping(&self) -> Result<(), RuntimeError> {
        let (status, body) = self.request("GET", "/_ping").await?;
        check_status(status, &body, "").map(|_| ())
    }

    async fn list(&self) -> Result<Vec<Container>, RuntimeError> {
        let (status, body) = self.request("GET", "/containers/json?all=true").await?;
        let body = check_status(status, &body, "")?;
        parse_list(body)
    }

    async fn inspect(&self, id: &str) -> Result<Container, RuntimeError> {
        let (status, body) = self
            .request("GET", &format!("/containers/{id}/json"))
            .await?;
        let body = check_status(status, &body, id)?;
        parse_inspect(body, SystemTime::now())
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.command(&format!("/containers/{id}/start"), id).await
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let t = grace.as_secs();
        self.command(&format!("/containers/{id}/stop?t={t}"), id)
            .await
    }

    async fn restart(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let t = grace.as_secs();
        self.command(&format!("/containers/{id}/restart?t={t}"), id)
            .await
    }

    async fn stats(&self, id: &str) -> Result<DockerStats, RuntimeError> {
        let (status, body) = self
            .request("GET", &format!("/containers/{id}/stats?stream=false"))
            .await?;
        let body = check_status(status, &body, id)?;
        Ok(serde_json::from_str(body)?)
    }
}

/// Splits a raw HTTP/1.x response into its status code and body.
fn parse_response(raw: &[u8]) -> Result<(u16, String), RuntimeError> {
    let text = String::from_utf8_lossy(raw);
    let Some(split) = text.find("\r\n\r\n") else {
        return Err(invalid("response has no header terminator"));
    };
    let status = text
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| invalid("response has no status line"))?;
    Ok((status, text[split + 4..].to_string()))
}

fn check_status<'a>(status: u16, body: &'a str, id: &str) -> Result<&'a str, RuntimeError> {
    match status {
        200..=299 => Ok(body),
        404 => Err(RuntimeError::NotFound(id.to_string())),
        _ => {
            let message = serde_json::from_str::<ApiMessage>(body)
                .map(|m| m.message)
                .unwrap_or_else(|_| body.trim().to_string());
            Err(RuntimeError::Api { status, message })
        }
    }
}

fn invalid(msg: &str) -> RuntimeError {
    RuntimeError::Io(io::Error::new(io::ErrorKind::InvalidData, msg.to_string()))
}

fn parse_list(body: &str) -> Result<Vec<Container>, RuntimeError> {
    let entries: Vec<ListEntry> = serde_json::from_str(body)?;
    Ok(entries
        .into_iter()
        .map(|e| {
            let health = health_from_status(&e.status);
            Container {
                id: short_id(&e.id),
                name: e
                    .names
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| short_id(&e.id)),
                image: e.image,
                image_id: e.image_id,
                command: e.command,
                created_unix: e.created,
                state: e.state,
                status: e.status,
                ports: e
                    .ports
                    .into_iter()
                    .map(|p| ContainerPort {
                        ip: p.ip,
                        private_port: p.private_port,
                        public_port: p.public_port,
                        protocol: p.protocol,
                    })
                    .collect(),
                labels: e.labels.unwrap_or_default(),
                network_mode: e.host_config.unwrap_or_default().network_mode,
                mounts: e.mounts.into_iter().map(ContainerMount::from).collect(),
                health,
                stats: None,
            }
        })
        .collect())
}

fn parse_inspect(body: &str, now: SystemTime) -> Result<Container, RuntimeError> {
    let e: InspectEntry = serde_json::from_str(body)?;

    let mut ports: Vec<ContainerPort> = e
        .network_settings
        .ports
        .unwrap_or_default()
        .into_iter()
        .flat_map(|(spec, bindings)| {
            let (private_port, protocol) = match spec.split_once('/') {
                Some((port, proto)) => (port.parse().unwrap_or(0), proto.to_string()),
                None => (spec.parse().unwrap_or(0), "tcp".to_string()),
            };
            let bindings = bindings.unwrap_or_default();
            if bindings.is_empty() {
                return vec![ContainerPort {
                    ip: String::new(),
                    private_port,
                    public_port: 0,
                    protocol,
                }];
            }
            bindings
                .into_iter()
                .map(|b| ContainerPort {
                    ip: b.host_ip,
                    private_port,
                    public_port: b.host_port.parse().unwrap_or(0),
                    protocol: protocol.clone(),
                })
                .collect()
        })
        .collect();
    ports.sort_by(|a, b| {
        (a.private_port, &a.protocol, a.public_port).cmp(&(b.private_port, &b.protocol, b.public_port))
    });

    let command = std::iter::once(e.path.as_str())
        .chain(e.args.iter().map(String::as_str))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    Ok(Container {
        id: short_id(&e.id),
        name: e.name.trim_start_matches('/').to_string(),
        image: e.config.image,
        image_id: e.image,
        command,
        created_unix: unix_seconds(&e.created),
        status: status_text(&e.state, now),
        state: e.state.status,
        ports,
        labels: e.config.labels.unwrap_or_default(),
        network_mode: e.host_config.unwrap_or_default().network_mode,
        mounts: e.mounts.into_iter().map(ContainerMount::from).collect(),
        health: e.state.health.map(|h| h.status).unwrap_or_default(),
        stats: None,
    })
}

impl From<MountEntry> for ContainerMount {
    fn from(m: MountEntry) -> Self {
        Self {
            kind: m.kind,
            name: m.name,
            source: m.source,
            destination: m.destination,
            mode: m.mode,
            rw: m.rw,
        }
    }
}

pub fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}

fn health_from_status(status: &str) -> String {
    if status.contains("(unhealthy)") {
        "unhealthy".to_string()
    } else if status.contains("(healthy)") {
        "healthy".to_string()
    } else if status.contains("health: starting") {
        "starting".to_string()
    } else {
        String::new()
    }
}

fn parse_timestamp(value: &str) -> Option<SystemTime> {
    humantime::parse_rfc3339_weak(value.trim()).ok()
}

fn unix_seconds(value: &str) -> i64 {
    parse_timestamp(value)
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn elapsed_since(value: &str, now: SystemTime) -> Option<String> {
    let then = parse_timestamp(value)?;
    let secs = now.duration_since(then).ok()?.as_secs();
    Some(humantime::format_duration(Duration::from_secs(secs)).to_string())
}

/// "Up 3h 2m", "Exited (1) 5m ago", or the capitalised state otherwise.
fn status_text(state: &InspectState, now: SystemTime) -> String {
    match state.status.as_str() {
        "running" | "paused" => {
            let mut text = match elapsed_since(&state.started_at, now) {
                Some(up) => format!("Up {up}"),
                None => "Up".to_string(),
            };
            if state.status == "paused" {
                text.push_str(" (Paused)");
            }
            text
        }
        "exited" | "dead" => match elapsed_since(&state.finished_at, now) {
            Some(ago) => format!("Exited ({}) {ago} ago", state.exit_code),
            None => format!("Exited ({})", state.exit_code),
        },
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => "Unknown".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_BODY: &str = r#"[
      {"Id":"4f66ad9a0b2e7c1d9e8f","Names":["/jellyfin"],"Image":"jellyfin/jellyfin",
       "ImageID":"sha256:abc","Command":"/jellyfin/jellyfin","Created":1700000000,
       "State":"running","Status":"Up 2 hours (healthy)",
       "Ports":[{"IP":"0.0.0.0","PrivatePort":8096,"PublicPort":8096,"Type":"tcp"}],
       "Labels":{"com.docker.compose.project":"media"},
       "HostConfig":{"NetworkMode":"bridge"},
       "Mounts":[{"Type":"bind","Source":"/srv/media","Destination":"/media","Mode":"ro","RW":false}]},
      {"Id":"short","Names":[],"Image":"busybox","State":"exited","Status":"Exited (0) 3 days ago",
       "Labels":null}
    ]"#;

    const INSPECT_BODY: &str = r#"{
      "Id":"4f66ad9a0b2e7c1d9e8f","Name":"/jellyfin","Created":"2024-01-01T00:00:00.123456789Z",
      "Path":"/jellyfin/jellyfin","Args":["--datadir","/config"],"Image":"sha256:abc",
      "State":{"Status":"exited","ExitCode":137,"StartedAt":"2024-01-01T00:00:00Z",
               "FinishedAt":"2024-01-01T10:00:00Z"},
      "Config":{"Image":"jellyfin/jellyfin","Labels":{"tier":"media"}},
      "HostConfig":{"NetworkMode":"host"},
      "Mounts":[],
      "NetworkSettings":{"Ports":{"8096/tcp":[{"HostIp":"0.0.0.0","HostPort":"8096"}],"1900/udp":null}}
    }"#;

    #[test]
    fn response_is_split_into_status_and_body() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Type: application/json\r\n\r\n[]";
        let (status, body) = parse_response(raw).unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, "[]");
        assert!(parse_response(b"garbage").is_err());
    }

    #[test]
    fn error_statuses_are_typed() {
        assert!(matches!(
            check_status(404, "{\"message\":\"No such container\"}", "abc"),
            Err(RuntimeError::NotFound(id)) if id == "abc"
        ));
        match check_status(500, "{\"message\":\"boom\"}", "abc") {
            Err(RuntimeError::Api { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn list_entries_are_normalised() {
        let containers = parse_list(LIST_BODY).unwrap();
        assert_eq!(containers.len(), 2);

        let jf = &containers[0];
        assert_eq!(jf.id, "4f66ad9a0b2e");
        assert_eq!(jf.name, "jellyfin");
        assert_eq!(jf.health, "healthy");
        assert_eq!(jf.network_mode, "bridge");
        assert_eq!(jf.ports[0].public_port, 8096);
        assert!(!jf.mounts[0].rw);
        assert!(jf.is_running());

        let bb = &containers[1];
        assert_eq!(bb.id, "short");
        assert_eq!(bb.name, "short");
        assert!(bb.labels.is_empty());
        assert_eq!(bb.health, "");
    }

    #[test]
    fn inspect_builds_human_status_and_ports() {
        let now = humantime::parse_rfc3339("2024-01-01T10:05:00Z").unwrap();
        let container = parse_inspect(INSPECT_BODY, now).unwrap();

        assert_eq!(container.name, "jellyfin");
        assert_eq!(container.image, "jellyfin/jellyfin");
        assert_eq!(container.command, "/jellyfin/jellyfin --datadir /config");
        assert_eq!(container.status, "Exited (137) 5m ago");
        assert_eq!(container.state, "exited");
        assert_eq!(container.created_unix, 1_704_067_200);
        assert_eq!(container.ports.len(), 2);
        assert_eq!(container.ports[0].private_port, 1900);
        assert_eq!(container.ports[1].public_port, 8096);
    }

    #[test]
    fn running_status_reports_uptime() {
        let state = InspectState {
            status: "running".to_string(),
            started_at: "2024-01-01T00:00:00Z".to_string(),
            ..InspectState::default()
        };
        let now = humantime::parse_rfc3339("2024-01-01T03:02:00Z").unwrap();
        assert_eq!(status_text(&state, now), "Up 3h 2m");

        let created = InspectState {
            status: "created".to_string(),
            ..InspectState::default()
        };
        assert_eq!(status_text(&created, now), "Created");
    }

    #[test]
    fn stats_tolerate_missing_sections() {
        let stats: DockerStats = serde_json::from_str(
            r#"{"cpu_stats":{"cpu_usage":{"total_usage":10},"system_cpu_usage":100},
                "memory_stats":{"usage":2048,"limit":4096,"stats":{"inactive_file":1024}}}"#,
        )
        .unwrap();
        assert_eq!(stats.cpu_stats.cpu_usage.total_usage, 10);
        assert_eq!(stats.cpu_stats.online_cpus, None);
        assert_eq!(stats.precpu_stats.system_cpu_usage, None);
        assert!(stats.networks.is_none());
        assert_eq!(stats.pids_stats.current, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn client_talks_over_unix_socket() {
        use tokio::net::UnixListener;

        let path = std::env::temp_dir().join(format!("labwatch-docker-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            for _ in 0..2 {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0_u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    assert!(n > 0, "request ended before its headers");
                    request.extend_from_slice(&buf[..n]);
                }
                // Like dockerd: a client that half-closes gets an empty body.
                let hung_up = matches!(
                    tokio::time::timeout(Duration::from_millis(100), socket.read(&mut buf)).await,
                    Ok(Ok(0))
                );
                let request = String::from_utf8_lossy(&request).to_string();
                assert!(request.contains("Connection: close"));
                let response = if hung_up {
                    "HTTP/1.0 200 OK\r\n\r\n".to_string()
                } else if request.starts_with("GET /containers/json?all=true") {
                    format!("HTTP/1.0 200 OK\r\nContent-Type: application/json\r\n\r\n{LIST_BODY}")
                } else {
                    "HTTP/1.0 404 Not Found\r\n\r\n{\"message\":\"No such container\"}".to_string()
                };
                socket.write_all(response.as_bytes()).await.unwrap();
            }
        });

        let client = DockerClient::new(path.to_str().unwrap());
        let containers = client.list().await.unwrap();
        assert_eq!(containers.len(), 2);
        assert!(matches!(
            client.start("missing").await,
            Err(RuntimeError::NotFound(_))
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_socket_is_an_io_error() {
        let client = DockerClient::new("/nonexistent/labwatch/docker.sock");
        assert!(client.ping().await.is_err());
    }
}
