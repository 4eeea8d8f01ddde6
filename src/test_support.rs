use crate::docker::{ContainerRuntime, DockerStats, RuntimeError};
use crate::model::{CheckMethod, CheckStatus, Container, ProbeTarget, TargetKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serves every request with `status`. HEAD requests get their connection
/// dropped when `reject_head` is set.
pub async fn spawn_http(status: u16, reject_head: bool, delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0_u8; 2048];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                if reject_head && request.starts_with("HEAD") {
                    return;
                }
                tokio::time::sleep(delay).await;
                let response = format!(
                    "HTTP/1.1 {status} Status\r\nLocation: /elsewhere\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

pub fn service(id: u64, name: &str, host: &str, method: CheckMethod) -> ProbeTarget {
    ProbeTarget {
        id,
        owner_id: 1,
        kind: TargetKind::Service,
        name: name.to_string(),
        host: host.to_string(),
        port: None,
        method,
        active: true,
        category: None,
        mac: None,
        last_status: CheckStatus::Unknown,
        last_checked_unix: None,
        last_seen_unix: None,
    }
}

pub fn device(id: u64, name: &str, ip: &str) -> ProbeTarget {
    ProbeTarget {
        kind: TargetKind::Device,
        method: CheckMethod::Ping,
        ..service(id, name, ip, CheckMethod::Ping)
    }
}

/// Scripted container runtime counting the stats reads it serves.
pub struct FakeRuntime {
    pub containers: Vec<Container>,
    pub stats: Option<DockerStats>,
    pub stats_delay: Duration,
    pub stats_calls: AtomicUsize,
    pub actions: std::sync::Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new(containers: Vec<Container>, stats: Option<DockerStats>) -> Self {
        Self {
            containers,
            stats,
            stats_delay: Duration::ZERO,
            stats_calls: AtomicUsize::new(0),
            actions: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn stats_calls(&self) -> usize {
        self.stats_calls.load(Ordering::SeqCst)
    }

    fn find(&self, id: &str) -> Result<Container, RuntimeError> {
        self.containers
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    fn record(&self, action: &str, id: &str) -> Result<(), RuntimeError> {
        self.find(id)?;
        self.actions.lock().unwrap().push(format!("{action}:{id}"));
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Container>, RuntimeError> {
        Ok(self.containers.clone())
    }

    async fn inspect(&self, id: &str) -> Result<Container, RuntimeError> {
        self.find(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.record("start", id)
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.record("stop", id)
    }

    async fn restart(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.record("restart", id)
    }

    async fn stats(&self, id: &str) -> Result<DockerStats, RuntimeError> {
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.stats_delay).await;
        match &self.stats {
            Some(stats) => Ok(stats.clone()),
            None => Err(RuntimeError::Api {
                status: 500,
                message: format!("no stats for {id}"),
            }),
        }
    }
}

pub fn container(id: &str, name: &str, state: &str) -> Container {
    Container {
        id: id.to_string(),
        name: name.to_string(),
        image: "busybox".to_string(),
        image_id: String::new(),
        command: String::new(),
        created_unix: 0,
        state: state.to_string(),
        status: String::new(),
        ports: Vec::new(),
        labels: HashMap::new(),
        network_mode: "bridge".to_string(),
        mounts: Vec::new(),
        health: String::new(),
        stats: None,
    }
}

/// 200 ms of container CPU over 1 s of host CPU on 2 CPUs, 512 MiB of a
/// 1 GiB limit with 256 MiB page cache.
pub fn docker_stats() -> DockerStats {
    serde_json::from_str(
        r#"{
          "cpu_stats":{"cpu_usage":{"total_usage":1200000000},"system_cpu_usage":11000000000,"online_cpus":2},
          "precpu_stats":{"cpu_usage":{"total_usage":1000000000},"system_cpu_usage":10000000000},
          "memory_stats":{"usage":536870912,"limit":1073741824,"stats":{"cache":268435456}},
          "networks":{"eth0":{"rx_bytes":100,"tx_bytes":10},"eth1":{"rx_bytes":50,"tx_bytes":5}},
          "blkio_stats":{"io_service_bytes_recursive":[
            {"op":"Read","value":4096},{"op":"Write","value":1024},
            {"op":"read","value":4096},{"op":"Total","value":9216}]},
          "pids_stats":{"current":7}
        }"#,
    )
    .unwrap()
}
