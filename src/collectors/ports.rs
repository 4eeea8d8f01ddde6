//! TCP-connect liveness heuristic with an OS `ping` fallback.
//!
//! "Any candidate port accepts a connection" means online. Hosts that
//! firewall every candidate port but still answer ICMP are only caught by
//! the ping fallback; hosts that block both read as offline.

use crate::config::ProbeConfig;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::task::JoinSet;
use tokio::time;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PortProbe {
    ports: Vec<u16>,
    attempt_timeout: Duration,
    ping_fallback: bool,
    ping_timeout: Duration,
}

impl PortProbe {
    pub fn new(
        ports: Vec<u16>,
        attempt_timeout: Duration,
        ping_fallback: bool,
        ping_timeout: Duration,
    ) -> Self {
        Self {
            ports,
            attempt_timeout,
            ping_fallback,
            ping_timeout,
        }
    }

    pub fn from_config(cfg: &ProbeConfig) -> Self {
        Self::new(
            cfg.device_ports.clone(),
            cfg.device_attempt_timeout(),
            cfg.ping_fallback,
            cfg.ping_timeout(),
        )
    }

    /// Races a connect to every candidate port; the first success wins and
    /// the rest are aborted. Falls back to `ping` when all attempts fail.
    pub async fn probe(&self, host: &str) -> bool {
        if any_port_open(host, &self.ports, self.attempt_timeout).await {
            return true;
        }
        if !self.ping_fallback {
            return false;
        }
        debug!(host, "no candidate port open, falling back to ping");
        os_ping(host, self.ping_timeout).await
    }
}

/// One connect attempt bounded by `timeout`. Refused, unreachable and timed
/// out all read as `false`.
pub async fn tcp_connect(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Concurrent connect to every port; returns on the first success without
/// waiting for slower attempts.
pub async fn any_port_open(host: &str, ports: &[u16], timeout: Duration) -> bool {
    let mut attempts = JoinSet::new();
    for &port in ports {
        let host = host.to_string();
        attempts.spawn(async move { tcp_connect(&host, port, timeout).await });
    }

    while let Some(joined) = attempts.join_next().await {
        if let Ok(true) = joined {
            attempts.abort_all();
            return true;
        }
    }
    false
}

/// Tries ports in order and reports the first one that accepts.
pub async fn first_open_port(host: &str, ports: &[u16], timeout: Duration) -> Option<u16> {
    for &port in ports {
        if tcp_connect(host, port, timeout).await {
            return Some(port);
        }
    }
    None
}

/// One-packet platform `ping`; the exit code is the answer.
pub async fn os_ping(host: &str, timeout: Duration) -> bool {
    let mut cmd = ping_command(host, timeout);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    // The utility enforces its own wait; the outer bound covers resolution.
    match time::timeout(timeout + Duration::from_secs(1), cmd.status()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(err)) => {
            debug!(host, error = %err, "ping could not be started");
            false
        }
        Err(_elapsed) => {
            debug!(host, "ping timed out");
            false
        }
    }
}

pub(crate) fn ping_command(host: &str, timeout: Duration) -> Command {
    let mut cmd = Command::new("ping");
    if cfg!(target_os = "windows") {
        let wait_ms = timeout.as_millis().max(1).to_string();
        cmd.args(["-n", "1", "-w", &wait_ms, host]);
    } else {
        let wait_secs = timeout.as_secs().max(1).to_string();
        cmd.args(["-c", "1", "-W", &wait_secs, host]);
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::closed_port;
    use std::time::Instant;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn any_open_port_wins() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = closed_port().await;

        let ok = any_port_open("127.0.0.1", &[closed, open], Duration::from_millis(300)).await;
        assert!(ok);
    }

    #[tokio::test]
    async fn all_closed_is_false_within_budget() {
        let ports = vec![closed_port().await, closed_port().await];
        let timeout = Duration::from_millis(300);

        let start = Instant::now();
        assert!(!any_port_open("127.0.0.1", &ports, timeout).await);
        assert!(start.elapsed() < timeout + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn probe_without_fallback_reports_offline() {
        let probe = PortProbe::new(
            vec![closed_port().await],
            Duration::from_millis(200),
            false,
            Duration::from_secs(1),
        );
        assert!(!probe.probe("127.0.0.1").await);
    }

    #[tokio::test]
    async fn sequential_probe_reports_first_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = closed_port().await;

        let found = first_open_port("127.0.0.1", &[closed, open], Duration::from_millis(300)).await;
        assert_eq!(found, Some(open));
        assert_eq!(
            first_open_port("127.0.0.1", &[closed], Duration::from_millis(300)).await,
            None
        );
    }

    #[test]
    fn ping_command_sends_one_packet() {
        let cmd = ping_command("10.0.0.1", Duration::from_secs(1));
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.contains(&"1".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("10.0.0.1"));
    }
}
