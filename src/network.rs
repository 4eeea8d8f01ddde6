//! Internet-facing diagnostics: latency to a well-known host and a
//! download speed test.

use crate::collectors::ports::ping_command;
use crate::config::NetworkConfig;
use crate::model::now_unix;
use regex::Regex;
use reqwest::Client;
use serde::Serialize;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::time;
use tracing::debug;

const PING_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyReport {
    pub host: String,
    pub reachable: bool,
    pub latency_ms: Option<f64>,
    pub measured_at_unix: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedReport {
    pub url: String,
    pub bytes: u64,
    pub seconds: f64,
    pub download_mbps: f64,
    pub measured_at_unix: i64,
}

pub struct NetworkTools {
    client: Client,
    ping_host: String,
    speedtest_url: String,
    speedtest_timeout: Duration,
}

impl NetworkTools {
    pub fn new(cfg: &NetworkConfig, user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(user_agent.to_string())
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            ping_host: cfg.ping_host.clone(),
            speedtest_url: cfg.speedtest_url.clone(),
            speedtest_timeout: cfg.speedtest_timeout(),
        })
    }

    /// One OS ping; the round-trip time is read from its output.
    pub async fn latency(&self) -> LatencyReport {
        let mut cmd = ping_command(&self.ping_host, PING_WAIT);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let (reachable, latency_ms) =
            match time::timeout(PING_WAIT + Duration::from_secs(1), cmd.output()).await {
                Ok(Ok(output)) => {
                    let text = String::from_utf8_lossy(&output.stdout);
                    (output.status.success(), parse_ping_time(&text))
                }
                Ok(Err(err)) => {
                    debug!(host = %self.ping_host, error = %err, "ping could not be started");
                    (false, None)
                }
                Err(_elapsed) => (false, None),
            };

        LatencyReport {
            host: self.ping_host.clone(),
            reachable,
            latency_ms,
            measured_at_unix: now_unix(),
        }
    }

    pub async fn speed_test(&self) -> Result<SpeedReport, reqwest::Error> {
        let start = Instant::now();
        let body = self
            .client
            .get(&self.speedtest_url)
            .timeout(self.speedtest_timeout)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let seconds = start.elapsed().as_secs_f64().max(0.001);
        let bytes = body.len() as u64;
        debug!(bytes, seconds, "speed test finished");

        Ok(SpeedReport {
            url: self.speedtest_url.clone(),
            bytes,
            seconds,
            download_mbps: mbps(bytes, seconds),
            measured_at_unix: now_unix(),
        })
    }
}

pub fn mbps(bytes: u64, seconds: f64) -> f64 {
    (bytes as f64 * 8.0 / 1_000_000.0) / seconds.max(0.001)
}

/// Accepts `time=12.3 ms`, `time=12.3ms` and `time<1ms`.
pub fn parse_ping_time(output: &str) -> Option<f64> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"[Tt]ime[=<]([0-9.]+) ?ms").ok())
        .as_ref()?;
    re.captures(output)?.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_http;

    #[test]
    fn parses_unix_and_windows_ping_output() {
        let linux = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms";
        let windows = "Reply from 8.8.8.8: bytes=32 time<1ms TTL=117";
        let mac = "64 bytes from 8.8.8.8: icmp_seq=0 ttl=117 time=9.871 ms";

        assert_eq!(parse_ping_time(linux), Some(12.3));
        assert_eq!(parse_ping_time(windows), Some(1.0));
        assert_eq!(parse_ping_time(mac), Some(9.871));
        assert_eq!(parse_ping_time("Request timed out."), None);
    }

    #[test]
    fn throughput_is_megabits_per_second() {
        assert!((mbps(10_000_000, 1.0) - 80.0).abs() < 1e-9);
        assert!(mbps(1, 0.0).is_finite());
    }

    #[tokio::test]
    async fn speed_test_reports_downloaded_bytes() {
        let addr = spawn_http(200, false, Duration::ZERO).await;
        let cfg = NetworkConfig {
            speedtest_url: format!("http://{addr}/"),
            ..NetworkConfig::default()
        };
        let tools = NetworkTools::new(&cfg, "labwatch-test").unwrap();

        let report = tools.speed_test().await.unwrap();
        assert_eq!(report.bytes, 0);
        assert!(report.download_mbps >= 0.0);
    }

    #[tokio::test]
    async fn speed_test_surfaces_http_errors() {
        let addr = spawn_http(503, false, Duration::ZERO).await;
        let cfg = NetworkConfig {
            speedtest_url: format!("http://{addr}/"),
            ..NetworkConfig::default()
        };
        let tools = NetworkTools::new(&cfg, "labwatch-test").unwrap();
        assert!(tools.speed_test().await.is_err());
    }
}
