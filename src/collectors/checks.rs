use crate::collectors::ports::{first_open_port, tcp_connect, PortProbe};
use crate::config::ProbeConfig;
use crate::metrics::Metrics;
use crate::model::{
    normalize_url, now_unix, split_host_port, CheckMethod, CheckResult, CheckStatus, ProbeTarget,
    TargetKind,
};
use reqwest::{redirect, Client};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;
use tracing::{debug, warn};

/// Performs exactly one check per call and always yields a `CheckResult`.
pub struct HealthChecker {
    client: Client,
    device_probe: PortProbe,
    tcp_timeout: Duration,
    ping_ports: Vec<u16>,
    ping_timeout: Duration,
    http_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl HealthChecker {
    pub fn new(cfg: &ProbeConfig, metrics: Arc<Metrics>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .redirect(redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .timeout(cfg.http_timeout())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            device_probe: PortProbe::from_config(cfg),
            tcp_timeout: cfg.tcp_timeout(),
            ping_ports: cfg.ping_method_ports.clone(),
            ping_timeout: cfg.ping_method_timeout(),
            http_timeout: cfg.http_timeout(),
            metrics,
        })
    }

    pub async fn check(&self, target: &ProbeTarget) -> CheckResult {
        if !target.active {
            let result = CheckResult {
                target_id: target.id,
                status: CheckStatus::Disabled,
                status_code: None,
                latency_ms: 0,
                checked_at_unix: now_unix(),
            };
            self.metrics.observe_check(target.kind, &result);
            return result;
        }

        self.metrics.inc_network_call();
        let start = Instant::now();
        let (status, status_code) = match (target.kind, target.method) {
            (TargetKind::Device, _) => {
                (online_if(self.device_probe.probe(target.host.trim()).await), None)
            }
            (TargetKind::Service, CheckMethod::Tcp) => (self.check_tcp(target).await, None),
            (TargetKind::Service, CheckMethod::Ping) => (self.check_ping(&target.host).await, None),
            (TargetKind::Service, CheckMethod::Http) => self.check_http(&target.host).await,
        };

        let result = CheckResult {
            target_id: target.id,
            status,
            status_code,
            latency_ms: start.elapsed().as_millis() as u64,
            checked_at_unix: now_unix(),
        };
        debug!(
            target_id = target.id,
            kind = %target.kind,
            status = result.status.as_str(),
            latency_ms = result.latency_ms,
            "check finished"
        );
        self.metrics.observe_check(target.kind, &result);
        result
    }

    async fn check_tcp(&self, target: &ProbeTarget) -> CheckStatus {
        let host = target.host.trim();
        let (host, port) = match target.port {
            Some(port) => (split_host_port(host).map(|(h, _)| h).unwrap_or(host), port),
            None => match split_host_port(host) {
                Some(pair) => pair,
                None => {
                    warn!(target_id = target.id, host, "tcp target has no port");
                    return CheckStatus::Error;
                }
            },
        };
        online_if(tcp_connect(host, port, self.tcp_timeout).await)
    }

    async fn check_ping(&self, host: &str) -> CheckStatus {
        let host = host.trim();
        online_if(
            first_open_port(host, &self.ping_ports, self.ping_timeout)
                .await
                .is_some(),
        )
    }

    /// HEAD first, GET when HEAD fails at the transport level. Both share one
    /// `http_timeout` budget. Redirects are not followed; a 3xx already proves
    /// the service answers.
    async fn check_http(&self, address: &str) -> (CheckStatus, Option<u16>) {
        let url = normalize_url(address);
        let attempt = async {
            match self.client.head(&url).send().await {
                Ok(resp) => Ok(resp),
                Err(err) => {
                    debug!(url = %url, error = %err, "HEAD failed, retrying with GET");
                    self.client.get(&url).send().await
                }
            }
        };

        match time::timeout(self.http_timeout, attempt).await {
            Ok(Ok(resp)) => {
                let code = resp.status().as_u16();
                (classify_status(code), Some(code))
            }
            Ok(Err(err)) => {
                debug!(url = %url, error = %err, "http check failed");
                (CheckStatus::Offline, None)
            }
            Err(_elapsed) => {
                debug!(url = %url, "http check timed out");
                (CheckStatus::Offline, None)
            }
        }
    }
}

/// 2xx/3xx online, 4xx reachable-but-rejecting, anything else offline.
pub fn classify_status(code: u16) -> CheckStatus {
    match code {
        200..=399 => CheckStatus::Online,
        400..=499 => CheckStatus::Error,
        _ => CheckStatus::Offline,
    }
}

fn online_if(up: bool) -> CheckStatus {
    if up {
        CheckStatus::Online
    } else {
        CheckStatus::Offline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{closed_port, device, service, spawn_http};
    use tokio::net::TcpListener;

    fn fast_config() -> ProbeConfig {
        ProbeConfig {
            device_attempt_timeout_ms: 200,
            ping_fallback: false,
            tcp_timeout_ms: 500,
            ping_method_timeout_ms: 200,
            http_timeout_ms: 1000,
            ..ProbeConfig::default()
        }
    }

    fn checker(cfg: &ProbeConfig) -> (HealthChecker, Arc<Metrics>) {
        let metrics = Metrics::new().expect("metrics init");
        let checker = HealthChecker::new(cfg, metrics.clone()).expect("client builds");
        (checker, metrics)
    }

    #[test]
    fn status_boundaries() {
        assert_eq!(classify_status(199), CheckStatus::Offline);
        assert_eq!(classify_status(200), CheckStatus::Online);
        assert_eq!(classify_status(399), CheckStatus::Online);
        assert_eq!(classify_status(400), CheckStatus::Error);
        assert_eq!(classify_status(404), CheckStatus::Error);
        assert_eq!(classify_status(499), CheckStatus::Error);
        assert_eq!(classify_status(500), CheckStatus::Offline);
    }

    #[tokio::test]
    async fn inactive_target_is_disabled_without_network_io() {
        let (checker, metrics) = checker(&fast_config());
        let mut target = service(1, "off", "http://10.255.255.1", CheckMethod::Http);
        target.active = false;
        let mut dev = device(2, "off-dev", "10.255.255.1");
        dev.active = false;

        let result = checker.check(&target).await;
        let dev_result = checker.check(&dev).await;

        assert_eq!(result.status, CheckStatus::Disabled);
        assert_eq!(result.latency_ms, 0);
        assert_eq!(dev_result.status, CheckStatus::Disabled);
        assert_eq!(metrics.network_calls(), 0);
    }

    #[tokio::test]
    async fn http_status_codes_map_to_statuses() {
        let (checker, metrics) = checker(&fast_config());
        for (code, expected) in [
            (200, CheckStatus::Online),
            (301, CheckStatus::Online),
            (404, CheckStatus::Error),
            (503, CheckStatus::Offline),
        ] {
            let addr = spawn_http(code, false, Duration::ZERO).await;
            let target = service(1, "svc", &format!("http://{addr}/"), CheckMethod::Http);
            let result = checker.check(&target).await;
            assert_eq!(result.status, expected, "status code {code}");
            assert_eq!(result.status_code, Some(code));
        }
        assert_eq!(metrics.network_calls(), 4);
    }

    #[tokio::test]
    async fn head_failure_falls_back_to_get() {
        let (checker, _) = checker(&fast_config());
        let addr = spawn_http(200, true, Duration::ZERO).await;
        let target = service(1, "svc", &addr.to_string(), CheckMethod::Http);

        let result = checker.check(&target).await;
        assert_eq!(result.status, CheckStatus::Online);
        assert_eq!(result.status_code, Some(200));
    }

    #[tokio::test]
    async fn unreachable_http_is_offline() {
        let (checker, _) = checker(&fast_config());
        let port = closed_port().await;
        let target = service(1, "svc", &format!("http://127.0.0.1:{port}"), CheckMethod::Http);

        let result = checker.check(&target).await;
        assert_eq!(result.status, CheckStatus::Offline);
        assert_eq!(result.status_code, None);
    }

    #[tokio::test]
    async fn tcp_check_uses_port_field_or_address() {
        let (checker, _) = checker(&fast_config());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut with_field = service(1, "db", "127.0.0.1", CheckMethod::Tcp);
        with_field.port = Some(port);
        let inline = service(2, "db2", &format!("127.0.0.1:{port}"), CheckMethod::Tcp);
        let no_port = service(3, "db3", "127.0.0.1", CheckMethod::Tcp);

        assert_eq!(checker.check(&with_field).await.status, CheckStatus::Online);
        assert_eq!(checker.check(&inline).await.status, CheckStatus::Online);
        assert_eq!(checker.check(&no_port).await.status, CheckStatus::Error);
    }

    #[tokio::test]
    async fn tcp_without_listener_is_offline_within_timeout() {
        let cfg = fast_config();
        let (checker, _) = checker(&cfg);
        let mut target = service(1, "db", "127.0.0.1", CheckMethod::Tcp);
        target.port = Some(closed_port().await);

        let result = checker.check(&target).await;
        assert_eq!(result.status, CheckStatus::Offline);
        assert!(result.latency_ms <= cfg.tcp_timeout_ms + 500);
    }

    #[tokio::test]
    async fn silent_http_server_times_out_offline() {
        let cfg = fast_config();
        let (checker, _) = checker(&cfg);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let target = service(1, "hung", &format!("http://{addr}/"), CheckMethod::Http);
        let started = Instant::now();
        let result = checker.check(&target).await;

        assert_eq!(result.status, CheckStatus::Offline);
        assert_eq!(result.status_code, None);
        assert!(result.latency_ms >= cfg.http_timeout_ms - 50);
        assert!(started.elapsed() < Duration::from_millis(cfg.http_timeout_ms + 500));
    }

    #[tokio::test]
    async fn ping_method_with_every_port_closed_is_offline() {
        let cfg = ProbeConfig {
            ping_method_ports: vec![
                closed_port().await,
                closed_port().await,
                closed_port().await,
            ],
            ..fast_config()
        };
        let (checker, _) = checker(&cfg);
        let target = service(1, "nas", "127.0.0.1", CheckMethod::Ping);

        let started = Instant::now();
        let result = checker.check(&target).await;

        assert_eq!(result.status, CheckStatus::Offline);
        let ceiling = cfg.ping_method_timeout_ms * cfg.ping_method_ports.len() as u64 + 500;
        assert!(result.latency_ms <= ceiling);
        assert!(started.elapsed() < Duration::from_millis(ceiling));
    }

    #[tokio::test]
    async fn device_host_is_trimmed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cfg = ProbeConfig {
            device_ports: vec![listener.local_addr().unwrap().port()],
            ..fast_config()
        };
        let (checker, _) = checker(&cfg);
        let padded = device(1, "pc", " 127.0.0.1 ");
        assert!(padded.validate_address().is_ok());
        assert_eq!(checker.check(&padded).await.status, CheckStatus::Online);
    }

    #[tokio::test]
    async fn ping_method_short_circuits_on_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let cfg = ProbeConfig {
            ping_method_ports: vec![closed_port().await, open],
            ..fast_config()
        };
        let (checker, _) = checker(&cfg);

        let target = service(1, "nas", "127.0.0.1", CheckMethod::Ping);
        assert_eq!(checker.check(&target).await.status, CheckStatus::Online);
    }

    #[tokio::test]
    async fn device_uses_port_heuristic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let cfg = ProbeConfig {
            device_ports: vec![closed_port().await, open],
            ..fast_config()
        };
        let (checker, _) = checker(&cfg);

        assert_eq!(
            checker.check(&device(1, "pc", "127.0.0.1")).await.status,
            CheckStatus::Online
        );

        drop(listener);
        assert_eq!(
            checker.check(&device(1, "pc", "127.0.0.1")).await.status,
            CheckStatus::Offline
        );
    }
}
