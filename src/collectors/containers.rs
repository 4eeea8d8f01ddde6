//! Container half of the resource collector plus the OS history sampler.
//!
//! The stats cache and the history ring are the only mutable state shared
//! between request handlers and the background sampler; both live in
//! `crate::state` behind read-write locks.

use crate::collectors::system::collect_system;
use crate::config::StatsConfig;
use crate::docker::{ContainerRuntime, DockerClient, DockerMemoryStats, DockerStats, RuntimeError};
use crate::metrics::Metrics;
use crate::model::{Container, ContainerStats, HistoryPoint, ResourceSample};
use crate::state::{HistoryRing, StatsCache};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use sysinfo::{System, SystemExt};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Page-cache counters in preference order (cgroup v1, then v2).
const CACHE_KEYS: [&str; 3] = ["cache", "total_inactive_file", "inactive_file"];

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("system sampling task failed: {0}")]
    Sampling(#[from] task::JoinError),
}

pub struct StatsCollector {
    runtime: Option<Arc<dyn ContainerRuntime>>,
    system: Arc<Mutex<System>>,
    cache: StatsCache,
    history: HistoryRing,
    stats_timeout: Duration,
    stop_grace: Duration,
    command_timeout: Duration,
    cpu_window: Duration,
    history_interval: Duration,
    metrics: Arc<Metrics>,
}

impl StatsCollector {
    pub fn new(
        runtime: Option<Arc<dyn ContainerRuntime>>,
        cfg: &StatsConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            runtime,
            system: Arc::new(Mutex::new(System::new())),
            cache: StatsCache::new(cfg.cache_ttl()),
            history: HistoryRing::new(cfg.history_capacity),
            stats_timeout: cfg.stats_timeout(),
            stop_grace: Duration::from_secs(cfg.stop_grace_secs),
            command_timeout: Duration::from_secs(cfg.stop_grace_secs) + cfg.stats_timeout(),
            cpu_window: cfg.cpu_sample_window(),
            history_interval: cfg.history_interval(),
            metrics,
        }
    }

    /// Probes the Docker socket once. An unreachable runtime is logged here
    /// and nowhere else; container operations then degrade quietly.
    pub async fn connect(cfg: &StatsConfig, metrics: Arc<Metrics>) -> Self {
        let client = DockerClient::new(&cfg.docker_socket);
        let runtime: Option<Arc<dyn ContainerRuntime>> =
            match time::timeout(cfg.stats_timeout(), client.ping()).await {
                Ok(Ok(())) => {
                    info!(socket = %cfg.docker_socket, "container runtime connected");
                    Some(Arc::new(client) as Arc<dyn ContainerRuntime>)
                }
                Ok(Err(err)) => {
                    warn!(socket = %cfg.docker_socket, error = %err, "container runtime unavailable, container operations disabled");
                    None
                }
                Err(_elapsed) => {
                    warn!(socket = %cfg.docker_socket, "container runtime did not answer, container operations disabled");
                    None
                }
            };
        Self::new(runtime, cfg, metrics)
    }

    pub fn runtime_available(&self) -> bool {
        self.runtime.is_some()
    }

    fn runtime(&self) -> Result<&Arc<dyn ContainerRuntime>, RuntimeError> {
        self.runtime.as_ref().ok_or(RuntimeError::Unavailable)
    }

    pub async fn sample_system(&self) -> Result<ResourceSample, StatsError> {
        let system = self.system.clone();
        let window = self.cpu_window;
        let sample = task::spawn_blocking(move || {
            let mut guard = system.lock().unwrap_or_else(PoisonError::into_inner);
            collect_system(&mut guard, window)
        })
        .await?;
        Ok(sample)
    }

    /// Cached per container id. A failed or timed-out read yields (and
    /// caches) zero-valued stats.
    pub async fn container_stats(&self, id: &str) -> ContainerStats {
        if let Some(hit) = self.cache.get_fresh(id).await {
            self.metrics.inc_cache_hit();
            return hit;
        }
        self.metrics.inc_cache_miss();

        let stats = match self.read_stats(id).await {
            Ok(raw) => derive_stats(&raw),
            Err(err) => {
                self.metrics.inc_runtime_error("stats");
                debug!(container = id, error = %err, "stats read failed");
                ContainerStats::default()
            }
        };
        self.cache.insert(id, stats.clone()).await;
        stats
    }

    async fn read_stats(&self, id: &str) -> Result<DockerStats, RuntimeError> {
        let runtime = self.runtime()?;
        with_deadline(self.stats_timeout, runtime.stats(id)).await
    }

    /// All containers without stats. Empty when the runtime is unavailable
    /// or the listing fails.
    pub async fn list_containers(&self) -> Vec<Container> {
        let Some(runtime) = &self.runtime else {
            return Vec::new();
        };
        match with_deadline(self.stats_timeout, runtime.list()).await {
            Ok(containers) => containers,
            Err(err) => {
                self.metrics.inc_runtime_error("list");
                warn!(error = %err, "container listing failed");
                Vec::new()
            }
        }
    }

    /// Drops cache entries of containers that no longer exist.
    pub async fn prune_cache(&self, live_ids: &HashSet<String>) {
        self.cache.retain_ids(live_ids).await;
    }

    pub async fn inspect_container(&self, id: &str) -> Result<Container, RuntimeError> {
        let runtime = self.runtime()?;
        let mut container = with_deadline(self.stats_timeout, runtime.inspect(id))
            .await
            .inspect_err(|_| self.metrics.inc_runtime_error("inspect"))?;
        if container.is_running() {
            container.stats = Some(self.container_stats(&container.id).await);
        }
        Ok(container)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let runtime = self.runtime()?;
        with_deadline(self.command_timeout, runtime.start(id))
            .await
            .inspect_err(|_| self.metrics.inc_runtime_error("start"))
    }

    pub async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        let runtime = self.runtime()?;
        with_deadline(self.command_timeout, runtime.stop(id, self.stop_grace))
            .await
            .inspect_err(|_| self.metrics.inc_runtime_error("stop"))
    }

    pub async fn restart_container(&self, id: &str) -> Result<(), RuntimeError> {
        let runtime = self.runtime()?;
        with_deadline(self.command_timeout, runtime.restart(id, self.stop_grace))
            .await
            .inspect_err(|_| self.metrics.inc_runtime_error("restart"))
    }

    pub async fn record_history(&self) -> Result<HistoryPoint, StatsError> {
        let sample = self.sample_system().await?;
        let point = HistoryPoint::from(&sample);
        let len = self.history.push(point.clone()).await;
        self.metrics.update_from_sample(&sample, len);
        Ok(point)
    }

    /// Oldest first; `limit` of 0 means everything.
    pub async fn recent_history(&self, limit: usize) -> Vec<HistoryPoint> {
        self.history.recent(limit).await
    }

    pub async fn run_history_sampler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.history_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("history sampler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.record_history().await {
                        Ok(point) => debug!(cpu = point.cpu_usage, memory = point.memory_usage, "history point recorded"),
                        Err(err) => warn!(error = %err, "history sample failed"),
                    }
                }
            }
        }
    }
}

/// Bounds one runtime call. Lifecycle commands are given the stop grace
/// period on top of the stats timeout.
async fn with_deadline<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, RuntimeError>>,
) -> Result<T, RuntimeError> {
    time::timeout(limit, call)
        .await
        .unwrap_or(Err(RuntimeError::Timeout))
}

pub fn derive_stats(raw: &DockerStats) -> ContainerStats {
    let memory_usage = memory_usage(&raw.memory_stats);
    let memory_limit = raw.memory_stats.limit;
    let (network_rx, network_tx) = raw
        .networks
        .iter()
        .flatten()
        .fold((0_u64, 0_u64), |(rx, tx), (_, n)| {
            (rx.saturating_add(n.rx_bytes), tx.saturating_add(n.tx_bytes))
        });
    let (block_read, block_write) = block_io(raw);

    ContainerStats {
        cpu_percent: cpu_percent(raw),
        memory_usage,
        memory_limit,
        memory_percent: if memory_limit == 0 {
            0.0
        } else {
            memory_usage as f64 / memory_limit as f64 * 100.0
        },
        network_rx,
        network_tx,
        block_read,
        block_write,
        pids: raw.pids_stats.current.unwrap_or(0),
    }
}

/// Container CPU delta over host CPU delta, scaled by online CPUs. Both
/// deltas are taken against the previous sample embedded in `raw`.
pub fn cpu_percent(raw: &DockerStats) -> f64 {
    let cpu = &raw.cpu_stats;
    let pre = &raw.precpu_stats;
    let cpu_delta = cpu.cpu_usage.total_usage as f64 - pre.cpu_usage.total_usage as f64;
    let system_delta =
        cpu.system_cpu_usage.unwrap_or(0) as f64 - pre.system_cpu_usage.unwrap_or(0) as f64;
    if cpu_delta <= 0.0 || system_delta <= 0.0 {
        return 0.0;
    }

    let online = cpu
        .online_cpus
        .filter(|n| *n > 0)
        .map(|n| n as usize)
        .or_else(|| {
            cpu.cpu_usage
                .percpu_usage
                .as_ref()
                .map(Vec::len)
                .filter(|n| *n > 0)
        })
        .unwrap_or(1);

    cpu_delta / system_delta * online as f64 * 100.0
}

pub fn memory_usage(mem: &DockerMemoryStats) -> u64 {
    let cache = mem
        .stats
        .as_ref()
        .and_then(|s| CACHE_KEYS.iter().find_map(|k| s.get(*k).copied()))
        .unwrap_or(0);
    mem.usage.saturating_sub(cache)
}

fn block_io(raw: &DockerStats) -> (u64, u64) {
    raw.blkio_stats
        .io_service_bytes_recursive
        .iter()
        .flatten()
        .fold((0_u64, 0_u64), |(read, write), entry| {
            if entry.op.eq_ignore_ascii_case("read") {
                (read.saturating_add(entry.value), write)
            } else if entry.op.eq_ignore_ascii_case("write") {
                (read, write.saturating_add(entry.value))
            } else {
                (read, write)
            }
        })
}
