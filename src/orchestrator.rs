//! Fan-out/fan-in over targets and containers, plus the upward operations
//! the HTTP layer calls.

use crate::collectors::checks::HealthChecker;
use crate::collectors::containers::{StatsCollector, StatsError};
use crate::docker::RuntimeError;
use crate::metrics::Metrics;
use crate::model::{
    now_unix, AddressError, CheckResult, CheckStatus, Container, ContainerStats, HistoryPoint,
    OwnerId, ProbeTarget, ResourceSample, TargetId, TargetKind, TargetReport,
};
use crate::store::{StatusUpdate, StoreError, TargetStore};
use crate::wol::{self, InvalidMac};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} {id} not found")]
    TargetNotFound { kind: TargetKind, id: TargetId },
    #[error("{kind} {id} has a malformed address: {source}")]
    InvalidAddress {
        kind: TargetKind,
        id: TargetId,
        source: AddressError,
    },
    #[error("device {0} has no MAC address")]
    MissingMac(TargetId),
    #[error(transparent)]
    InvalidMac(#[from] InvalidMac),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error("failed to send magic packet: {0}")]
    Io(#[from] io::Error),
}

/// Spawns one task per item and joins them all. Output index matches input
/// index whatever order the tasks finish in; a task that panics is replaced
/// by `on_panic(item)`.
pub async fn fan_out<T, R, F, Fut, P>(items: &[T], work: F, on_panic: P) -> Vec<R>
where
    T: Clone,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
    R: Send + 'static,
    P: Fn(&T) -> R,
{
    let handles: Vec<_> = items
        .iter()
        .cloned()
        .map(|item| tokio::spawn(work(item)))
        .collect();

    join_all(handles)
        .await
        .into_iter()
        .zip(items)
        .map(|(joined, item)| match joined {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "fan-out worker failed");
                on_panic(item)
            }
        })
        .collect()
}

pub struct Orchestrator {
    store: Arc<dyn TargetStore>,
    checker: Arc<HealthChecker>,
    stats: Arc<StatsCollector>,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn TargetStore>,
        checker: Arc<HealthChecker>,
        stats: Arc<StatsCollector>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            checker,
            stats,
            metrics,
        }
    }

    /// Last persisted status only. No network I/O.
    pub async fn targets_fast(
        &self,
        owner: OwnerId,
        kind: TargetKind,
    ) -> Result<Vec<TargetReport>, EngineError> {
        let targets = self.store.list_targets(owner, kind).await?;
        Ok(targets
            .into_iter()
            .map(|target| TargetReport {
                check: persisted_result(&target),
                target,
            })
            .collect())
    }

    /// Probes every target concurrently and writes changed statuses back
    /// before returning. Every target gets a report, failures included.
    pub async fn targets_live(
        &self,
        owner: OwnerId,
        kind: TargetKind,
    ) -> Result<Vec<TargetReport>, EngineError> {
        let targets = self.store.list_targets(owner, kind).await?;
        let started = Instant::now();

        let checker = self.checker.clone();
        let results = fan_out(
            &targets,
            move |target| {
                let checker = checker.clone();
                async move { check_in_batch(&checker, &target).await }
            },
            |target| failed_result(target.id),
        )
        .await;
        self.metrics
            .observe_batch(kind, targets.len(), started.elapsed());
        debug!(%kind, count = targets.len(), elapsed_ms = started.elapsed().as_millis() as u64, "live batch finished");

        let mut reports: Vec<TargetReport> = targets
            .into_iter()
            .zip(results)
            .map(|(target, check)| TargetReport { target, check })
            .collect();
        self.persist_changes(owner, &mut reports).await;
        Ok(reports)
    }

    /// One target, probed now. Unknown ids and unusable addresses are input
    /// errors rather than statuses.
    pub async fn target_live(
        &self,
        owner: OwnerId,
        kind: TargetKind,
        id: TargetId,
    ) -> Result<TargetReport, EngineError> {
        let target = self.find(owner, kind, id).await?;
        if target.active {
            target
                .validate_address()
                .map_err(|source| EngineError::InvalidAddress { kind, id, source })?;
        }

        let check = self.checker.check(&target).await;
        let mut reports = vec![TargetReport { target, check }];
        self.persist_changes(owner, &mut reports).await;
        Ok(reports.remove(0))
    }

    async fn find(
        &self,
        owner: OwnerId,
        kind: TargetKind,
        id: TargetId,
    ) -> Result<ProbeTarget, EngineError> {
        self.store
            .find_target(owner, kind, id)
            .await?
            .ok_or(EngineError::TargetNotFound { kind, id })
    }

    /// Writes run concurrently; all of them finish before this returns.
    /// A failed write is logged and leaves the report as read.
    async fn persist_changes(&self, owner: OwnerId, reports: &mut [TargetReport]) {
        let pending: Vec<(usize, StatusUpdate)> = reports
            .iter()
            .enumerate()
            .filter(|(_, r)| r.check.status != r.target.last_status)
            .map(|(i, r)| (i, status_update(&r.target, &r.check)))
            .collect();
        if pending.is_empty() {
            return;
        }

        let writes = pending.iter().map(|(i, update)| {
            let target = &reports[*i].target;
            self.store
                .update_status(owner, target.kind, target.id, *update)
        });
        let outcomes = join_all(writes).await;

        for ((i, update), outcome) in pending.into_iter().zip(outcomes) {
            let target = &mut reports[i].target;
            match outcome {
                Ok(0) => debug!(target_id = target.id, "status update matched no row"),
                Ok(_) => {
                    self.metrics.inc_status_update();
                    update.apply_to(target);
                }
                Err(err) => {
                    warn!(target_id = target.id, error = %err, "failed to persist status")
                }
            }
        }
    }

    /// Every container with cached stats attached to the running ones.
    pub async fn containers(&self) -> Vec<Container> {
        let mut containers = self.stats.list_containers().await;
        let running: Vec<String> = containers
            .iter()
            .filter(|c| c.is_running())
            .map(|c| c.id.clone())
            .collect();

        let stats = self.stats.clone();
        let sampled = fan_out(
            &running,
            move |id| {
                let stats = stats.clone();
                async move { stats.container_stats(&id).await }
            },
            |_| ContainerStats::default(),
        )
        .await;

        let mut by_id: HashMap<String, ContainerStats> = running.into_iter().zip(sampled).collect();
        for container in &mut containers {
            container.stats = by_id.remove(&container.id);
        }

        let live: HashSet<String> = containers.iter().map(|c| c.id.clone()).collect();
        self.stats.prune_cache(&live).await;
        containers
    }

    pub async fn container(&self, id: &str) -> Result<Container, EngineError> {
        Ok(self.stats.inspect_container(id).await?)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        Ok(self.stats.start_container(id).await?)
    }

    pub async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        Ok(self.stats.stop_container(id).await?)
    }

    pub async fn restart_container(&self, id: &str) -> Result<(), EngineError> {
        Ok(self.stats.restart_container(id).await?)
    }

    pub async fn wake_device(&self, owner: OwnerId, id: TargetId) -> Result<(), EngineError> {
        let device = self.find(owner, TargetKind::Device, id).await?;
        let mac = device
            .mac
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .ok_or(EngineError::MissingMac(id))?;
        let mac = wol::parse_mac(mac)?;
        wol::wake(mac).await?;
        debug!(device = id, "wake-on-lan sent");
        Ok(())
    }

    pub async fn current_sample(&self) -> Result<ResourceSample, EngineError> {
        Ok(self.stats.sample_system().await?)
    }

    pub async fn history(&self, limit: usize) -> Vec<HistoryPoint> {
        self.stats.recent_history(limit).await
    }
}

async fn check_in_batch(checker: &HealthChecker, target: &ProbeTarget) -> CheckResult {
    if target.active {
        if let Err(err) = target.validate_address() {
            warn!(target_id = target.id, error = %err, "skipping target with malformed address");
            return failed_result(target.id);
        }
    }
    checker.check(target).await
}

fn persisted_result(target: &ProbeTarget) -> CheckResult {
    CheckResult {
        target_id: target.id,
        status: target.last_status,
        status_code: None,
        latency_ms: 0,
        checked_at_unix: target.last_checked_unix.unwrap_or(0),
    }
}

fn failed_result(target_id: TargetId) -> CheckResult {
    CheckResult {
        target_id,
        status: CheckStatus::Error,
        status_code: None,
        latency_ms: 0,
        checked_at_unix: now_unix(),
    }
}

fn status_update(target: &ProbeTarget, check: &CheckResult) -> StatusUpdate {
    let newly_online =
        check.status == CheckStatus::Online && target.last_status != CheckStatus::Online;
    StatusUpdate {
        status: check.status,
        checked_at_unix: check.checked_at_unix,
        seen_at_unix: newly_online.then_some(check.checked_at_unix),
    }
}
