use crate::model::{now_unix, CheckResult, ResourceSample, TargetKind};
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

/// Self-metrics of the probing engine.
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub labwatch_checks_total: CounterVec,
    pub labwatch_check_network_calls_total: Counter,
    pub labwatch_check_latency_ms: GaugeVec,
    pub labwatch_status_updates_total: Counter,
    pub labwatch_batch_duration_ms: GaugeVec,
    pub labwatch_batch_size: GaugeVec,
    pub labwatch_stats_cache_hits_total: Counter,
    pub labwatch_stats_cache_misses_total: Counter,
    pub labwatch_runtime_errors_total: CounterVec,
    pub labwatch_history_points: Gauge,
    pub labwatch_host_cpu_usage_percent: Gauge,
    pub labwatch_host_memory_usage_percent: Gauge,
    pub labwatch_uptime_seconds: Gauge,
    pub labwatch_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let labwatch_checks_total = CounterVec::new(
            opts!(
                "labwatch_checks_total",
                "Completed health checks by target kind and resulting status"
            ),
            &["kind", "status"],
        )?;
        let labwatch_check_network_calls_total = Counter::with_opts(opts!(
            "labwatch_check_network_calls_total",
            "Health checks that issued network I/O"
        ))?;
        let labwatch_check_latency_ms = GaugeVec::new(
            opts!(
                "labwatch_check_latency_ms",
                "Latency of the most recent check by target kind"
            ),
            &["kind"],
        )?;
        let labwatch_status_updates_total = Counter::with_opts(opts!(
            "labwatch_status_updates_total",
            "Last-known-status writes issued to the store"
        ))?;
        let labwatch_batch_duration_ms = GaugeVec::new(
            opts!(
                "labwatch_batch_duration_ms",
                "Wall-clock duration of the most recent live batch"
            ),
            &["kind"],
        )?;
        let labwatch_batch_size = GaugeVec::new(
            opts!(
                "labwatch_batch_size",
                "Number of targets in the most recent live batch"
            ),
            &["kind"],
        )?;
        let labwatch_stats_cache_hits_total = Counter::with_opts(opts!(
            "labwatch_stats_cache_hits_total",
            "Container stats served from cache"
        ))?;
        let labwatch_stats_cache_misses_total = Counter::with_opts(opts!(
            "labwatch_stats_cache_misses_total",
            "Container stats read from the runtime"
        ))?;
        let labwatch_runtime_errors_total = CounterVec::new(
            opts!(
                "labwatch_runtime_errors_total",
                "Container runtime call failures by operation"
            ),
            &["op"],
        )?;
        let labwatch_history_points = Gauge::with_opts(opts!(
            "labwatch_history_points",
            "Points currently held in the history ring"
        ))?;
        let labwatch_host_cpu_usage_percent = Gauge::with_opts(opts!(
            "labwatch_host_cpu_usage_percent",
            "Host CPU usage from the last history sample"
        ))?;
        let labwatch_host_memory_usage_percent = Gauge::with_opts(opts!(
            "labwatch_host_memory_usage_percent",
            "Host memory usage from the last history sample"
        ))?;
        let labwatch_uptime_seconds =
            Gauge::with_opts(opts!("labwatch_uptime_seconds", "Daemon uptime in seconds"))?;
        let labwatch_scrape_count_total = Counter::with_opts(opts!(
            "labwatch_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &labwatch_checks_total)?;
        register(&registry, &labwatch_check_network_calls_total)?;
        register(&registry, &labwatch_check_latency_ms)?;
        register(&registry, &labwatch_status_updates_total)?;
        register(&registry, &labwatch_batch_duration_ms)?;
        register(&registry, &labwatch_batch_size)?;
        register(&registry, &labwatch_stats_cache_hits_total)?;
        register(&registry, &labwatch_stats_cache_misses_total)?;
        register(&registry, &labwatch_runtime_errors_total)?;
        register(&registry, &labwatch_history_points)?;
        register(&registry, &labwatch_host_cpu_usage_percent)?;
        register(&registry, &labwatch_host_memory_usage_percent)?;
        register(&registry, &labwatch_uptime_seconds)?;
        register(&registry, &labwatch_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            labwatch_checks_total,
            labwatch_check_network_calls_total,
            labwatch_check_latency_ms,
            labwatch_status_updates_total,
            labwatch_batch_duration_ms,
            labwatch_batch_size,
            labwatch_stats_cache_hits_total,
            labwatch_stats_cache_misses_total,
            labwatch_runtime_errors_total,
            labwatch_history_points,
            labwatch_host_cpu_usage_percent,
            labwatch_host_memory_usage_percent,
            labwatch_uptime_seconds,
            labwatch_scrape_count_total,
        }))
    }

    pub fn observe_check(&self, kind: TargetKind, result: &CheckResult) {
        let kind = kind.to_string();
        self.labwatch_checks_total
            .with_label_values(&[&kind, result.status.as_str()])
            .inc();
        self.labwatch_check_latency_ms
            .with_label_values(&[&kind])
            .set(result.latency_ms as f64);
    }

    pub fn inc_network_call(&self) {
        self.labwatch_check_network_calls_total.inc();
    }

    pub fn network_calls(&self) -> u64 {
        self.labwatch_check_network_calls_total.get() as u64
    }

    pub fn inc_status_update(&self) {
        self.labwatch_status_updates_total.inc();
    }

    pub fn observe_batch(&self, kind: TargetKind, size: usize, elapsed: Duration) {
        let kind = kind.to_string();
        self.labwatch_batch_duration_ms
            .with_label_values(&[&kind])
            .set(elapsed.as_millis() as f64);
        self.labwatch_batch_size
            .with_label_values(&[&kind])
            .set(size as f64);
    }

    pub fn inc_cache_hit(&self) {
        self.labwatch_stats_cache_hits_total.inc();
    }

    pub fn inc_cache_miss(&self) {
        self.labwatch_stats_cache_misses_total.inc();
    }

    pub fn inc_runtime_error(&self, op: &str) {
        self.labwatch_runtime_errors_total
            .with_label_values(&[op])
            .inc();
    }

    pub fn update_from_sample(&self, sample: &ResourceSample, history_len: usize) {
        self.labwatch_host_cpu_usage_percent
            .set(sample.cpu.usage_percent);
        self.labwatch_host_memory_usage_percent
            .set(sample.memory.used_percent);
        self.labwatch_history_points.set(history_len as f64);
    }

    pub fn inc_scrape_count(&self) {
        self.labwatch_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let uptime = now_unix().saturating_sub(self.started_at_unix) as f64;
        self.labwatch_uptime_seconds.set(uptime);

        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CheckStatus;

    #[test]
    fn check_observation_is_labelled_by_kind_and_status() {
        let metrics = Metrics::new().expect("metrics init");
        let result = CheckResult {
            target_id: 1,
            status: CheckStatus::Offline,
            status_code: None,
            latency_ms: 42,
            checked_at_unix: 0,
        };
        metrics.observe_check(TargetKind::Service, &result);

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("labwatch_checks_total{kind=\"service\",status=\"offline\"} 1"));
        assert!(text.contains("labwatch_uptime_seconds"));
    }
}
