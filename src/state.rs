use crate::model::{ContainerStats, HistoryPoint};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Fixed-capacity FIFO of history points. Written by the background sampler
/// only; readers get copies.
#[derive(Debug)]
pub struct HistoryRing {
    capacity: usize,
    points: RwLock<VecDeque<HistoryPoint>>,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            points: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Appends a point, evicting the oldest ones past capacity. Returns the
    /// resulting length.
    pub async fn push(&self, point: HistoryPoint) -> usize {
        let mut guard = self.points.write().await;
        guard.push_back(point);
        while guard.len() > self.capacity {
            guard.pop_front();
        }
        guard.len()
    }

    /// Last `limit` points, oldest first. `0` or anything past the stored
    /// length returns all of them.
    pub async fn recent(&self, limit: usize) -> Vec<HistoryPoint> {
        let guard = self.points.read().await;
        let take = if limit == 0 || limit > guard.len() {
            guard.len()
        } else {
            limit
        };
        guard.iter().skip(guard.len() - take).cloned().collect()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.points.read().await.len()
    }
}

#[derive(Debug, Clone)]
struct CachedStats {
    stats: ContainerStats,
    stored_at: Instant,
}

/// Per-container stats keyed by container id. An entry is fresh while
/// `now - stored_at < ttl`; stale entries are replaced wholesale.
#[derive(Debug)]
pub struct StatsCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedStats>>,
}

impl StatsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_fresh(&self, container_id: &str) -> Option<ContainerStats> {
        let guard = self.entries.read().await;
        let entry = guard.get(container_id)?;
        if entry.stored_at.elapsed() < self.ttl {
            Some(entry.stats.clone())
        } else {
            None
        }
    }

    pub async fn insert(&self, container_id: &str, stats: ContainerStats) {
        let mut guard = self.entries.write().await;
        guard.insert(
            container_id.to_string(),
            CachedStats {
                stats,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drops entries for containers that no longer exist.
    pub async fn retain_ids(&self, live_ids: &HashSet<String>) {
        let mut guard = self.entries.write().await;
        guard.retain(|id, _| live_ids.contains(id));
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
