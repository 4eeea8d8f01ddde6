use crate::config::InventoryConfig;
use crate::model::{CheckStatus, OwnerId, ProbeTarget, TargetId, TargetKind};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate {kind} id {id}")]
    Duplicate { kind: TargetKind, id: TargetId },
}

/// Last-known-status columns written back after a live check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusUpdate {
    pub status: CheckStatus,
    pub checked_at_unix: i64,
    /// Set only when the target has just come online.
    pub seen_at_unix: Option<i64>,
}

impl StatusUpdate {
    pub fn apply_to(&self, target: &mut ProbeTarget) {
        target.last_status = self.status;
        target.last_checked_unix = Some(self.checked_at_unix);
        if let Some(seen) = self.seen_at_unix {
            target.last_seen_unix = Some(seen);
        }
    }
}

/// Inventory collaborator. The engine only reads targets and writes the
/// status columns on their rows.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Devices ordered by name, services by category then name.
    async fn list_targets(
        &self,
        owner: OwnerId,
        kind: TargetKind,
    ) -> Result<Vec<ProbeTarget>, StoreError>;

    async fn find_target(
        &self,
        owner: OwnerId,
        kind: TargetKind,
        id: TargetId,
    ) -> Result<Option<ProbeTarget>, StoreError>;

    /// Rows affected. Zero means no target matched `(owner, kind, id)`.
    async fn update_status(
        &self,
        owner: OwnerId,
        kind: TargetKind,
        id: TargetId,
        update: StatusUpdate,
    ) -> Result<u64, StoreError>;
}

pub struct MemoryStore {
    targets: RwLock<Vec<ProbeTarget>>,
}

impl MemoryStore {
    pub fn new(targets: Vec<ProbeTarget>) -> Result<Self, StoreError> {
        let mut seen = HashSet::new();
        for t in &targets {
            if !seen.insert((t.kind, t.id)) {
                return Err(StoreError::Duplicate {
                    kind: t.kind,
                    id: t.id,
                });
            }
        }
        Ok(Self {
            targets: RwLock::new(targets),
        })
    }

    pub fn from_inventory(inventory: &InventoryConfig) -> Result<Self, StoreError> {
        let targets = inventory
            .devices
            .iter()
            .map(|d| d.to_target())
            .chain(inventory.services.iter().map(|s| s.to_target()))
            .collect();
        Self::new(targets)
    }
}

fn display_order(a: &ProbeTarget, b: &ProbeTarget) -> Ordering {
    match a.kind {
        TargetKind::Device => a.name.cmp(&b.name),
        TargetKind::Service => {
            let ka = (a.category.as_deref().unwrap_or(""), a.name.as_str());
            let kb = (b.category.as_deref().unwrap_or(""), b.name.as_str());
            ka.cmp(&kb)
        }
    }
    .then(a.id.cmp(&b.id))
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn list_targets(
        &self,
        owner: OwnerId,
        kind: TargetKind,
    ) -> Result<Vec<ProbeTarget>, StoreError> {
        let guard = self.targets.read().await;
        let mut out: Vec<ProbeTarget> = guard
            .iter()
            .filter(|t| t.owner_id == owner && t.kind == kind)
            .cloned()
            .collect();
        out.sort_by(display_order);
        Ok(out)
    }

    async fn find_target(
        &self,
        owner: OwnerId,
        kind: TargetKind,
        id: TargetId,
    ) -> Result<Option<ProbeTarget>, StoreError> {
        let guard = self.targets.read().await;
        Ok(guard
            .iter()
            .find(|t| t.owner_id == owner && t.kind == kind && t.id == id)
            .cloned())
    }

    async fn update_status(
        &self,
        owner: OwnerId,
        kind: TargetKind,
        id: TargetId,
        update: StatusUpdate,
    ) -> Result<u64, StoreError> {
        let mut guard = self.targets.write().await;
        let Some(target) = guard
            .iter_mut()
            .find(|t| t.owner_id == owner && t.kind == kind && t.id == id)
        else {
            return Ok(0);
        };

        update.apply_to(target);
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CheckMethod;
    use crate::test_support::{device, service};

    fn store() -> MemoryStore {
        let mut other_owner = device(9, "aaa-foreign", "10.0.0.9");
        other_owner.owner_id = 2;
        let mut db = service(3, "postgres", "db:5432", CheckMethod::Tcp);
        db.category = Some("data".to_string());
        let mut jf = service(4, "jellyfin", "http://jf", CheckMethod::Http);
        jf.category = Some("media".to_string());
        let mut arr = service(5, "arr", "http://arr", CheckMethod::Http);
        arr.category = Some("media".to_string());

        MemoryStore::new(vec![
            device(1, "router", "10.0.0.1"),
            device(2, "nas", "10.0.0.2"),
            other_owner,
            jf,
            db,
            arr,
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn listings_are_scoped_and_ordered() {
        let store = store();

        let devices = store.list_targets(1, TargetKind::Device).await.unwrap();
        let names: Vec<&str> = devices.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["nas", "router"]);

        let services = store.list_targets(1, TargetKind::Service).await.unwrap();
        let names: Vec<&str> = services.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["postgres", "arr", "jellyfin"]);

        assert!(store.list_targets(3, TargetKind::Device).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lookups_respect_kind_and_owner() {
        let store = store();
        assert!(store.find_target(1, TargetKind::Device, 1).await.unwrap().is_some());
        assert!(store.find_target(1, TargetKind::Service, 1).await.unwrap().is_none());
        assert!(store.find_target(2, TargetKind::Device, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_update_is_a_noop_outside_scope() {
        let store = store();
        let update = StatusUpdate {
            status: CheckStatus::Online,
            checked_at_unix: 100,
            seen_at_unix: Some(100),
        };

        assert_eq!(store.update_status(2, TargetKind::Device, 1, update).await.unwrap(), 0);
        let untouched = store.find_target(1, TargetKind::Device, 1).await.unwrap().unwrap();
        assert_eq!(untouched.last_status, CheckStatus::Unknown);

        assert_eq!(store.update_status(1, TargetKind::Device, 1, update).await.unwrap(), 1);
        let offline = StatusUpdate {
            status: CheckStatus::Offline,
            checked_at_unix: 200,
            seen_at_unix: None,
        };
        store.update_status(1, TargetKind::Device, 1, offline).await.unwrap();

        let row = store.find_target(1, TargetKind::Device, 1).await.unwrap().unwrap();
        assert_eq!(row.last_status, CheckStatus::Offline);
        assert_eq!(row.last_checked_unix, Some(200));
        assert_eq!(row.last_seen_unix, Some(100));
    }

    #[test]
    fn duplicate_ids_per_kind_are_rejected() {
        let err = MemoryStore::new(vec![device(1, "a", "10.0.0.1"), device(1, "b", "10.0.0.2")]);
        assert!(matches!(err, Err(StoreError::Duplicate { id: 1, .. })));

        let mixed = MemoryStore::new(vec![
            device(1, "a", "10.0.0.1"),
            service(1, "b", "http://b", CheckMethod::Http),
        ]);
        assert!(mixed.is_ok());
    }
}
