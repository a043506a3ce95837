//! Controller-side mirror of a running deployment's entity state.

use crate::snapshot::{SnapshotArtifact, SnapshotEntity};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct WorldInner {
    world_version: u32,
    entities: BTreeMap<u64, (u32, Vec<u8>)>,
}

/// Entity table seeded from the start snapshot and kept current by the runtime bridge.
///
/// Writers update one entity at a time under the write lock; a capture copies the
/// whole table under one read lock, so it never observes a partially written entity.
#[derive(Debug, Default)]
pub struct WorldState {
    inner: RwLock<WorldInner>,
}

impl WorldState {
    pub fn new(world_version: u32) -> Self {
        Self {
            inner: RwLock::new(WorldInner {
                world_version,
                entities: BTreeMap::new(),
            }),
        }
    }

    /// Replaces the table with the contents of `snapshot`.
    pub async fn reset(&self, snapshot: &SnapshotArtifact) {
        let entities = snapshot
            .entities
            .iter()
            .map(|e| (e.entity_id, (e.type_id, e.fields.clone())))
            .collect();
        let mut inner = self.inner.write().await;
        inner.world_version = snapshot.world_version;
        inner.entities = entities;
    }

    pub async fn upsert(&self, entity_id: u64, type_id: u32, fields: Vec<u8>) {
        self.inner.write().await.entities.insert(entity_id, (type_id, fields));
    }

    pub async fn remove(&self, entity_id: u64) -> bool {
        self.inner.write().await.entities.remove(&entity_id).is_some()
    }

    pub async fn entity_count(&self) -> usize {
        self.inner.read().await.entities.len()
    }

    /// Copies the current state in a single read batch.
    pub async fn read_consistent(&self) -> SnapshotArtifact {
        let inner = self.inner.read().await;
        let entities = inner
            .entities
            .iter()
            .map(|(&entity_id, (type_id, fields))| SnapshotEntity {
                entity_id,
                type_id: *type_id,
                fields: fields.clone(),
            })
            .collect();
        SnapshotArtifact::new(inner.world_version, entities)
    }
}
