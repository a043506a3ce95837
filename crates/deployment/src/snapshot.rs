//! Snapshot artifacts and their binary format.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! header:  world_version u32 | entity_count u32
//! record:  entity_id u64 | type_id u32 | field_len u32 | field bytes
//! ```
//!
//! Field bytes are opaque here; only the header and record framing are checked.

use crate::error::{DeploymentError, DeploymentResult, Phase};
use crate::world::WorldState;
use chrono::Utc;
use schema_gen::SchemaArtifact;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const HEADER_LEN: usize = 8;
pub const RECORD_HEADER_LEN: usize = 16;
pub const SNAPSHOT_EXTENSION: &str = "snapshot";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntity {
    pub entity_id: u64,
    pub type_id: u32,
    pub fields: Vec<u8>,
}

/// Serialized world state used to initialize or restore a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotArtifact {
    /// File the artifact was read from or written to
    pub path: Option<PathBuf>,
    pub world_version: u32,
    pub entities: Vec<SnapshotEntity>,
}

impl SnapshotArtifact {
    pub fn new(world_version: u32, entities: Vec<SnapshotEntity>) -> Self {
        Self {
            path: None,
            world_version,
            entities,
        }
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn type_counts(&self) -> BTreeMap<u32, usize> {
        let mut counts = BTreeMap::new();
        for entity in &self.entities {
            *counts.entry(entity.type_id).or_insert(0) += 1;
        }
        counts
    }

    fn origin(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<memory>".to_string())
    }

    pub fn encode(&self) -> DeploymentResult<Vec<u8>> {
        let count = u32::try_from(self.entities.len())
            .map_err(|_| DeploymentError::corrupt_snapshot(self.origin(), "too many entities"))?;
        let body: usize = self
            .entities
            .iter()
            .map(|e| RECORD_HEADER_LEN + e.fields.len())
            .sum();
        let mut out = Vec::with_capacity(HEADER_LEN + body);
        out.extend_from_slice(&self.world_version.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        for entity in &self.entities {
            let len = u32::try_from(entity.fields.len()).map_err(|_| {
                DeploymentError::corrupt_snapshot(
                    self.origin(),
                    format!("entity {} field data too large", entity.entity_id),
                )
            })?;
            out.extend_from_slice(&entity.entity_id.to_le_bytes());
            out.extend_from_slice(&entity.type_id.to_le_bytes());
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&entity.fields);
        }
        Ok(out)
    }

    /// Parses the binary form. `origin` names the source in error messages.
    pub fn decode(bytes: &[u8], origin: &str) -> DeploymentResult<Self> {
        let corrupt = |reason: String| DeploymentError::corrupt_snapshot(origin, reason);

        let mut reader = Reader { bytes, pos: 0 };
        let (world_version, declared) = match (reader.u32(), reader.u32()) {
            (Some(version), Some(count)) => (version, count),
            _ => return Err(corrupt(format!("truncated header ({} bytes)", bytes.len()))),
        };

        let mut entities = Vec::with_capacity((declared as usize).min(bytes.len() / RECORD_HEADER_LEN));
        let mut seen = HashSet::new();
        for index in 0..declared {
            if reader.remaining() == 0 {
                return Err(corrupt(format!(
                    "header declares {declared} entities but data holds {index}"
                )));
            }
            let (entity_id, type_id, len) = match (reader.u64(), reader.u32(), reader.u32()) {
                (Some(id), Some(type_id), Some(len)) => (id, type_id, len),
                _ => return Err(corrupt(format!("truncated record header for entity #{index}"))),
            };
            let fields = reader
                .take(len as usize)
                .ok_or_else(|| corrupt(format!("truncated field data for entity {entity_id}")))?;
            if !seen.insert(entity_id) {
                return Err(corrupt(format!("duplicate entity id {entity_id}")));
            }
            entities.push(SnapshotEntity {
                entity_id,
                type_id,
                fields: fields.to_vec(),
            });
        }
        if reader.remaining() != 0 {
            return Err(corrupt(format!(
                "header declares {declared} entities but {} trailing bytes follow them",
                reader.remaining()
            )));
        }

        Ok(Self {
            path: None,
            world_version,
            entities,
        })
    }

    /// Fails when an entity references a type the schema does not contain.
    pub fn validate_against(&self, schema: &SchemaArtifact) -> DeploymentResult<()> {
        for entity in &self.entities {
            if !schema.contains_type(entity.type_id) {
                return Err(DeploymentError::corrupt_snapshot(
                    self.origin(),
                    format!(
                        "entity {} references type id {} absent from schema {}",
                        entity.entity_id,
                        entity.type_id,
                        schema.short_hash()
                    ),
                ));
            }
        }
        Ok(())
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Some(slice)
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
    }
}

/// Header-level view of a snapshot file.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    pub path: PathBuf,
    pub bytes: u64,
    pub world_version: u32,
    pub entity_count: usize,
    pub type_counts: BTreeMap<u32, usize>,
}

/// Loads, saves and captures snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    directory: PathBuf,
    fresh_world_version: u32,
}

impl SnapshotManager {
    pub fn new(directory: impl Into<PathBuf>, fresh_world_version: u32) -> Self {
        Self {
            directory: directory.into(),
            fresh_world_version,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Empty world at the configured version.
    pub fn fresh(&self) -> SnapshotArtifact {
        SnapshotArtifact::new(self.fresh_world_version, Vec::new())
    }

    /// Reads a snapshot and checks it against the active schema.
    pub async fn load(&self, path: &Path, schema: &SchemaArtifact) -> DeploymentResult<SnapshotArtifact> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            DeploymentError::corrupt_snapshot(path.display(), format!("cannot read: {e}"))
        })?;
        let mut artifact = SnapshotArtifact::decode(&bytes, &path.display().to_string())?;
        artifact.path = Some(path.to_path_buf());
        artifact.validate_against(schema)?;
        info!(
            path = %path.display(),
            world_version = artifact.world_version,
            entities = artifact.entity_count(),
            "Loaded snapshot"
        );
        Ok(artifact)
    }

    /// Writes `artifact` to `path` through a temporary file and a rename.
    pub async fn save(&self, artifact: &SnapshotArtifact, path: &Path) -> DeploymentResult<PathBuf> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = artifact.encode()?;
        let tmp = path.with_extension("snapshot.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), bytes = bytes.len(), "Saved snapshot");
        Ok(path.to_path_buf())
    }

    /// Summarizes a snapshot file without schema validation.
    pub async fn inspect(&self, path: &Path) -> DeploymentResult<SnapshotSummary> {
        let bytes = tokio::fs::read(path).await?;
        let artifact = SnapshotArtifact::decode(&bytes, &path.display().to_string())?;
        Ok(SnapshotSummary {
            path: path.to_path_buf(),
            bytes: bytes.len() as u64,
            world_version: artifact.world_version,
            entity_count: artifact.entity_count(),
            type_counts: artifact.type_counts(),
        })
    }

    /// Takes a point-in-time copy of `world` and writes it to the snapshot directory.
    ///
    /// The copy is taken in one read batch, so a concurrent update is either fully in
    /// the capture or fully absent.
    pub async fn capture(
        &self,
        world: &WorldState,
        deployment: &str,
        cancel: &CancellationToken,
    ) -> DeploymentResult<SnapshotArtifact> {
        let mut artifact = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(DeploymentError::Cancelled { phase: Phase::Capture });
            }
            artifact = world.read_consistent() => artifact,
        };

        let file_name = format!(
            "{}-{}.{}",
            deployment,
            Utc::now().format("%Y%m%d-%H%M%S%.3f"),
            SNAPSHOT_EXTENSION
        );
        let path = self.directory.join(file_name);
        if cancel.is_cancelled() {
            return Err(DeploymentError::Cancelled { phase: Phase::Capture });
        }
        self.save(&artifact, &path).await?;
        artifact.path = Some(path.clone());
        info!(
            deployment = %deployment,
            path = %path.display(),
            entities = artifact.entity_count(),
            "Captured snapshot"
        );
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema_gen::{generate, IdRegistry, ReflectedType, WireType};
    use tempfile::tempdir;

    fn entity(entity_id: u64, type_id: u32, fields: &[u8]) -> SnapshotEntity {
        SnapshotEntity {
            entity_id,
            type_id,
            fields: fields.to_vec(),
        }
    }

    fn schema() -> SchemaArtifact {
        let types = vec![
            ReflectedType::new("/Script/Game.Door").with_field("Open", WireType::Bool),
            ReflectedType::new("/Script/Game.Player").with_field("Health", WireType::Float),
        ];
        generate(&types, &IdRegistry::default()).unwrap().artifact
    }

    #[test]
    fn test_encoding_layout() {
        let snapshot = SnapshotArtifact::new(7, vec![entity(0x0102, 2, &[0xAA, 0xBB])]);
        let bytes = snapshot.encode().unwrap();
        assert_eq!(
            bytes,
            vec![
                7, 0, 0, 0, 1, 0, 0, 0, // header
                0x02, 0x01, 0, 0, 0, 0, 0, 0, // entity id
                2, 0, 0, 0, // type id
                2, 0, 0, 0, // length
                0xAA, 0xBB,
            ]
        );
        assert_eq!(SnapshotArtifact::decode(&bytes, "test").unwrap(), snapshot);
    }

    #[test]
    fn test_count_mismatch_is_corrupt() {
        let snapshot = SnapshotArtifact::new(1, vec![entity(1, 1, b"a"), entity(2, 1, b"b")]);
        let mut bytes = snapshot.encode().unwrap();

        // Header claims three entities.
        bytes[4] = 3;
        assert!(matches!(
            SnapshotArtifact::decode(&bytes, "t"),
            Err(DeploymentError::CorruptSnapshot { .. })
        ));

        // Header claims one entity, the second becomes trailing data.
        bytes[4] = 1;
        match SnapshotArtifact::decode(&bytes, "t") {
            Err(DeploymentError::CorruptSnapshot { reason, .. }) => assert!(reason.contains("trailing")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_truncation_and_duplicates_are_corrupt() {
        assert!(SnapshotArtifact::decode(&[1, 0, 0], "t").is_err());

        let bytes = SnapshotArtifact::new(1, vec![entity(1, 1, b"abcd")]).encode().unwrap();
        assert!(SnapshotArtifact::decode(&bytes[..bytes.len() - 1], "t").is_err());

        let dup = SnapshotArtifact::new(1, vec![entity(5, 1, b""), entity(5, 2, b"")]).encode().unwrap();
        match SnapshotArtifact::decode(&dup, "t") {
            Err(DeploymentError::CorruptSnapshot { reason, .. }) => assert!(reason.contains("duplicate")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_rejects_missing_type() {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 1);
        let path = dir.path().join("missing-type.snapshot");
        let snapshot = SnapshotArtifact::new(1, vec![entity(1, 1, b""), entity(2, 99, b"")]);
        manager.save(&snapshot, &path).await.unwrap();

        match manager.load(&path, &schema()).await {
            Err(DeploymentError::CorruptSnapshot { reason, .. }) => assert!(reason.contains("type id 99")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_save_load_and_inspect() {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 1);
        let path = dir.path().join("nested").join("start.snapshot");
        let snapshot = SnapshotArtifact::new(3, vec![entity(1, 1, b"x"), entity(2, 2, b"yy"), entity(3, 2, b"")]);

        manager.save(&snapshot, &path).await.unwrap();
        assert!(!path.with_extension("snapshot.tmp").exists());

        let loaded = manager.load(&path, &schema()).await.unwrap();
        assert_eq!(loaded.entities, snapshot.entities);
        assert_eq!(loaded.path.as_deref(), Some(path.as_path()));

        let summary = manager.inspect(&path).await.unwrap();
        assert_eq!(summary.world_version, 3);
        assert_eq!(summary.entity_count, 3);
        assert_eq!(summary.type_counts.get(&2), Some(&2));
    }

    #[tokio::test]
    async fn test_capture_matches_world() {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 1);
        let world = WorldState::new(1);
        world.upsert(10, 1, b"a".to_vec()).await;
        world.upsert(11, 2, b"b".to_vec()).await;
        world.upsert(12, 2, b"c".to_vec()).await;
        world.remove(11).await;

        let captured = manager.capture(&world, "demo", &CancellationToken::new()).await.unwrap();
        assert_eq!(captured.entity_count(), world.entity_count().await);

        let path = captured.path.clone().unwrap();
        let loaded = manager.load(&path, &schema()).await.unwrap();
        assert_eq!(loaded.entity_count(), 2);
    }

    #[tokio::test]
    async fn test_capture_cancelled() {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = manager.capture(&WorldState::new(1), "demo", &cancel).await;
        assert!(matches!(result, Err(DeploymentError::Cancelled { .. })));
    }
}
