//! Persistent id registry.
//!
//! The registry remembers every type id and member id ever handed out, including
//! ids of types and members that have since disappeared from the reflection feed.
//! Retired ids are never handed out again: a deployment that cached an old mapping
//! must never see a different field arrive under an id it already knows.

use crate::error::{SchemaError, SchemaResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info};

/// One recorded id within an id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEntry {
    pub id: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retired: bool,
}

/// Name to id map for one family of members (fields or RPCs) of a single type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdSpace {
    entries: BTreeMap<String, MemberEntry>,
}

impl IdSpace {
    pub fn get(&self, name: &str) -> Option<&MemberEntry> {
        self.entries.get(name)
    }

    /// Returns the name currently holding `id`, live or retired.
    pub fn owner_of(&self, id: u32) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.id == id)
            .map(|(name, _)| name.as_str())
    }

    /// Smallest id (starting at 1) that was never recorded and is not in `reserved`.
    pub fn smallest_unused(&self, reserved: &BTreeSet<u32>) -> u32 {
        let used: BTreeSet<u32> = self.entries.values().map(|e| e.id).collect();
        (1..)
            .find(|id| !used.contains(id) && !reserved.contains(id))
            .unwrap_or(u32::MAX)
    }

    pub fn record(&mut self, name: &str, id: u32) {
        self.entries.insert(name.to_string(), MemberEntry { id, retired: false });
    }

    /// Marks every member not in `live` as retired. Returns the newly retired names.
    pub fn retire_missing(&mut self, live: &BTreeSet<&str>) -> Vec<String> {
        let mut retired = Vec::new();
        for (name, entry) in self.entries.iter_mut() {
            if !entry.retired && !live.contains(name.as_str()) {
                entry.retired = true;
                retired.push(name.clone());
            }
        }
        retired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn validate(&self, type_name: &str) -> SchemaResult<()> {
        let mut owners: BTreeMap<u32, &str> = BTreeMap::new();
        for (name, entry) in &self.entries {
            if entry.id == 0 {
                return Err(SchemaError::ZeroId {
                    type_name: type_name.to_string(),
                    member: name.clone(),
                });
            }
            if let Some(first) = owners.insert(entry.id, name) {
                return Err(SchemaError::Conflict {
                    type_name: type_name.to_string(),
                    id: entry.id,
                    first: first.to_string(),
                    second: name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Recorded ids for one replicated type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeEntry {
    pub id: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retired: bool,
    #[serde(default)]
    pub fields: IdSpace,
    #[serde(default)]
    pub rpcs: IdSpace,
}

impl TypeEntry {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            retired: false,
            fields: IdSpace::default(),
            rpcs: IdSpace::default(),
        }
    }
}

/// The full id map, keyed by qualified type name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRegistry {
    #[serde(default)]
    pub types: BTreeMap<String, TypeEntry>,
}

impl IdRegistry {
    /// Loads the registry from `path`, or returns an empty registry when the file is missing.
    pub fn load(path: &Path) -> SchemaResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No id registry on disk, starting empty");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let registry: IdRegistry = serde_json::from_str(&content)?;
        registry.validate()?;
        info!(path = %path.display(), types = registry.types.len(), "Loaded id registry");
        Ok(registry)
    }

    /// Writes the registry next to `path` and renames it into place.
    pub fn save(&self, path: &Path) -> SchemaResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Checks that no two types and no two members of a type share an id.
    pub fn validate(&self) -> SchemaResult<()> {
        let mut owners: BTreeMap<u32, &str> = BTreeMap::new();
        for (name, entry) in &self.types {
            if entry.id == 0 {
                return Err(SchemaError::ZeroId {
                    type_name: name.clone(),
                    member: name.clone(),
                });
            }
            if let Some(first) = owners.insert(entry.id, name) {
                return Err(SchemaError::TypeIdConflict {
                    id: entry.id,
                    first: first.to_string(),
                    second: name.clone(),
                });
            }
            entry.fields.validate(name)?;
            entry.rpcs.validate(name)?;
        }
        Ok(())
    }

    pub fn type_id(&self, qualified_name: &str) -> Option<u32> {
        self.types.get(qualified_name).map(|e| e.id)
    }

    /// Smallest type id never assigned to any type, retired ones included.
    pub fn smallest_unused_type_id(&self) -> u32 {
        let used: BTreeSet<u32> = self.types.values().map(|e| e.id).collect();
        (1..).find(|id| !used.contains(id)).unwrap_or(u32::MAX)
    }

    pub fn live_types(&self) -> impl Iterator<Item = (&String, &TypeEntry)> {
        self.types.iter().filter(|(_, e)| !e.retired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_smallest_unused_skips_retired() {
        let mut space = IdSpace::default();
        space.record("a", 1);
        space.record("b", 2);
        space.record("c", 4);
        let live: BTreeSet<&str> = ["a", "c"].into_iter().collect();
        assert_eq!(space.retire_missing(&live), vec!["b".to_string()]);
        assert_eq!(space.smallest_unused(&BTreeSet::new()), 3);
        assert_eq!(space.smallest_unused(&[3].into_iter().collect()), 5);
    }

    #[test]
    fn test_validate_detects_member_conflict() {
        let mut registry = IdRegistry::default();
        let mut entry = TypeEntry::new(1);
        entry.fields.record("Health", 1);
        entry.fields.record("Armor", 1);
        registry.types.insert("Game.Player".to_string(), entry);

        match registry.validate() {
            Err(SchemaError::Conflict { id, first, second, .. }) => {
                assert_eq!(id, 1);
                assert_eq!(first, "Armor");
                assert_eq!(second, "Health");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_detects_type_conflict() {
        let mut registry = IdRegistry::default();
        registry.types.insert("A".to_string(), TypeEntry::new(3));
        registry.types.insert("B".to_string(), TypeEntry::new(3));
        assert!(matches!(registry.validate(), Err(SchemaError::TypeIdConflict { id: 3, .. })));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ids").join("schema_ids.json");

        let mut registry = IdRegistry::default();
        let mut entry = TypeEntry::new(7);
        entry.fields.record("Health", 2);
        registry.types.insert("Game.Player".to_string(), entry);
        registry.save(&path).unwrap();

        let loaded = IdRegistry::load(&path).unwrap();
        assert_eq!(loaded, registry);
        assert_eq!(loaded.type_id("Game.Player"), Some(7));
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempdir().unwrap();
        let registry = IdRegistry::load(&dir.path().join("absent.json")).unwrap();
        assert!(registry.types.is_empty());
        assert_eq!(registry.smallest_unused_type_id(), 1);
    }
}
