//! Schema generation.
//!
//! [`generate`] is the pure core: reflected types plus the prior id registry in, a
//! content-addressed artifact plus the updated registry out. [`SchemaGenerator`] wraps it
//! with the feed, the registry file and the output folder.

use crate::artifact::SchemaArtifact;
use crate::error::{SchemaError, SchemaResult};
use crate::feed::TypeFeed;
use crate::registry::{IdRegistry, TypeEntry};
use crate::types::{FieldDescriptor, ReflectedType, RpcDescriptor, TypeDescriptor};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of one generation run.
#[derive(Debug, Clone)]
pub struct Generation {
    pub artifact: SchemaArtifact,
    /// Registry to persist for the next run
    pub registry: IdRegistry,
    /// Types that received a fresh id in this run
    pub new_types: Vec<String>,
    /// Types that disappeared from the feed in this run
    pub retired_types: Vec<String>,
}

/// Assigns stable ids to `types` using `prior` and builds the schema artifact.
///
/// Ids recorded in `prior` are never changed and never handed to another member, even
/// after the member that owned them disappears.
pub fn generate(types: &[ReflectedType], prior: &IdRegistry) -> SchemaResult<Generation> {
    prior.validate()?;
    let mut registry = prior.clone();

    let mut live: BTreeSet<&str> = BTreeSet::new();
    for t in types {
        if !live.insert(t.qualified_name.as_str()) {
            return Err(SchemaError::DuplicateType(t.qualified_name.clone()));
        }
    }

    for t in types {
        let Some(old_name) = &t.renamed_from else {
            continue;
        };
        if registry.types.contains_key(&t.qualified_name) || live.contains(old_name.as_str()) {
            continue;
        }
        if let Some(mut entry) = registry.types.remove(old_name) {
            entry.retired = false;
            info!(from = %old_name, to = %t.qualified_name, id = entry.id, "Carrying type id over rename");
            registry.types.insert(t.qualified_name.clone(), entry);
        }
    }

    let mut retired_types = Vec::new();
    for (name, entry) in registry.types.iter_mut() {
        if !entry.retired && !live.contains(name.as_str()) {
            entry.retired = true;
            retired_types.push(name.clone());
        }
    }

    let mut ordered: Vec<&ReflectedType> = types.iter().collect();
    ordered.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));

    let mut new_types = Vec::new();
    let mut descriptors = Vec::with_capacity(ordered.len());
    for t in ordered {
        let next_id = registry.smallest_unused_type_id();
        let entry = registry.types.entry(t.qualified_name.clone()).or_insert_with(|| {
            new_types.push(t.qualified_name.clone());
            TypeEntry::new(next_id)
        });
        if entry.retired {
            debug!(type_name = %t.qualified_name, id = entry.id, "Reviving retired type id");
            entry.retired = false;
        }
        descriptors.push(build_descriptor(t, entry)?);
    }

    let artifact = SchemaArtifact::new(descriptors)?;
    Ok(Generation {
        artifact,
        registry,
        new_types,
        retired_types,
    })
}

fn build_descriptor(t: &ReflectedType, entry: &mut TypeEntry) -> SchemaResult<TypeDescriptor> {
    let type_name = &t.qualified_name;

    let mut field_names: BTreeSet<&str> = BTreeSet::new();
    for field in &t.fields {
        if !field_names.insert(field.name.as_str()) {
            return Err(SchemaError::DuplicateMember {
                type_name: type_name.clone(),
                member: field.name.clone(),
            });
        }
    }

    // Pinned ids are checked and reserved before any free id is handed out.
    let mut pinned: BTreeMap<u32, &str> = BTreeMap::new();
    for field in &t.fields {
        let Some(id) = field.id else { continue };
        if id == 0 {
            return Err(SchemaError::ZeroId {
                type_name: type_name.clone(),
                member: field.name.clone(),
            });
        }
        if let Some(first) = pinned.insert(id, field.name.as_str()) {
            return Err(SchemaError::Conflict {
                type_name: type_name.clone(),
                id,
                first: first.to_string(),
                second: field.name.clone(),
            });
        }
        if let Some(recorded) = entry.fields.get(&field.name) {
            if recorded.id != id {
                return Err(SchemaError::IdReassigned {
                    type_name: type_name.clone(),
                    member: field.name.clone(),
                    recorded: recorded.id,
                    requested: id,
                });
            }
        }
        if let Some(owner) = entry.fields.owner_of(id) {
            if owner != field.name {
                return Err(SchemaError::Conflict {
                    type_name: type_name.clone(),
                    id,
                    first: owner.to_string(),
                    second: field.name.clone(),
                });
            }
        }
    }

    let retired_fields = entry.fields.retire_missing(&field_names);
    if !retired_fields.is_empty() {
        warn!(type_name = %type_name, fields = ?retired_fields, "Retiring removed fields");
    }

    let reserved: BTreeSet<u32> = pinned.keys().copied().collect();
    let mut handover_handle = 0u32;
    let mut fields = Vec::with_capacity(t.fields.len());
    for field in &t.fields {
        let id = match (entry.fields.get(&field.name), field.id) {
            (Some(recorded), _) => recorded.id,
            (None, Some(pinned_id)) => pinned_id,
            (None, None) => entry.fields.smallest_unused(&reserved),
        };
        entry.fields.record(&field.name, id);

        let handle = if field.handover {
            handover_handle += 1;
            Some(handover_handle)
        } else {
            None
        };
        fields.push(FieldDescriptor {
            id,
            name: field.name.clone(),
            wire_type: field.wire_type.clone(),
            group: field.condition.group(),
            handover_handle: handle,
        });
    }
    fields.sort_by_key(|f| f.id);

    let mut rpc_names: BTreeSet<&str> = BTreeSet::new();
    for rpc in &t.rpcs {
        if !rpc_names.insert(rpc.name.as_str()) {
            return Err(SchemaError::DuplicateMember {
                type_name: type_name.clone(),
                member: rpc.name.clone(),
            });
        }
    }
    entry.rpcs.retire_missing(&rpc_names);

    let mut rpcs = Vec::with_capacity(t.rpcs.len());
    for rpc in &t.rpcs {
        let id = match entry.rpcs.get(&rpc.name) {
            Some(recorded) => recorded.id,
            None => entry.rpcs.smallest_unused(&BTreeSet::new()),
        };
        entry.rpcs.record(&rpc.name, id);
        rpcs.push(RpcDescriptor {
            id,
            name: rpc.name.clone(),
            kind: rpc.kind,
            params: rpc.params.clone(),
        });
    }
    rpcs.sort_by_key(|r| r.id);

    Ok(TypeDescriptor {
        id: entry.id,
        qualified_name: type_name.clone(),
        fields,
        rpcs,
    })
}

/// Generates schema from a type feed, keeping the id registry on disk up to date.
pub struct SchemaGenerator {
    feed: Arc<dyn TypeFeed>,
    registry_path: PathBuf,
    output_dir: PathBuf,
}

impl SchemaGenerator {
    pub fn new(feed: Arc<dyn TypeFeed>, registry_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            feed,
            registry_path: registry_path.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Runs a generation and persists both the registry and the emitted schema files.
    ///
    /// The registry is only written when generation succeeds, so a conflicting feed
    /// leaves the recorded ids untouched.
    pub fn generate(&self) -> SchemaResult<Generation> {
        let types = self.feed.reflected_types()?;
        let prior = IdRegistry::load(&self.registry_path)?;
        let generation = generate(&types, &prior)?;

        generation.registry.save(&self.registry_path)?;
        generation.artifact.write_to_dir(&self.output_dir)?;

        for name in &generation.new_types {
            info!(type_name = %name, "New replicated type");
        }
        for name in &generation.retired_types {
            warn!(type_name = %name, "Replicated type removed, id retired");
        }
        info!(
            hash = %generation.artifact.short_hash(),
            types = generation.artifact.type_descriptors.len(),
            output = %self.output_dir.display(),
            "Schema generated"
        );
        Ok(generation)
    }
}
