//! Content-addressed schema artifact.

use crate::error::{SchemaError, SchemaResult};
use crate::types::TypeDescriptor;
use crate::writer::render_type_schema;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the manifest file handed to workers via `--schema=`.
pub const MANIFEST_FILE: &str = "schema.json";

/// One generated schema.
///
/// The hash covers the sorted descriptors only, so two generations from the same feed
/// and registry share a hash even though their timestamps differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaArtifact {
    pub hash: String,
    pub type_descriptors: Vec<TypeDescriptor>,
    pub generated_at: DateTime<Utc>,
}

impl SchemaArtifact {
    pub fn new(mut type_descriptors: Vec<TypeDescriptor>) -> SchemaResult<Self> {
        type_descriptors.sort_by_key(|t| t.id);
        let hash = Self::compute_hash(&type_descriptors)?;
        Ok(Self {
            hash,
            type_descriptors,
            generated_at: Utc::now(),
        })
    }

    /// SHA-256 over the canonical JSON encoding of the descriptors.
    pub fn compute_hash(type_descriptors: &[TypeDescriptor]) -> SchemaResult<String> {
        let canonical = serde_json::to_vec(type_descriptors)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    /// Recomputes the hash and checks ordering and id uniqueness.
    pub fn verify(&self) -> SchemaResult<()> {
        for pair in self.type_descriptors.windows(2) {
            if pair[0].id >= pair[1].id {
                return Err(SchemaError::TypeIdConflict {
                    id: pair[1].id,
                    first: pair[0].qualified_name.clone(),
                    second: pair[1].qualified_name.clone(),
                });
            }
        }
        let computed = Self::compute_hash(&self.type_descriptors)?;
        if computed != self.hash {
            return Err(SchemaError::HashMismatch {
                recorded: self.hash.clone(),
                computed,
            });
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.verify().is_ok()
    }

    pub fn short_hash(&self) -> &str {
        &self.hash[..self.hash.len().min(12)]
    }

    pub fn type_by_id(&self, id: u32) -> Option<&TypeDescriptor> {
        self.type_descriptors
            .binary_search_by_key(&id, |t| t.id)
            .ok()
            .map(|idx| &self.type_descriptors[idx])
    }

    pub fn contains_type(&self, id: u32) -> bool {
        self.type_by_id(id).is_some()
    }

    pub fn find_type(&self, qualified_name: &str) -> Option<&TypeDescriptor> {
        self.type_descriptors.iter().find(|t| t.qualified_name == qualified_name)
    }

    /// Writes one `.schema` file per type plus the JSON manifest. Returns the manifest path.
    ///
    /// Fails before writing anything when two types map to the same file name.
    pub fn write_to_dir(&self, dir: &Path) -> SchemaResult<PathBuf> {
        let mut files: HashMap<String, &TypeDescriptor> = HashMap::new();
        for descriptor in &self.type_descriptors {
            let file_name = format!("{}.schema", descriptor.schema_name());
            if let Some(first) = files.get(&file_name) {
                return Err(SchemaError::FileNameCollision {
                    file_name,
                    first: first.qualified_name.clone(),
                    second: descriptor.qualified_name.clone(),
                });
            }
            files.insert(file_name, descriptor);
        }

        std::fs::create_dir_all(dir)?;
        for descriptor in &self.type_descriptors {
            let path = dir.join(format!("{}.schema", descriptor.schema_name()));
            std::fs::write(&path, render_type_schema(descriptor))?;
            debug!(path = %path.display(), "Wrote schema file");
        }
        let manifest = dir.join(MANIFEST_FILE);
        std::fs::write(&manifest, serde_json::to_string_pretty(self)?)?;
        Ok(manifest)
    }

    /// Reads a manifest written by [`SchemaArtifact::write_to_dir`] and verifies it.
    pub fn load_manifest(path: &Path) -> SchemaResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let artifact: SchemaArtifact = serde_json::from_str(&content)?;
        artifact.verify()?;
        Ok(artifact)
    }
}
