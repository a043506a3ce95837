//! Reflection input.

use crate::error::{SchemaError, SchemaResult};
use crate::types::ReflectedType;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::debug;

/// Source of replicated type metadata, normally the engine's reflection export.
pub trait TypeFeed: Send + Sync {
    fn reflected_types(&self) -> SchemaResult<Vec<ReflectedType>>;
}

#[derive(Deserialize)]
struct FeedFile {
    types: Vec<ReflectedType>,
}

/// Reads a JSON export of the form `{"types": [...]}`.
#[derive(Debug, Clone)]
pub struct JsonTypeFeed {
    path: PathBuf,
}

impl JsonTypeFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TypeFeed for JsonTypeFeed {
    fn reflected_types(&self) -> SchemaResult<Vec<ReflectedType>> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            SchemaError::Feed(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let file: FeedFile = serde_json::from_str(&content)?;
        debug!(path = %self.path.display(), types = file.types.len(), "Read type feed");
        Ok(file.types)
    }
}

/// In-memory feed.
#[derive(Debug, Clone, Default)]
pub struct StaticTypeFeed {
    types: Vec<ReflectedType>,
}

impl StaticTypeFeed {
    pub fn new(types: Vec<ReflectedType>) -> Self {
        Self { types }
    }
}

impl TypeFeed for StaticTypeFeed {
    fn reflected_types(&self) -> SchemaResult<Vec<ReflectedType>> {
        Ok(self.types.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RpcKind, WireType};
    use tempfile::tempdir;

    #[test]
    fn test_json_feed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("types.json");
        std::fs::write(
            &path,
            r#"{
                "types": [
                    {
                        "qualified_name": "/Script/Game.Player",
                        "fields": [
                            {"name": "Health", "wire_type": "float"},
                            {"name": "Inventory", "wire_type": {"list": "entity_id"}, "condition": "owner_only"}
                        ],
                        "rpcs": [{"name": "ClientHit", "kind": "client"}]
                    }
                ]
            }"#,
        )
        .unwrap();

        let types = JsonTypeFeed::new(&path).reflected_types().unwrap();
        assert_eq!(types.len(), 1);
        assert_eq!(types[0].fields[1].wire_type, WireType::List(Box::new(WireType::EntityId)));
        assert_eq!(types[0].rpcs[0].kind, RpcKind::Client);
    }

    #[test]
    fn test_missing_feed_file() {
        let feed = JsonTypeFeed::new("/nonexistent/types.json");
        assert!(matches!(feed.reflected_types(), Err(SchemaError::Feed(_))));
    }
}
