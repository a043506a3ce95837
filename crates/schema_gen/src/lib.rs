//! # Schema Generator
//!
//! Turns the engine's replicated-type metadata into a versioned, content-addressed schema
//! shared by every worker of a deployment.
//!
//! ## Id stability
//!
//! Every type, field and RPC receives a small integer id. Ids are recorded in an
//! [`IdRegistry`] that survives across generations:
//!
//! * A recorded id never changes and is never handed to a different member.
//! * Members and types that disappear are marked retired; their ids stay reserved.
//! * New members receive the smallest id never used in their id space.
//!
//! Reusing an id after deletion would corrupt any running deployment that cached the old
//! mapping, so conflicts are reported as [`SchemaError::Conflict`] instead of being resolved.
//!
//! ## Usage
//!
//! ```rust
//! use schema_gen::{generate, IdRegistry, ReflectedType, WireType};
//!
//! let types = vec![ReflectedType::new("/Script/Game.Door").with_field("Open", WireType::Bool)];
//! let first = generate(&types, &IdRegistry::default()).unwrap();
//! let again = generate(&types, &first.registry).unwrap();
//! assert_eq!(first.artifact.hash, again.artifact.hash);
//! ```

pub mod artifact;
pub mod error;
pub mod feed;
pub mod generator;
pub mod registry;
pub mod types;
pub mod writer;

pub use artifact::{SchemaArtifact, MANIFEST_FILE};
pub use error::{SchemaError, SchemaResult};
pub use feed::{JsonTypeFeed, StaticTypeFeed, TypeFeed};
pub use generator::{generate, Generation, SchemaGenerator};
pub use registry::IdRegistry;
pub use types::{
    FieldDescriptor, ReflectedField, ReflectedParam, ReflectedRpc, ReflectedType,
    ReplicationCondition, ReplicationGroup, RpcDescriptor, RpcKind, TypeDescriptor, WireType,
};
