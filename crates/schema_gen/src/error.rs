//! Error types for schema generation.

use thiserror::Error;

/// Result alias used throughout the schema generator.
pub type SchemaResult<T> = Result<T, SchemaError>;

#[derive(Error, Debug)]
pub enum SchemaError {
    /// Two distinct members of one type claim the same id.
    #[error("Schema conflict in {type_name}: id {id} claimed by both '{first}' and '{second}'")]
    Conflict {
        type_name: String,
        id: u32,
        first: String,
        second: String,
    },

    /// A member pinned an id that differs from the one already recorded for it.
    #[error("Id reassignment in {type_name}: '{member}' is recorded as {recorded} but requested {requested}")]
    IdReassigned {
        type_name: String,
        member: String,
        recorded: u32,
        requested: u32,
    },

    /// Two registry types share one type id.
    #[error("Type id {id} is claimed by both '{first}' and '{second}'")]
    TypeIdConflict {
        id: u32,
        first: String,
        second: String,
    },

    /// Two qualified names sanitize to the same `.schema` file name.
    #[error("Types '{first}' and '{second}' would both be written to {file_name}")]
    FileNameCollision {
        file_name: String,
        first: String,
        second: String,
    },

    #[error("Type declared more than once in feed: {0}")]
    DuplicateType(String),

    #[error("Member '{member}' declared more than once in {type_name}")]
    DuplicateMember { type_name: String, member: String },

    #[error("Invalid id 0 pinned for '{member}' in {type_name}")]
    ZeroId { type_name: String, member: String },

    #[error("Schema artifact hash mismatch: recorded {recorded}, computed {computed}")]
    HashMismatch { recorded: String, computed: String },

    #[error("Type feed error: {0}")]
    Feed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
