//! # Reflection Input and Schema Descriptor Types
//!
//! Two families of types live here:
//!
//! - **Reflected types** ([`ReflectedType`], [`ReflectedField`], [`ReflectedRpc`]) are what the
//!   engine's reflection export hands us. They carry names and shapes but no stable ids.
//! - **Descriptors** ([`TypeDescriptor`], [`FieldDescriptor`], [`RpcDescriptor`]) are the
//!   generator's output. Every descriptor carries an id that stays stable across regenerations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire representation of a replicated value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireType {
    Bool,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Float,
    Double,
    String,
    Bytes,
    /// Reference to another entity in the world.
    EntityId,
    /// Reference to an engine object that may live on another worker.
    ObjectRef,
    List(Box<WireType>),
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireType::Bool => f.write_str("bool"),
            WireType::Int32 => f.write_str("int32"),
            WireType::Int64 => f.write_str("int64"),
            WireType::Uint32 => f.write_str("uint32"),
            WireType::Uint64 => f.write_str("uint64"),
            WireType::Float => f.write_str("float"),
            WireType::Double => f.write_str("double"),
            WireType::String => f.write_str("string"),
            WireType::Bytes => f.write_str("bytes"),
            WireType::EntityId => f.write_str("EntityId"),
            WireType::ObjectRef => f.write_str("UnrealObjectRef"),
            WireType::List(inner) => write!(f, "list<{inner}>"),
        }
    }
}

/// Lifetime condition attached to a replicated property by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationCondition {
    #[default]
    None,
    InitialOnly,
    OwnerOnly,
    SkipOwner,
    SimulatedOnly,
    AutonomousOnly,
    SimulatedOrPhysics,
    InitialOrOwner,
    Custom,
}

impl ReplicationCondition {
    /// Owner-only and autonomous-only properties go to a single client, everything else to all.
    pub fn group(self) -> ReplicationGroup {
        match self {
            ReplicationCondition::OwnerOnly | ReplicationCondition::AutonomousOnly => {
                ReplicationGroup::SingleClient
            }
            _ => ReplicationGroup::MultiClient,
        }
    }
}

/// Audience a replicated field is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationGroup {
    SingleClient,
    MultiClient,
}

impl ReplicationGroup {
    pub fn name(self) -> &'static str {
        match self {
            ReplicationGroup::SingleClient => "SingleClient",
            ReplicationGroup::MultiClient => "MultiClient",
        }
    }
}

/// Direction of a remote procedure call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcKind {
    Client,
    Server,
    NetMulticast,
}

impl RpcKind {
    pub fn name(self) -> &'static str {
        match self {
            RpcKind::Client => "Client",
            RpcKind::Server => "Server",
            RpcKind::NetMulticast => "NetMulticast",
        }
    }
}

/// A replicated type as reported by the engine's reflection export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectedType {
    /// Fully qualified type name, e.g. `/Script/Game.PlayerCharacter`
    pub qualified_name: String,
    /// Previous qualified name when the type was renamed since the last generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
    #[serde(default)]
    pub fields: Vec<ReflectedField>,
    #[serde(default)]
    pub rpcs: Vec<ReflectedRpc>,
}

impl ReflectedType {
    pub fn new(qualified_name: impl Into<String>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            renamed_from: None,
            fields: Vec::new(),
            rpcs: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, wire_type: WireType) -> Self {
        self.fields.push(ReflectedField::new(name, wire_type));
        self
    }
}

/// A replicated property as reported by reflection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectedField {
    pub name: String,
    pub wire_type: WireType,
    #[serde(default)]
    pub condition: ReplicationCondition,
    /// Whether the property migrates with the entity when authority moves between workers
    #[serde(default)]
    pub handover: bool,
    /// Explicit id requested by the engine; normally left to the id registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
}

impl ReflectedField {
    pub fn new(name: impl Into<String>, wire_type: WireType) -> Self {
        Self {
            name: name.into(),
            wire_type,
            condition: ReplicationCondition::None,
            handover: false,
            id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReflectedParam {
    pub name: String,
    pub wire_type: WireType,
}

/// A remote procedure declared on a replicated type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectedRpc {
    pub name: String,
    pub kind: RpcKind,
    #[serde(default)]
    pub params: Vec<ReflectedParam>,
}

/// Generated description of one replicated type.
///
/// Immutable once produced; fields and RPCs are kept sorted by id so that the
/// serialized form is canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub id: u32,
    pub qualified_name: String,
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub rpcs: Vec<RpcDescriptor>,
}

impl TypeDescriptor {
    /// Identifier-safe form of the qualified name, used for file and component names.
    pub fn schema_name(&self) -> String {
        sanitize_identifier(&self.qualified_name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields_in_group(&self, group: ReplicationGroup) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(move |f| f.group == group)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub id: u32,
    pub name: String,
    pub wire_type: WireType,
    pub group: ReplicationGroup,
    /// Handover handle, present only for fields that migrate between workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handover_handle: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RpcDescriptor {
    pub id: u32,
    pub name: String,
    pub kind: RpcKind,
    pub params: Vec<ReflectedParam>,
}

/// Turns `/Script/Game.PlayerCharacter` into `Script_Game_PlayerCharacter`.
pub fn sanitize_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_groups() {
        assert_eq!(ReplicationCondition::OwnerOnly.group(), ReplicationGroup::SingleClient);
        assert_eq!(ReplicationCondition::AutonomousOnly.group(), ReplicationGroup::SingleClient);
        assert_eq!(ReplicationCondition::SkipOwner.group(), ReplicationGroup::MultiClient);
        assert_eq!(ReplicationCondition::None.group(), ReplicationGroup::MultiClient);
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("/Script/Game.PlayerCharacter"), "Script_Game_PlayerCharacter");
        assert_eq!(sanitize_identifier("game::Door"), "game_Door");
        assert_eq!(sanitize_identifier("3dWidget"), "_3dWidget");
    }

    #[test]
    fn test_wire_type_display() {
        assert_eq!(WireType::List(Box::new(WireType::Uint32)).to_string(), "list<uint32>");
        assert_eq!(WireType::ObjectRef.to_string(), "UnrealObjectRef");
    }

    #[test]
    fn test_reflected_field_defaults_from_json() {
        let field: ReflectedField =
            serde_json::from_str(r#"{"name":"Health","wire_type":"float"}"#).unwrap();
        assert_eq!(field.condition, ReplicationCondition::None);
        assert!(!field.handover);
        assert!(field.id.is_none());
    }

    #[test]
    fn test_rpc_descriptors_hash_by_params() {
        use std::collections::HashSet;

        let rpc = |param: &str| RpcDescriptor {
            id: 1,
            name: "ServerFire".to_string(),
            kind: RpcKind::Server,
            params: vec![ReflectedParam {
                name: param.to_string(),
                wire_type: WireType::Float,
            }],
        };
        let set: HashSet<RpcDescriptor> = [rpc("Origin"), rpc("Origin"), rpc("Direction")].into_iter().collect();
        assert_eq!(set.len(), 2);
    }
}
