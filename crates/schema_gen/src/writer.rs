//! Text emission for `.schema` files.

use crate::types::{ReplicationGroup, RpcKind, TypeDescriptor, WireType};

const INDENT: &str = "    ";

/// Component slots within a type's component id block.
const COMPONENT_ID_STRIDE: u64 = 100;
const MULTI_CLIENT_OFFSET: u64 = 1;
const SINGLE_CLIENT_OFFSET: u64 = 2;
const HANDOVER_OFFSET: u64 = 3;

/// Indenting line writer.
#[derive(Debug, Default)]
pub struct CodeWriter {
    output: String,
    scope: usize,
}

impl CodeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prints `text` at the current indentation. Multi-line input is indented line by line.
    pub fn print(&mut self, text: impl AsRef<str>) -> &mut Self {
        for line in text.as_ref().lines() {
            if !line.is_empty() {
                for _ in 0..self.scope {
                    self.output.push_str(INDENT);
                }
                self.output.push_str(line);
            }
            self.output.push('\n');
        }
        self
    }

    pub fn print_new_line(&mut self) -> &mut Self {
        self.output.push('\n');
        self
    }

    pub fn indent(&mut self) -> &mut Self {
        self.scope += 1;
        self
    }

    pub fn outdent(&mut self) -> &mut Self {
        self.scope = self.scope.saturating_sub(1);
        self
    }

    /// Prints `header {` and indents.
    pub fn begin_scope(&mut self, header: impl AsRef<str>) -> &mut Self {
        self.print(format!("{} {{", header.as_ref()));
        self.indent()
    }

    pub fn end(&mut self) -> &mut Self {
        self.outdent();
        self.print("}")
    }

    pub fn as_str(&self) -> &str {
        &self.output
    }

    pub fn into_string(self) -> String {
        self.output
    }
}

pub fn component_id(type_id: u32, offset: u64) -> u64 {
    u64::from(type_id) * COMPONENT_ID_STRIDE + offset
}

fn rpc_offset(kind: RpcKind) -> u64 {
    match kind {
        RpcKind::Client => 4,
        RpcKind::Server => 5,
        RpcKind::NetMulticast => 6,
    }
}

/// `MaxWalkSpeed` becomes `max_walk_speed`.
pub fn schema_field_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else if ch.is_ascii_alphanumeric() {
            out.push(ch);
            prev_lower = true;
        } else {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
        }
    }
    out
}

fn uses_object_refs(descriptor: &TypeDescriptor) -> bool {
    fn is_ref(wire_type: &WireType) -> bool {
        match wire_type {
            WireType::ObjectRef => true,
            WireType::List(inner) => is_ref(inner),
            _ => false,
        }
    }
    descriptor.fields.iter().any(|f| is_ref(&f.wire_type))
        || descriptor
            .rpcs
            .iter()
            .flat_map(|r| r.params.iter())
            .any(|p| is_ref(&p.wire_type))
}

/// Renders the schema text for one type.
pub fn render_type_schema(descriptor: &TypeDescriptor) -> String {
    let name = descriptor.schema_name();
    let mut writer = CodeWriter::new();

    writer.print(format!(
        "// Generated from {} (type id {}). Do not edit.",
        descriptor.qualified_name, descriptor.id
    ));
    writer.print("package unreal.generated;");
    writer.print_new_line();
    if uses_object_refs(descriptor) {
        writer.print("import \"unreal/gdk/core_types.schema\";");
        writer.print_new_line();
    }

    for (group, offset) in [
        (ReplicationGroup::MultiClient, MULTI_CLIENT_OFFSET),
        (ReplicationGroup::SingleClient, SINGLE_CLIENT_OFFSET),
    ] {
        writer.begin_scope(format!("component {}{}RepData", name, group.name()));
        writer.print(format!("id = {};", component_id(descriptor.id, offset)));
        for field in descriptor.fields_in_group(group) {
            writer.print(format!(
                "{} field_{} = {};",
                field.wire_type,
                schema_field_name(&field.name),
                field.id
            ));
        }
        writer.end();
        writer.print_new_line();
    }

    let mut handover: Vec<_> = descriptor
        .fields
        .iter()
        .filter_map(|f| f.handover_handle.map(|h| (h, f)))
        .collect();
    if !handover.is_empty() {
        handover.sort_by_key(|(handle, _)| *handle);
        writer.begin_scope(format!("component {}HandoverData", name));
        writer.print(format!("id = {};", component_id(descriptor.id, HANDOVER_OFFSET)));
        for (handle, field) in handover {
            writer.print(format!(
                "{} field_{} = {};",
                field.wire_type,
                schema_field_name(&field.name),
                handle
            ));
        }
        writer.end();
        writer.print_new_line();
    }

    for rpc in &descriptor.rpcs {
        writer.begin_scope(format!("type {}{}Request", name, rpc.name));
        for (index, param) in rpc.params.iter().enumerate() {
            writer.print(format!(
                "{} field_{} = {};",
                param.wire_type,
                schema_field_name(&param.name),
                index + 1
            ));
        }
        writer.end();
        writer.print_new_line();
    }

    for kind in [RpcKind::Client, RpcKind::Server, RpcKind::NetMulticast] {
        let rpcs: Vec<_> = descriptor.rpcs.iter().filter(|r| r.kind == kind).collect();
        if rpcs.is_empty() {
            continue;
        }
        writer.begin_scope(format!("component {}{}RPCs", name, kind.name()));
        writer.print(format!("id = {};", component_id(descriptor.id, rpc_offset(kind))));
        for rpc in rpcs {
            let request = format!("{}{}Request", name, rpc.name);
            let line = match kind {
                RpcKind::NetMulticast => format!("event {} {};", request, schema_field_name(&rpc.name)),
                _ => format!(
                    "command UnrealRPCCommandResponse {}({});",
                    schema_field_name(&rpc.name),
                    request
                ),
            };
            writer.print(format!("// rpc id {}", rpc.id));
            writer.print(line);
        }
        writer.end();
        writer.print_new_line();
    }

    writer.into_string()
}
