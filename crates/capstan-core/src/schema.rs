//! The schema adapter seam.
//!
//! Schema compilation is an external collaborator: something else turns IDL
//! into the descriptors below. The engine only needs struct sizes, field
//! windows, and method metadata, so that is all the seam carries.

use crate::layout::StructSize;

/// Where a field lives within its struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSlot {
    /// A window in the data section plus the schema-declared default,
    /// returned whenever the window falls outside the payload.
    Data {
        bit_align: u32,
        bit_len: u32,
        default: u64,
    },
    /// An index into the pointer section.
    Pointer { idx: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub slot: FieldSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: &'static str,
    pub interface_id: u64,
    pub method_id: u16,
    pub params: StructSize,
    pub results: StructSize,
}

/// One node of a compiled schema.
#[derive(Debug, Clone, Copy)]
pub struct SchemaNode {
    pub id: u64,
    pub name: &'static str,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Copy)]
pub enum NodeKind {
    Struct {
        size: StructSize,
        fields: &'static [FieldDescriptor],
    },
    Interface {
        methods: &'static [MethodDescriptor],
    },
}

impl SchemaNode {
    /// The struct size of a struct node.
    pub fn struct_size(&self) -> Option<StructSize> {
        match self.kind {
            NodeKind::Struct { size, .. } => Some(size),
            NodeKind::Interface { .. } => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&'static FieldDescriptor> {
        match self.kind {
            NodeKind::Struct { fields, .. } => fields.iter().find(|f| f.name == name),
            NodeKind::Interface { .. } => None,
        }
    }

    pub fn method(&self, method_id: u16) -> Option<&'static MethodDescriptor> {
        match self.kind {
            NodeKind::Interface { methods } => {
                methods.iter().find(|m| m.method_id == method_id)
            }
            NodeKind::Struct { .. } => None,
        }
    }
}

/// Lookup surface the engine expects from a compiled schema.
pub trait SchemaAdapter {
    fn node(&self, id: u64) -> Option<&SchemaNode>;

    fn struct_size(&self, id: u64) -> Option<StructSize> {
        self.node(id).and_then(|n| n.struct_size())
    }

    fn method(&self, interface_id: u64, method_id: u16) -> Option<&'static MethodDescriptor> {
        self.node(interface_id).and_then(|n| n.method(method_id))
    }
}

/// A schema backed by a static node table, the form generated descriptor
/// tables take.
#[derive(Debug, Clone, Copy)]
pub struct StaticSchema {
    pub nodes: &'static [SchemaNode],
}

impl SchemaAdapter for StaticSchema {
    fn node(&self, id: u64) -> Option<&SchemaNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POINT_FIELDS: &[FieldDescriptor] = &[
        FieldDescriptor {
            name: "x",
            slot: FieldSlot::Data { bit_align: 0, bit_len: 32, default: 0 },
        },
        FieldDescriptor {
            name: "y",
            slot: FieldSlot::Data { bit_align: 32, bit_len: 32, default: 7 },
        },
        FieldDescriptor {
            name: "label",
            slot: FieldSlot::Pointer { idx: 0 },
        },
    ];

    const NODES: &[SchemaNode] = &[SchemaNode {
        id: 0x1001,
        name: "Point",
        kind: NodeKind::Struct {
            size: StructSize::new(1, 1),
            fields: POINT_FIELDS,
        },
    }];

    #[test]
    fn static_schema_lookup() {
        let schema = StaticSchema { nodes: NODES };
        let node = schema.node(0x1001).unwrap();
        assert_eq!(node.struct_size(), Some(StructSize::new(1, 1)));
        assert!(matches!(
            node.field("y").unwrap().slot,
            FieldSlot::Data { default: 7, .. }
        ));
        assert!(node.field("z").is_none());
        assert!(schema.node(0x9999).is_none());
    }
}
