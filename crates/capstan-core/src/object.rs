//! The object layer: a reference paired with its schema node.
//!
//! [`Object`] and [`ObjectBuilder`] give field-name access over the raw
//! reference engine. Interface fields resolve to cap-table indices; the
//! capability table itself belongs to the enclosing payload, one layer up.

use crate::error::{Error, Result};
use crate::refs::{Message, Ref, RefKind};
use crate::schema::{FieldSlot, SchemaNode};

/// A typed read view: reference + schema node.
#[derive(Clone, Copy)]
pub struct Object<'a> {
    pub msg: &'a Message,
    pub r: Ref,
    pub node: &'a SchemaNode,
}

impl<'a> Object<'a> {
    pub fn new(msg: &'a Message, r: Ref, node: &'a SchemaNode) -> Object<'a> {
        Object { msg, r, node }
    }

    fn slot(&self, name: &str) -> Result<FieldSlot> {
        self.node
            .field(name)
            .map(|f| f.slot)
            .ok_or(Error::WrongKind("field not in schema"))
    }

    /// Read a data field; returns the schema default when the payload is
    /// older than the schema.
    pub fn get_data(&self, name: &str) -> Result<u64> {
        match self.slot(name)? {
            FieldSlot::Data { bit_align, bit_len, default } => {
                self.msg.read_struct_data(self.r, bit_align, bit_len, default)
            }
            FieldSlot::Pointer { .. } => Err(Error::WrongKind("pointer field read as data")),
        }
    }

    /// Decode a pointer field.
    pub fn get_ptr(&self, name: &str) -> Result<Ref> {
        match self.slot(name)? {
            FieldSlot::Pointer { idx } => self.msg.read_struct_ptr(self.r, idx),
            FieldSlot::Data { .. } => Err(Error::WrongKind("data field read as pointer")),
        }
    }

    pub fn get_text(&self, name: &str) -> Result<String> {
        let r = self.get_ptr(name)?;
        self.msg.read_text(r)
    }

    /// The cap-table index stored in an interface field, if the field is
    /// populated.
    pub fn cap_index(&self, name: &str) -> Result<Option<u32>> {
        let r = self.get_ptr(name)?;
        match r.kind {
            RefKind::Interface { cap } => Ok(Some(cap)),
            RefKind::Null => Ok(None),
            _ => Err(Error::WrongKind("interface field")),
        }
    }
}

/// A typed write view over a struct being built.
pub struct ObjectBuilder<'a> {
    pub msg: &'a mut Message,
    pub r: Ref,
    pub node: &'a SchemaNode,
}

impl<'a> ObjectBuilder<'a> {
    pub fn new(msg: &'a mut Message, r: Ref, node: &'a SchemaNode) -> ObjectBuilder<'a> {
        ObjectBuilder { msg, r, node }
    }

    fn slot(&self, name: &str) -> Result<FieldSlot> {
        self.node
            .field(name)
            .map(|f| f.slot)
            .ok_or(Error::WrongKind("field not in schema"))
    }

    pub fn set_data(&mut self, name: &str, value: u64) -> Result<()> {
        match self.slot(name)? {
            FieldSlot::Data { bit_align, bit_len, .. } => {
                self.msg.write_struct_data(self.r, bit_align, bit_len, value)
            }
            FieldSlot::Pointer { .. } => Err(Error::WrongKind("pointer field written as data")),
        }
    }

    pub fn set_text(&mut self, name: &str, value: &str) -> Result<Ref> {
        match self.slot(name)? {
            FieldSlot::Pointer { idx } => self.msg.write_text(self.r, idx, value),
            FieldSlot::Data { .. } => Err(Error::WrongKind("data field written as text")),
        }
    }

    /// Point an interface field at cap-table entry `cap_index`.
    pub fn set_cap(&mut self, name: &str, cap_index: u32) -> Result<Ref> {
        match self.slot(name)? {
            FieldSlot::Pointer { idx } => self.msg.write_cap_ptr(self.r, idx, cap_index),
            FieldSlot::Data { .. } => Err(Error::WrongKind("data field written as capability")),
        }
    }

    /// Reborrow as a read view.
    pub fn reader(&self) -> Object<'_> {
        Object { msg: self.msg, r: self.r, node: self.node }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::StructSize;
    use crate::schema::{FieldDescriptor, NodeKind};

    const FIELDS: &[FieldDescriptor] = &[
        FieldDescriptor {
            name: "count",
            slot: FieldSlot::Data { bit_align: 0, bit_len: 32, default: 0 },
        },
        FieldDescriptor {
            name: "flag",
            slot: FieldSlot::Data { bit_align: 32, bit_len: 1, default: 1 },
        },
        FieldDescriptor {
            name: "name",
            slot: FieldSlot::Pointer { idx: 0 },
        },
        FieldDescriptor {
            name: "service",
            slot: FieldSlot::Pointer { idx: 1 },
        },
    ];

    const NODE: SchemaNode = SchemaNode {
        id: 1,
        name: "Widget",
        kind: NodeKind::Struct {
            size: StructSize::new(1, 2),
            fields: FIELDS,
        },
    };

    #[test]
    fn typed_get_set_round_trip() {
        let mut msg = Message::new();
        let root = msg.init_root(StructSize::new(1, 2)).unwrap();
        let mut b = ObjectBuilder::new(&mut msg, root, &NODE);
        b.set_data("count", 12).unwrap();
        b.set_text("name", "widget-a").unwrap();
        b.set_cap("service", 0).unwrap();

        let o = Object::new(&msg, root, &NODE);
        assert_eq!(o.get_data("count").unwrap(), 12);
        assert_eq!(o.get_text("name").unwrap(), "widget-a");
        assert_eq!(o.cap_index("service").unwrap(), Some(0));
        assert!(o.cap_index("name").is_err());
    }

    #[test]
    fn defaults_apply_on_narrow_payloads() {
        // A payload written with zero data words: every data field reads as
        // its schema default.
        let mut msg = Message::new();
        let root = msg.init_root(StructSize::new(0, 2)).unwrap();
        let node = SchemaNode {
            kind: NodeKind::Struct { size: StructSize::new(0, 2), fields: FIELDS },
            ..NODE
        };
        let o = Object::new(&msg, root, &node);
        assert_eq!(o.get_data("count").unwrap(), 0);
        assert_eq!(o.get_data("flag").unwrap(), 1);
        assert_eq!(o.cap_index("service").unwrap(), None);
    }

    #[test]
    fn unknown_field_is_an_error() {
        let mut msg = Message::new();
        let root = msg.init_root(StructSize::new(1, 2)).unwrap();
        let o = Object::new(&msg, root, &NODE);
        assert!(o.get_data("bogus").is_err());
    }
}
