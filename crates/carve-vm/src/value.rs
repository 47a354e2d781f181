//! The runtime value model.
//!
//! Values are reference-counted cells so a struct can own its field values
//! while field views refer back without owning (`FieldRef` is a weak
//! handle). Every cell carries the span it projects onto the data source:
//! size in bytes, origin address, and logical section.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use carve_core::{SectionId, SymbolId, MAIN_SECTION};
use indexmap::IndexMap;

/// Shared handle to a runtime value.
pub type Value = Rc<RefCell<ValueCell>>;

/// Shared handle to a struct field.
pub type FieldHandle = Rc<RefCell<Field>>;

/// Construct a fresh value handle.
pub fn new_value(kind: ValueKind, size: u64, address: u128, section: SectionId) -> Value {
    Rc::new(RefCell::new(ValueCell {
        size,
        address,
        section,
        kind,
    }))
}

/// An attribute attached to an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: SymbolId,
}

/// Common header of fields and structs: names, placement, highlight color,
/// attached attributes.
#[derive(Debug, Clone, Default)]
pub struct ObjectHeader {
    pub name: SymbolId,
    pub type_name: SymbolId,
    pub address: u128,
    pub section: SectionId,
    pub color: u32,
    pub attributes: IndexMap<SymbolId, Attribute>,
}

/// A named, typed view over one value.
#[derive(Debug, Clone)]
pub struct Field {
    pub header: ObjectHeader,
    pub value: Value,
}

/// A struct under construction or completed: ordered fields by name symbol.
#[derive(Debug, Clone, Default)]
pub struct StructValue {
    pub header: ObjectHeader,
    pub fields: IndexMap<SymbolId, FieldHandle>,
}

/// A homogeneous array represented by one template element and a count.
/// Total size is `template.size * count`.
#[derive(Debug, Clone)]
pub struct StaticArray {
    pub template: Value,
    pub elem_type: SymbolId,
    pub count: u64,
}

/// An array of individually materialized elements.
#[derive(Debug, Clone, Default)]
pub struct DynamicArray {
    pub values: Vec<Value>,
    pub elem_type: SymbolId,
}

/// Tagged payload of a value cell.
#[derive(Debug, Clone)]
pub enum ValueKind {
    Bool(bool),
    Unsigned(u128),
    Signed(i128),
    Float(f64),
    /// A value forwarding to another value.
    Nested(Value),
    /// Weak view of a field owned by some struct.
    FieldRef(Weak<RefCell<Field>>),
    Struct(StructValue),
    StaticArray(StaticArray),
    DynamicArray(DynamicArray),
}

/// One runtime value: source span metadata plus the tagged payload.
#[derive(Debug, Clone)]
pub struct ValueCell {
    /// Width in bytes when projected onto the data source.
    pub size: u64,
    /// Origin address in the source.
    pub address: u128,
    /// Logical stream the address belongs to.
    pub section: SectionId,
    pub kind: ValueKind,
}

impl Default for ValueCell {
    fn default() -> Self {
        Self {
            size: 0,
            address: 0,
            section: MAIN_SECTION,
            kind: ValueKind::Unsigned(0),
        }
    }
}

impl ValueCell {
    /// Convert to an unsigned integer, forwarding through nested values and
    /// field references. `None` for non-numeric payloads.
    pub fn to_unsigned(&self) -> Option<u128> {
        match &self.kind {
            ValueKind::Bool(b) => Some(*b as u128),
            ValueKind::Unsigned(v) => Some(*v),
            ValueKind::Signed(v) => Some(*v as u128),
            ValueKind::Nested(inner) => inner.borrow().to_unsigned(),
            ValueKind::FieldRef(field) => {
                let field = field.upgrade()?;
                let value = field.borrow().value.clone();
                let result = value.borrow().to_unsigned();
                result
            }
            _ => None,
        }
    }

    /// Convert to a signed integer; same forwarding rules as `to_unsigned`.
    pub fn to_signed(&self) -> Option<i128> {
        match &self.kind {
            ValueKind::Bool(b) => Some(*b as i128),
            ValueKind::Unsigned(v) => Some(*v as i128),
            ValueKind::Signed(v) => Some(*v),
            ValueKind::Nested(inner) => inner.borrow().to_signed(),
            ValueKind::FieldRef(field) => {
                let field = field.upgrade()?;
                let value = field.borrow().value.clone();
                let result = value.borrow().to_signed();
                result
            }
            _ => None,
        }
    }

    /// Convert to a boolean; integers are truthy when non-zero.
    pub fn to_bool(&self) -> Option<bool> {
        match &self.kind {
            ValueKind::Bool(b) => Some(*b),
            ValueKind::Unsigned(v) => Some(*v != 0),
            ValueKind::Signed(v) => Some(*v != 0),
            ValueKind::Nested(inner) => inner.borrow().to_bool(),
            ValueKind::FieldRef(field) => {
                let field = field.upgrade()?;
                let value = field.borrow().value.clone();
                let result = value.borrow().to_bool();
                result
            }
            _ => None,
        }
    }

    /// Whether the payload is an integer (either signedness).
    pub fn is_integer(&self) -> bool {
        matches!(self.kind, ValueKind::Unsigned(_) | ValueKind::Signed(_))
    }

    /// The struct payload, if this value is a struct.
    pub fn as_struct(&self) -> Option<&StructValue> {
        match &self.kind {
            ValueKind::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_struct_mut(&mut self) -> Option<&mut StructValue> {
        match &mut self.kind {
            ValueKind::Struct(s) => Some(s),
            _ => None,
        }
    }
}

impl StaticArray {
    pub fn total_size(&self) -> u64 {
        self.template.borrow().size * self.count
    }
}

impl DynamicArray {
    pub fn total_size(&self) -> u64 {
        self.values.iter().map(|v| v.borrow().size).sum()
    }
}
