//! Pattern projection: converting terminal runtime values into the typed,
//! addressed nodes external tools render.
//!
//! Conversion walks the value graph top-down. Names resolve to owned
//! strings at projection time so exported trees outlive the loaded
//! bytecode. Every projected node takes the next palette color; static
//! arrays materialize their entries by re-decoding element bytes so each
//! entry carries its own value.

use serde::Serialize;

use carve_core::{Endian, SectionId};

use crate::error::RuntimeError;
use crate::machine::VirtualMachine;
use crate::value::{Field, StructValue, Value, ValueKind};

/// A typed, addressed node describing a region of the data source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pattern {
    /// Variable or field name; `[i]` for array entries.
    pub name: String,
    pub type_name: String,
    pub address: u128,
    /// The span read to produce this node.
    pub size: u64,
    pub section: SectionId,
    pub color: u32,
    pub kind: PatternKind,
}

/// Payload of a pattern node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PatternKind {
    Bool(bool),
    Unsigned(u128),
    Signed(i128),
    Float(f64),
    Struct { members: Vec<Pattern> },
    Array { entries: Vec<Pattern> },
}

/// Canonical scalar type name for a directly exported primitive, inferred
/// from its payload and width.
fn scalar_type_name(kind: &ValueKind, size: u64) -> String {
    match kind {
        ValueKind::Bool(_) => "bool".to_owned(),
        ValueKind::Unsigned(_) => format!("u{}", size * 8),
        ValueKind::Signed(_) => format!("s{}", size * 8),
        ValueKind::Float(_) => {
            if size == 4 {
                "float".to_owned()
            } else {
                "double".to_owned()
            }
        }
        _ => String::new(),
    }
}

impl VirtualMachine {
    /// Convert a runtime value into a pattern tree.
    pub(crate) fn project_value(
        &mut self,
        value: &Value,
        name: Option<&str>,
    ) -> Result<Pattern, RuntimeError> {
        let (size, address, section, kind) = {
            let cell = value.borrow();
            (cell.size, cell.address, cell.section, cell.kind.clone())
        };
        let name = name.unwrap_or_default().to_owned();

        // forwarders add no node of their own
        if let ValueKind::Nested(inner) = &kind {
            return self.project_value(inner, Some(&name));
        }
        if let ValueKind::FieldRef(field) = &kind {
            let field = field
                .upgrade()
                .ok_or_else(|| RuntimeError::mismatch("field reference outlived its struct"))?;
            let field = field.borrow();
            return self.project_field(&field);
        }

        let color = self.colors.next_color();

        match kind {
            ValueKind::Bool(v) => Ok(Pattern {
                name,
                type_name: "bool".to_owned(),
                address,
                size,
                section,
                color,
                kind: PatternKind::Bool(v),
            }),
            ValueKind::Unsigned(v) => Ok(Pattern {
                name,
                type_name: scalar_type_name(&ValueKind::Unsigned(v), size),
                address,
                size,
                section,
                color,
                kind: PatternKind::Unsigned(v),
            }),
            ValueKind::Signed(v) => Ok(Pattern {
                name,
                type_name: scalar_type_name(&ValueKind::Signed(v), size),
                address,
                size,
                section,
                color,
                kind: PatternKind::Signed(v),
            }),
            ValueKind::Float(v) => Ok(Pattern {
                name,
                type_name: scalar_type_name(&ValueKind::Float(v), size),
                address,
                size,
                section,
                color,
                kind: PatternKind::Float(v),
            }),
            ValueKind::Nested(_) | ValueKind::FieldRef(_) => {
                unreachable!("forwarders handled above")
            }
            ValueKind::Struct(structure) => {
                self.project_struct(&structure, name, address, section, color)
            }
            ValueKind::StaticArray(array) => {
                let template = array.template.borrow();
                let elem_size = template.size;
                let elem_kind = template.kind.clone();
                drop(template);

                let mut entries = Vec::with_capacity(array.count as usize);
                for i in 0..array.count {
                    let entry_address = address + i as u128 * elem_size as u128;
                    let entry = self.project_element(&elem_kind, elem_size, entry_address, section, i)?;
                    entries.push(entry);
                }

                Ok(Pattern {
                    name,
                    type_name: format!(
                        "{}[{}]",
                        self.symbols.display(array.elem_type),
                        array.count
                    ),
                    address,
                    size: elem_size * array.count,
                    section,
                    color,
                    kind: PatternKind::Array { entries },
                })
            }
            ValueKind::DynamicArray(array) => {
                let mut entries = Vec::with_capacity(array.values.len());
                for (i, element) in array.values.iter().enumerate() {
                    let mut entry = self.project_value(element, Some(&format!("[{i}]")))?;
                    if entry.type_name.is_empty() {
                        entry.type_name = self.symbols.display(array.elem_type);
                    }
                    entries.push(entry);
                }
                let total = entries.iter().map(|e| e.size).sum();

                Ok(Pattern {
                    name,
                    type_name: format!(
                        "{}[{}]",
                        self.symbols.display(array.elem_type),
                        array.values.len()
                    ),
                    address,
                    size: total,
                    section,
                    color,
                    kind: PatternKind::Array { entries },
                })
            }
        }
    }

    fn project_struct(
        &mut self,
        structure: &StructValue,
        name: String,
        address: u128,
        section: SectionId,
        color: u32,
    ) -> Result<Pattern, RuntimeError> {
        let mut members = Vec::with_capacity(structure.fields.len());
        for field in structure.fields.values() {
            members.push(self.project_field(&field.borrow())?);
        }
        let size = members.iter().map(|m| m.size).sum();

        Ok(Pattern {
            name,
            type_name: self.symbols.display(structure.header.type_name),
            address,
            size,
            section,
            color,
            kind: PatternKind::Struct { members },
        })
    }

    /// Project a field's value, naming and typing the node from the field
    /// header.
    fn project_field(&mut self, field: &Field) -> Result<Pattern, RuntimeError> {
        let name = self.symbols.display(field.header.name);
        let mut pattern = self.project_value(&field.value, Some(&name))?;
        let declared = self.symbols.display(field.header.type_name);
        if !declared.is_empty() && declared != "<null>" {
            pattern.type_name = declared;
        }
        Ok(pattern)
    }

    /// Materialize one static-array entry by re-decoding its bytes.
    fn project_element(
        &mut self,
        elem_kind: &ValueKind,
        elem_size: u64,
        address: u128,
        section: SectionId,
        index: u64,
    ) -> Result<Pattern, RuntimeError> {
        let mut buffer = [0u8; 16];
        self.read_data(address, &mut buffer[..elem_size as usize])?;
        let bytes = &buffer[..elem_size as usize];
        let endian = self.endian;

        let kind = match elem_kind {
            ValueKind::Bool(_) => PatternKind::Bool(bytes[0] != 0),
            ValueKind::Unsigned(_) => PatternKind::Unsigned(decode_entry_unsigned(bytes, endian)),
            ValueKind::Signed(_) => {
                PatternKind::Signed(decode_entry_signed(bytes, endian, elem_size))
            }
            ValueKind::Float(_) => {
                let raw = decode_entry_unsigned(bytes, endian);
                PatternKind::Float(if elem_size == 4 {
                    f32::from_bits(raw as u32) as f64
                } else {
                    f64::from_bits(raw as u64)
                })
            }
            _ => {
                return Err(RuntimeError::mismatch(
                    "static array template is not a scalar",
                ))
            }
        };

        Ok(Pattern {
            name: format!("[{index}]"),
            type_name: scalar_type_name(elem_kind, elem_size),
            address,
            size: elem_size,
            section,
            color: self.colors.next_color(),
            kind,
        })
    }
}

fn decode_entry_unsigned(bytes: &[u8], endian: Endian) -> u128 {
    let mut buffer = [0u8; 16];
    match endian {
        Endian::Little => {
            buffer[..bytes.len()].copy_from_slice(bytes);
            u128::from_le_bytes(buffer)
        }
        Endian::Big => {
            buffer[16 - bytes.len()..].copy_from_slice(bytes);
            u128::from_be_bytes(buffer)
        }
    }
}

fn decode_entry_signed(bytes: &[u8], endian: Endian, size: u64) -> i128 {
    let unsigned = decode_entry_unsigned(bytes, endian);
    let bits = size as u32 * 8;
    if bits == 128 {
        return unsigned as i128;
    }
    let sign_bit = 1u128 << (bits - 1);
    if unsigned & sign_bit != 0 {
        (unsigned | (u128::MAX << bits)) as i128
    } else {
        unsigned as i128
    }
}

impl Pattern {
    /// Depth-first iteration over this pattern and its descendants.
    pub fn walk(&self) -> Vec<&Pattern> {
        let mut out = vec![self];
        match &self.kind {
            PatternKind::Struct { members } => {
                for member in members {
                    out.extend(member.walk());
                }
            }
            PatternKind::Array { entries } => {
                for entry in entries {
                    out.extend(entry.walk());
                }
            }
            _ => {}
        }
        out
    }

    /// Whether the pattern's span contains the address.
    pub fn contains(&self, address: u128) -> bool {
        address >= self.address && address < self.address + self.size as u128
    }
}

/// A scalar value carried by a leaf pattern, for host convenience.
impl Pattern {
    pub fn as_unsigned(&self) -> Option<u128> {
        match self.kind {
            PatternKind::Unsigned(v) => Some(v),
            PatternKind::Bool(v) => Some(v as u128),
            _ => None,
        }
    }

    pub fn as_signed(&self) -> Option<i128> {
        match self.kind {
            PatternKind::Signed(v) => Some(v),
            _ => None,
        }
    }

    /// Struct members or array entries, empty for leaves.
    pub fn children(&self) -> &[Pattern] {
        match &self.kind {
            PatternKind::Struct { members } => members,
            PatternKind::Array { entries } => entries,
            _ => &[],
        }
    }
}
