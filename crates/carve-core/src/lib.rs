//! Core data structures shared by the carve compiler and virtual machine.
//!
//! Three layers:
//! - **Symbols**: interned strings and numeric literals with stable 16-bit ids
//! - **Types**: the builtin/complex type descriptor and its classification predicates
//! - **Runtime constants**: endianness, bitfield order, section ids, pattern palette

mod palette;
mod symbol;
mod types;

pub use palette::{ColorWheel, PALETTE};
pub use symbol::{Symbol, SymbolId, SymbolTable};
pub use types::{TypeId, TypeInfo};

/// Byte order used when decoding scalars from the data source.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// The host platform's byte order.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }
}

/// Bit allocation order inside bitfields.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum BitfieldOrder {
    #[default]
    RightToLeft,
    LeftToRight,
}

/// Logical address namespace for a value or pattern.
pub type SectionId = u64;

/// The main input byte stream.
pub const MAIN_SECTION: SectionId = 0;

/// Synthetic heap section for values not backed by the data source.
pub const HEAP_SECTION: SectionId = 0xFFFF_FFFF_FFFF_FFFE;
