//! Virtual machine for executing compiled carve programs.
//!
//! The machine loads a [`carve_bytecode::Bytecode`], reads bytes from a
//! host-supplied data source, and materializes a tree of typed, addressed
//! [`Pattern`]s. Execution is synchronous and single-threaded; an
//! [`abort handle`](VirtualMachine::abort_handle) may flip the running flag
//! from another thread.

mod error;
mod machine;
mod pattern;
mod value;

#[cfg(test)]
mod machine_tests;

pub use error::{RuntimeError, VmError};
pub use machine::{IoOperations, Limits, VirtualMachine, VmSettings};
pub use pattern::{Pattern, PatternKind};
pub use value::{
    new_value, Attribute, DynamicArray, Field, FieldHandle, ObjectHeader, StaticArray,
    StructValue, Value, ValueCell, ValueKind,
};
