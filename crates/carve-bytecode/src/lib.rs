//! Bytecode representation for compiled carve programs.
//!
//! A [`Bytecode`] is a symbol table plus an ordered list of [`Function`]s.
//! Constructors for named complex types are regular functions under the
//! mangled name `<init><TypeName>`; the program entry point is `<main>`.
//! The [`Emitter`] appends instructions to one function body, manages
//! forward-patched labels, and tracks local variable types.

mod dump;
mod emitter;
mod instructions;

pub use emitter::{EmitError, Emitter, EmitterFlags, Label};
pub use instructions::{Bytecode, Function, Instruction, Opcode};

/// Local slot binding the current constructor receiver.
pub const THIS_NAME: &str = "<this>";

/// Name prefix for type constructor functions.
pub const CTOR_PREFIX: &str = "<init>";

/// Name of the program entry point function.
pub const MAIN_NAME: &str = "<main>";

/// Reserved local name aliasing the reader cursor: storing to it moves the
/// cursor instead of binding a local.
pub const ADDRESS_NAME: &str = "$";

/// Mangled constructor name for a type.
pub fn ctor_name(type_name: &str) -> String {
    format!("{CTOR_PREFIX}{type_name}")
}
