//! Front end and lowering for the carve pattern language.
//!
//! The pipeline is preprocess → lex → parse → validate → lower. Each stage
//! reports coded diagnostics with line/column positions; lowering produces
//! the bytecode the virtual machine loads.

pub mod ast;
pub mod diagnostics;
pub mod lexer;
pub mod lower;
pub mod parser;
pub mod preprocess;
pub mod validate;


pub use diagnostics::{Diagnostic, Diagnostics, LineIndex, Severity};
pub use lower::{compile, CompileError};
pub use preprocess::{Preprocessed, Pragma, Preprocessor};

use carve_bytecode::Bytecode;

/// Compile preprocessed source text all the way to bytecode.
///
/// Convenience wrapper over lex → parse → validate → [`compile`]; the first
/// failing stage wins. `max_type_depth` bounds type nesting in validation.
pub fn compile_source(source: &str, max_type_depth: u64) -> Result<Bytecode, Diagnostics> {
    let tokens = lexer::lex(source);
    let (program, diagnostics) = parser::parse(source, &tokens);
    if diagnostics.has_errors() {
        return Err(diagnostics);
    }

    let diagnostics = validate::validate(&program, max_type_depth);
    if diagnostics.has_errors() {
        return Err(diagnostics);
    }

    compile(&program).map_err(|error| {
        let mut diagnostics = Diagnostics::new();
        diagnostics.push(Diagnostic::error("C0001", error.span, error.message));
        diagnostics
    })
}
