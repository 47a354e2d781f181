//! Embeddable runtime for the carve binary pattern language.
//!
//! [`Runtime`] orchestrates the whole pipeline — preprocess → lex → parse →
//! validate → compile → load → run — and surfaces errors, exported
//! patterns, and the console log to the embedding host.
//!
//! ```no_run
//! use carve_lib::Runtime;
//!
//! let data = std::fs::read("firmware.bin").unwrap();
//! let size = data.len() as u64;
//!
//! let mut runtime = Runtime::new();
//! runtime.set_data_source(0, size, move |address, buffer| {
//!     let start = address as usize;
//!     buffer.copy_from_slice(&data[start..start + buffer.len()]);
//! });
//!
//! if runtime.execute_string("u32 magic @ 0x00;", &Default::default(), &Default::default(), false) {
//!     for pattern in runtime.get_all_patterns(0) {
//!         println!("{} = {:?}", pattern.name, pattern.kind);
//!     }
//! }
//! ```

mod console;
mod functions;
mod pragma;
mod runtime;
mod sections;

#[cfg(test)]
mod runtime_tests;

pub use console::{Level, LogConsole};
pub use functions::{FunctionCallback, FunctionRegistry, ParameterCount};
pub use pragma::{PragmaContext, PragmaHandler};
pub use runtime::{LanguageError, Literal, Runtime};
pub use sections::{IntervalIndex, Section};

pub use carve_core::{BitfieldOrder, Endian, SectionId, HEAP_SECTION, MAIN_SECTION};
pub use carve_vm::{Pattern, PatternKind};
