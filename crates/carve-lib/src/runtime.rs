//! The runtime façade: one object driving the whole pipeline.
//!
//! `execute_string` runs preprocess → lex → parse → validate → compile →
//! load → `<main>` → run. The first failing stage aborts with its
//! diagnostic stored in `current_error` and echoed to the console at Error
//! level; on success exported patterns move into per-section tables with
//! interval indexes for address queries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use carve_compiler::{
    compile_source, Diagnostics, LineIndex, Preprocessor,
};
use carve_core::{Endian, SectionId, HEAP_SECTION, MAIN_SECTION};
use carve_vm::{
    new_value, IoOperations, Limits, Pattern, Value, ValueKind, VirtualMachine,
};
use indexmap::IndexMap;

use crate::console::{Level, LogConsole};
use crate::functions::{FunctionCallback, FunctionRegistry, ParameterCount};
use crate::pragma::{self, PragmaContext, PragmaHandler};
use crate::sections::{IntervalIndex, Section};

/// A literal value exchanged with the host (environment variables, `in`
/// variables, the `<main>` result).
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Bool(bool),
    Unsigned(u128),
    Signed(i128),
    Float(f64),
    Str(String),
}

impl Literal {
    fn to_value(&self) -> Value {
        let kind = match self {
            Literal::Bool(v) => ValueKind::Bool(*v),
            Literal::Unsigned(v) => ValueKind::Unsigned(*v),
            Literal::Signed(v) => ValueKind::Signed(*v),
            Literal::Float(v) => ValueKind::Float(*v),
            // string literals have no runtime value representation
            Literal::Str(_) => ValueKind::Unsigned(0),
        };
        new_value(kind, 0, 0, MAIN_SECTION)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value.borrow().kind {
            ValueKind::Bool(v) => Some(Literal::Bool(v)),
            ValueKind::Unsigned(v) => Some(Literal::Unsigned(v)),
            ValueKind::Signed(v) => Some(Literal::Signed(v)),
            ValueKind::Float(v) => Some(Literal::Float(v)),
            _ => None,
        }
    }

    /// Signed view for result checking.
    fn as_signed(&self) -> Option<i128> {
        match self {
            Literal::Bool(v) => Some(*v as i128),
            Literal::Unsigned(v) => Some(*v as i128),
            Literal::Signed(v) => Some(*v),
            _ => None,
        }
    }
}

/// An error surfaced at the public boundary: stage diagnostic plus source
/// position (line 0 when no position applies).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct LanguageError {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

struct SectionPatterns {
    patterns: Vec<Pattern>,
    index: IntervalIndex,
}

/// The carve runtime.
pub struct Runtime {
    preprocessor: Preprocessor,
    pragmas: IndexMap<String, PragmaHandler>,
    functions: FunctionRegistry,
    vm: VirtualMachine,
    console: LogConsole,

    current_error: Option<LanguageError>,
    patterns: BTreeMap<SectionId, SectionPatterns>,
    sections: BTreeMap<SectionId, Section>,

    default_endian: Endian,
    start_address: u64,
    data_size: u64,
    type_depth: u64,
    debug: bool,

    env_vars: BTreeMap<String, Literal>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        let mut pragmas = IndexMap::new();
        pragma::register_standard(&mut pragmas);
        Self {
            preprocessor: Preprocessor::new(),
            pragmas,
            functions: FunctionRegistry::new(),
            vm: VirtualMachine::new(),
            console: LogConsole::new(),
            current_error: None,
            patterns: BTreeMap::new(),
            sections: BTreeMap::new(),
            default_endian: Endian::native(),
            start_address: 0,
            data_size: 0,
            type_depth: 32,
            debug: false,
            env_vars: BTreeMap::new(),
        }
    }

    // --- configuration ----------------------------------------------------

    /// Attach the byte source programs read from.
    pub fn set_data_source(
        &mut self,
        base_address: u64,
        size: u64,
        read: impl FnMut(u64, &mut [u8]) + 'static,
    ) {
        self.vm.set_data_window(base_address, size);
        self.vm.set_io_operations(IoOperations {
            read: Box::new(read),
            write: None,
        });
        self.data_size = size;
    }

    /// Attach a byte source with a write callback (reserved).
    pub fn set_data_source_writable(
        &mut self,
        base_address: u64,
        size: u64,
        read: impl FnMut(u64, &mut [u8]) + 'static,
        write: impl FnMut(u64, &[u8]) + 'static,
    ) {
        self.vm.set_data_window(base_address, size);
        self.vm.set_io_operations(IoOperations {
            read: Box::new(read),
            write: Some(Box::new(write)),
        });
        self.data_size = size;
    }

    /// Where the reader cursor starts before the first placement.
    pub fn set_start_address(&mut self, address: u64) {
        self.start_address = address;
    }

    pub fn set_default_endian(&mut self, endian: Endian) {
        self.default_endian = endian;
    }

    pub fn set_include_paths(&mut self, paths: Vec<PathBuf>) {
        self.preprocessor.set_include_paths(paths);
    }

    pub fn add_define(&mut self, name: &str, value: &str) {
        self.preprocessor.add_define(name, value);
    }

    pub fn add_pragma(&mut self, name: &str, handler: PragmaHandler) {
        self.pragmas.insert(name.to_owned(), handler);
    }

    pub fn remove_pragma(&mut self, name: &str) {
        self.pragmas.shift_remove(name);
    }

    pub fn add_function(
        &mut self,
        namespace: &[String],
        name: &str,
        parameter_count: ParameterCount,
        callback: FunctionCallback,
    ) -> bool {
        self.functions
            .register(namespace, name, parameter_count, callback, false)
    }

    pub fn add_dangerous_function(
        &mut self,
        namespace: &[String],
        name: &str,
        parameter_count: ParameterCount,
        callback: FunctionCallback,
    ) -> bool {
        self.functions
            .register(namespace, name, parameter_count, callback, true)
    }

    pub fn set_dangerous_function_handler(&mut self, handler: Box<dyn FnMut() -> bool>) {
        self.functions.set_dangerous_handler(handler);
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    // --- results ----------------------------------------------------------

    /// Patterns exported into a section, in declaration order.
    pub fn get_all_patterns(&self, section: SectionId) -> &[Pattern] {
        self.patterns
            .get(&section)
            .map(|s| s.patterns.as_slice())
            .unwrap_or(&[])
    }

    /// Patterns whose span contains the address.
    pub fn get_patterns_at_address(&self, address: u64, section: SectionId) -> Vec<&Pattern> {
        let Some(section) = self.patterns.get(&section) else {
            return Vec::new();
        };
        section
            .index
            .query(address as u128)
            .into_iter()
            .map(|i| &section.patterns[i])
            .collect()
    }

    pub fn get_sections(&self) -> &BTreeMap<SectionId, Section> {
        &self.sections
    }

    pub fn get_console_log(&self) -> &[(Level, String)] {
        self.console.entries()
    }

    pub fn get_error(&self) -> Option<&LanguageError> {
        self.current_error.as_ref()
    }

    /// Stop a run in progress; callable from a watchdog thread through
    /// [`abort_handle`](Self::abort_handle).
    pub fn abort(&self) {
        self.vm.abort();
    }

    pub fn abort_handle(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
        self.vm.abort_handle()
    }

    /// Restore the runtime to its pre-execution state.
    pub fn reset(&mut self) {
        self.patterns.clear();
        self.sections.clear();
        self.console.clear();
        self.current_error = None;
        self.debug = false;
        self.type_depth = 32;
        self.vm.reset();
        self.vm.set_limits(Limits::default());
    }

    // --- execution --------------------------------------------------------

    /// Compile and run a program against the configured data source.
    pub fn execute_string(
        &mut self,
        code: &str,
        env_vars: &BTreeMap<String, Literal>,
        in_vars: &BTreeMap<String, Literal>,
        check_result: bool,
    ) -> bool {
        self.current_error = None;
        self.console.clear();
        self.patterns.clear();
        self.sections.clear();
        self.debug = false;
        self.type_depth = 32;
        self.env_vars = env_vars.clone();

        // per-run defaults; pragmas override below
        self.vm.set_limits(Limits::default());
        self.vm.set_default_endian(self.default_endian);

        let success = self.execute_inner(code, in_vars, check_result);

        if let Some(error) = &self.current_error {
            let message = if error.line > 0 {
                format!("{}: {}", error.line, error.message)
            } else {
                error.message.clone()
            };
            self.console.log(Level::Error, message);
        }
        success
    }

    fn execute_inner(
        &mut self,
        code: &str,
        in_vars: &BTreeMap<String, Literal>,
        check_result: bool,
    ) -> bool {
        let line_index = LineIndex::new(code);
        let compile_start = Instant::now();

        let preprocessed = match self.preprocessor.preprocess(code) {
            Ok(preprocessed) => preprocessed,
            Err(diagnostic) => {
                let (line, column) = line_index.position(diagnostic.span.start);
                self.current_error = Some(LanguageError {
                    line,
                    column,
                    message: format!("[{}] {}", diagnostic.code, diagnostic.message),
                });
                return false;
            }
        };

        for pragma in &preprocessed.pragmas {
            let mut context = PragmaContext {
                vm: &mut self.vm,
                console: &mut self.console,
                debug: &mut self.debug,
                type_depth: &mut self.type_depth,
            };
            match self.pragmas.get_mut(&pragma.name) {
                Some(handler) => {
                    if !handler(&mut context, &pragma.value) {
                        self.current_error = Some(LanguageError {
                            line: pragma.line,
                            column: 1,
                            message: format!(
                                "invalid value `{}` for pragma `{}`",
                                pragma.value, pragma.name
                            ),
                        });
                        return false;
                    }
                }
                None => {
                    self.current_error = Some(LanguageError {
                        line: pragma.line,
                        column: 1,
                        message: format!("no handler registered for pragma `{}`", pragma.name),
                    });
                    return false;
                }
            }
        }

        // positions past this point refer to the preprocessed text
        let preprocessed_index = LineIndex::new(&preprocessed.source);
        let bytecode = match compile_source(&preprocessed.source, self.type_depth) {
            Ok(bytecode) => bytecode,
            Err(diagnostics) => {
                self.record_diagnostics(&diagnostics, &preprocessed_index);
                return false;
            }
        };

        let compile_elapsed = compile_start.elapsed();
        tracing::debug!(elapsed_ms = compile_elapsed.as_millis() as u64, "compiled");
        self.console.log(
            Level::Debug,
            format!("compilation took {compile_elapsed:?}"),
        );
        if self.debug {
            self.console.log(Level::Debug, bytecode.disassemble());
        }

        let run_start = Instant::now();
        self.vm.load_bytecode(bytecode);
        self.vm.set_start_address(self.start_address);

        if let Err(error) = self.vm.enter_main() {
            self.current_error = Some(LanguageError {
                line: 0,
                column: 0,
                message: error.to_string(),
            });
            return false;
        }
        for (name, literal) in in_vars {
            self.vm.bind_local(name, literal.to_value());
        }

        if let Err(error) = self.vm.run() {
            self.current_error = Some(LanguageError {
                line: 0,
                column: 0,
                message: error.to_string(),
            });
            self.vm.reset();
            return false;
        }

        let run_elapsed = run_start.elapsed();
        tracing::debug!(elapsed_ms = run_elapsed.as_millis() as u64, "executed");
        self.console
            .log(Level::Debug, format!("execution took {run_elapsed:?}"));

        if self.vm.was_aborted() {
            // an aborted run succeeds but yields nothing
            self.vm.reset();
            return true;
        }

        if check_result {
            let result = self.vm.result().and_then(Literal::from_value);
            if let Some(code) = result.as_ref().and_then(Literal::as_signed) {
                if code != 0 {
                    self.current_error = Some(LanguageError {
                        line: 0,
                        column: 0,
                        message: format!("non-success value returned from main: {code}"),
                    });
                    return false;
                }
            }
        }

        for (section, patterns) in self.vm.take_patterns() {
            let index = IntervalIndex::build(&patterns);
            self.patterns
                .insert(section, SectionPatterns { patterns, index });
        }

        self.sections.insert(
            MAIN_SECTION,
            Section {
                id: MAIN_SECTION,
                name: "Data".to_owned(),
                size: self.data_size,
            },
        );
        self.sections.insert(
            HEAP_SECTION,
            Section {
                id: HEAP_SECTION,
                name: "Heap".to_owned(),
                size: 0,
            },
        );

        true
    }

    fn record_diagnostics(&mut self, diagnostics: &Diagnostics, line_index: &LineIndex) {
        let Some(first) = diagnostics.first_error() else {
            return;
        };
        let (line, column) = line_index.position(first.span.start);
        self.current_error = Some(LanguageError {
            line,
            column,
            message: format!("[{}] {}", first.code, first.message),
        });
    }

    /// Compile and run a program read from a file.
    pub fn execute_file(
        &mut self,
        path: impl AsRef<Path>,
        env_vars: &BTreeMap<String, Literal>,
        in_vars: &BTreeMap<String, Literal>,
        check_result: bool,
    ) -> bool {
        let code = match std::fs::read_to_string(path) {
            Ok(code) => code,
            Err(error) => {
                self.current_error = Some(LanguageError {
                    line: 0,
                    column: 0,
                    message: error.to_string(),
                });
                self.console.log(Level::Error, error.to_string());
                return false;
            }
        };
        self.execute_string(&code, env_vars, in_vars, check_result)
    }

    /// Run a bare statement list as the body of `<main>`, yielding the
    /// session result when the program leaves one.
    pub fn execute_function(&mut self, body: &str) -> (bool, Option<Literal>) {
        let success = self.execute_string(body, &BTreeMap::new(), &BTreeMap::new(), false);
        let result = self.vm.result().and_then(Literal::from_value);
        (success, result)
    }

    /// Environment variables supplied by the host for builtin functions.
    pub fn env_variable(&self, name: &str) -> Option<&Literal> {
        self.env_vars.get(name)
    }
}
