//! The stack virtual machine.
//!
//! One frame per active function: operand stack, locals, program counter,
//! and the per-frame read/array state machines. Dispatch is
//! fetch → increment pc → execute until the last frame returns, the abort
//! flag clears, or an error surfaces.
//!
//! Complex reads drive constructors through a two-entry protocol: the first
//! execution of `READ_VALUE` pushes a fresh struct, rewinds the pc, and
//! enters `<init><T>`; the second execution observes `ReadState::AwaitingCtor`
//! and completes without re-reading.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use carve_bytecode::{Bytecode, Function, Instruction, Opcode, ADDRESS_NAME, CTOR_PREFIX, MAIN_NAME, THIS_NAME};
use carve_core::{
    BitfieldOrder, ColorWheel, Endian, SectionId, SymbolId, SymbolTable, TypeId, MAIN_SECTION,
};
use indexmap::IndexMap;

use crate::error::{RuntimeError, VmError};
use crate::pattern::Pattern;
use crate::value::{
    new_value, Attribute, DynamicArray, Field, FieldHandle, ObjectHeader, StaticArray,
    StructValue, Value, ValueKind,
};

/// Host I/O callbacks. `read` is required for any program that reads data;
/// `write` is reserved.
pub struct IoOperations {
    pub read: Box<dyn FnMut(u64, &mut [u8])>,
    pub write: Option<Box<dyn FnMut(u64, &[u8])>>,
}

/// Session defaults applied at the start of each run.
#[derive(Debug, Clone, Copy)]
pub struct VmSettings {
    pub default_endian: Endian,
    pub default_bitfield_order: BitfieldOrder,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            default_endian: Endian::native(),
            default_bitfield_order: BitfieldOrder::default(),
        }
    }
}

/// Execution limits; 0 disables a limit.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum function nesting depth, enforced at function entry.
    pub eval_depth: u64,
    /// Maximum array element count, enforced by the array state machines.
    pub array_limit: u64,
    /// Maximum exported pattern count.
    pub pattern_limit: u64,
    /// Maximum taken backward jumps per frame.
    pub loop_limit: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            eval_depth: 32,
            array_limit: 0x1000,
            pattern_limit: 0x2000,
            loop_limit: 0x1000,
        }
    }
}

/// Complex-read protocol state, kept per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ReadState {
    #[default]
    Idle,
    /// A constructor was entered for the instruction at the current pc;
    /// its next execution completes without re-reading.
    AwaitingCtor,
}

/// Array-read state machine, kept per frame.
#[derive(Debug)]
enum ArrayState {
    /// While-governed homogeneous array: the template sits on the operand
    /// stack, elements advance the cursor without further reads.
    Static { index: u64, elem_size: u64 },
    /// While-governed array of constructor-read elements.
    Dynamic { values: Vec<Value> },
    /// Count-governed array of constructor-read elements.
    DynamicSized { remaining: u64, values: Vec<Value> },
}

struct Frame {
    locals: HashMap<SymbolId, Value>,
    stack: Vec<Value>,
    pc: usize,
    function: usize,
    read_state: ReadState,
    array: Option<ArrayState>,
    back_jumps: u64,
}

impl Frame {
    fn new(function: usize) -> Self {
        Self {
            locals: HashMap::new(),
            stack: Vec::new(),
            pc: 0,
            function,
            read_state: ReadState::Idle,
            array: None,
            back_jumps: 0,
        }
    }
}

struct StaticNames {
    this: SymbolId,
    main: SymbolId,
    address: SymbolId,
}

#[derive(Clone, Copy)]
enum Condition {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

/// The virtual machine.
pub struct VirtualMachine {
    pub(crate) symbols: SymbolTable,
    functions: Vec<Function>,
    frames: Vec<Frame>,
    statics: StaticNames,

    /// Reader cursor: where the next read happens.
    address: u128,
    data_base: u64,
    data_size: u64,
    current_array_index: Option<u64>,

    settings: VmSettings,
    pub(crate) endian: Endian,
    bitfield_order: BitfieldOrder,
    limits: Limits,

    io: Option<IoOperations>,
    patterns: BTreeMap<SectionId, Vec<Pattern>>,
    pattern_count: u64,
    pub(crate) colors: ColorWheel,
    result: Option<Value>,
    running: Arc<AtomicBool>,
}

impl Default for VirtualMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMachine {
    pub fn new() -> Self {
        Self {
            symbols: SymbolTable::new(),
            functions: Vec::new(),
            frames: Vec::new(),
            statics: StaticNames {
                this: SymbolId::NULL,
                main: SymbolId::NULL,
                address: SymbolId::NULL,
            },
            address: 0,
            data_base: 0,
            data_size: 0,
            current_array_index: None,
            settings: VmSettings::default(),
            endian: Endian::native(),
            bitfield_order: BitfieldOrder::default(),
            limits: Limits::default(),
            io: None,
            patterns: BTreeMap::new(),
            pattern_count: 0,
            colors: ColorWheel::new(),
            result: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    // --- configuration ----------------------------------------------------

    /// Take ownership of compiled bytecode and intern the reserved names.
    pub fn load_bytecode(&mut self, bytecode: Bytecode) {
        let (mut symbols, functions) = bytecode.into_parts();
        self.statics = StaticNames {
            this: symbols.intern_string(THIS_NAME),
            main: symbols.intern_string(MAIN_NAME),
            address: symbols.intern_string(ADDRESS_NAME),
        };
        self.symbols = symbols;
        self.functions = functions;
    }

    pub fn set_io_operations(&mut self, io: IoOperations) {
        self.io = Some(io);
    }

    pub fn set_data_window(&mut self, base: u64, size: u64) {
        self.data_base = base;
        self.data_size = size;
    }

    /// Move the reader cursor; the next top-level read starts here.
    pub fn set_start_address(&mut self, address: u64) {
        self.address = address as u128;
    }

    pub fn data_offset(&self) -> u128 {
        self.address
    }

    pub fn set_default_endian(&mut self, endian: Endian) {
        self.settings.default_endian = endian;
    }

    pub fn default_endian(&self) -> Endian {
        self.settings.default_endian
    }

    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn set_default_bitfield_order(&mut self, order: BitfieldOrder) {
        self.settings.default_bitfield_order = order;
    }

    pub fn default_bitfield_order(&self) -> BitfieldOrder {
        self.settings.default_bitfield_order
    }

    pub fn set_bitfield_order(&mut self, order: BitfieldOrder) {
        self.bitfield_order = order;
    }

    pub fn bitfield_order(&self) -> BitfieldOrder {
        self.bitfield_order
    }

    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn current_array_index(&self) -> Option<u64> {
        self.current_array_index
    }

    /// Exported patterns grouped by section.
    pub fn patterns(&self) -> &BTreeMap<SectionId, Vec<Pattern>> {
        &self.patterns
    }

    pub fn take_patterns(&mut self) -> BTreeMap<SectionId, Vec<Pattern>> {
        std::mem::take(&mut self.patterns)
    }

    /// Value left on the final frame's stack, if any.
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Shared flag a watchdog may clear to stop execution.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn abort(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Discard all per-run state; bytecode and configuration stay loaded.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.patterns.clear();
        self.pattern_count = 0;
        self.colors.reset();
        self.result = None;
        self.current_array_index = None;
        self.address = 0;
        self.endian = self.settings.default_endian;
        self.bitfield_order = self.settings.default_bitfield_order;
        self.running.store(false, Ordering::Relaxed);
    }

    // --- execution --------------------------------------------------------

    /// Enter the `<main>` function, applying session defaults.
    pub fn enter_main(&mut self) -> Result<(), VmError> {
        self.endian = self.settings.default_endian;
        self.bitfield_order = self.settings.default_bitfield_order;
        self.colors.reset();
        self.pattern_count = 0;
        self.current_array_index = None;
        self.running.store(true, Ordering::Relaxed);
        self.enter_function(self.statics.main)
            .map_err(|error| VmError {
                error,
                function: MAIN_NAME.to_owned(),
                pc: 0,
            })
    }

    /// Bind a host-provided value as a local of the innermost frame.
    /// Used to inject `in` variables after `enter_main`.
    pub fn bind_local(&mut self, name: &str, value: Value) {
        let name = self.symbols.intern_string(name);
        if let Some(frame) = self.frames.last_mut() {
            frame.locals.insert(name, value);
        }
    }

    /// Run until the last frame returns, an error surfaces, or the abort
    /// flag clears.
    pub fn run(&mut self) -> Result<(), VmError> {
        while self.running.load(Ordering::Relaxed) && !self.frames.is_empty() {
            let frame = self.frames.last().expect("frame checked non-empty");
            let pc = frame.pc;
            let function = self.functions[frame.function].name;

            if let Err(error) = self.step() {
                self.running.store(false, Ordering::Relaxed);
                return Err(VmError {
                    error,
                    function: self.lookup_string(function),
                    pc,
                });
            }
        }
        Ok(())
    }

    /// Whether the last run ended through `abort` rather than completion.
    pub fn was_aborted(&self) -> bool {
        !self.frames.is_empty()
    }

    fn step(&mut self) -> Result<(), RuntimeError> {
        let frame = self.frames.last_mut().expect("step with no frame");
        let function = &self.functions[frame.function];
        let instruction: Instruction = match function.instructions.get(frame.pc) {
            Some(instruction) => instruction.clone(),
            None => {
                // falling off a function body behaves like RETURN
                self.leave_function();
                return Ok(());
            }
        };
        frame.pc += 1;

        self.dispatch(&instruction)
    }

    fn dispatch(&mut self, instruction: &Instruction) -> Result<(), RuntimeError> {
        let ops = &instruction.operands;
        match instruction.opcode {
            Opcode::LoadSymbol => self.exec_load_symbol(SymbolId::new(ops[0])),
            Opcode::LoadLocal => self.exec_load_local(SymbolId::new(ops[0])),
            Opcode::StoreLocal => self.exec_store_local(SymbolId::new(ops[0])),
            Opcode::LoadFromThis => self.exec_load_from_this(SymbolId::new(ops[0])),
            Opcode::StoreInThis => {
                let value = self.pop()?;
                let this = self.this_value()?;
                self.attach_field(&this, SymbolId::new(ops[0]), SymbolId::new(ops[1]), value)
            }
            Opcode::LoadField => self.exec_load_field(SymbolId::new(ops[0])),
            Opcode::StoreField => {
                let value = self.pop()?;
                let target = self.pop()?;
                self.attach_field(&target, SymbolId::new(ops[0]), SymbolId::new(ops[1]), value)
            }
            Opcode::StoreAttribute => self.exec_store_attribute(SymbolId::new(ops[0])),
            Opcode::NewStruct => {
                let value = self.make_struct(SymbolId::new(ops[0]));
                self.push(value);
                Ok(())
            }
            Opcode::ReadValue => self.exec_read_value(SymbolId::new(ops[0]), ops[1]),
            Opcode::ReadField => {
                self.exec_read_field(SymbolId::new(ops[0]), SymbolId::new(ops[1]), ops[2])
            }
            Opcode::ReadArray => Err(RuntimeError::InvalidType { id: ops[1] }),
            Opcode::ReadStaticArray => {
                self.exec_read_static_array(SymbolId::new(ops[0]), ops[1] as i16)
            }
            Opcode::ReadStaticArrayWithSize => {
                self.exec_read_static_array_with_size(SymbolId::new(ops[0]))
            }
            Opcode::ReadDynamicArray => {
                self.exec_read_dynamic_array(SymbolId::new(ops[0]), ops[1] as i16)
            }
            Opcode::ReadDynamicArrayWithSize => {
                self.exec_read_dynamic_array_with_size(SymbolId::new(ops[0]))
            }
            Opcode::Dup => {
                let top = self.pop()?;
                self.push(top.clone());
                self.push(top);
                Ok(())
            }
            Opcode::Pop => self.pop().map(drop),
            Opcode::Cmp => {
                let condition = self.pop_bool()?;
                if condition {
                    self.frame().pc += 1;
                }
                Ok(())
            }
            Opcode::Eq => self.exec_compare(Condition::Equal),
            Opcode::Neq => self.exec_compare(Condition::NotEqual),
            Opcode::Lt => self.exec_compare(Condition::Less),
            Opcode::Lte => self.exec_compare(Condition::LessEqual),
            Opcode::Gt => self.exec_compare(Condition::Greater),
            Opcode::Gte => self.exec_compare(Condition::GreaterEqual),
            Opcode::Not => {
                let value = self.pop_bool()?;
                self.push(new_value(ValueKind::Bool(!value), 0, 0, MAIN_SECTION));
                Ok(())
            }
            Opcode::Jmp => self.branch(ops[0] as i16),
            Opcode::Call => self.enter_function(SymbolId::new(ops[0])),
            Opcode::Export => self.exec_export(SymbolId::new(ops[0])),
            Opcode::Return => {
                self.leave_function();
                Ok(())
            }
        }
    }

    // --- frames -----------------------------------------------------------

    fn frame(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    fn push(&mut self, value: Value) {
        self.frame().stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.frame().stack.pop().ok_or(RuntimeError::StackUnderflow)
    }

    fn pop_bool(&mut self) -> Result<bool, RuntimeError> {
        let value = self.pop()?;
        let value = value.borrow();
        value
            .to_bool()
            .ok_or_else(|| RuntimeError::mismatch("cannot convert value to bool"))
    }

    fn pop_unsigned(&mut self) -> Result<u128, RuntimeError> {
        let value = self.pop()?;
        let value = value.borrow();
        value
            .to_unsigned()
            .ok_or_else(|| RuntimeError::mismatch("cannot convert value to integer"))
    }

    fn this_value(&mut self) -> Result<Value, RuntimeError> {
        let this = self.statics.this;
        self.frame()
            .locals
            .get(&this)
            .cloned()
            .ok_or_else(|| RuntimeError::UndefinedVariable {
                name: THIS_NAME.to_owned(),
            })
    }

    fn lookup_string(&self, id: SymbolId) -> String {
        self.symbols
            .get_string(id)
            .unwrap_or("<invalid>")
            .to_owned()
    }

    fn find_function(&self, name: SymbolId) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    /// Enter a function by name symbol. Constructor calls bind the receiver
    /// popped from the caller's stack to `<this>` and keep it on the new
    /// frame's stack so the trailing RETURN yields the populated struct.
    fn enter_function(&mut self, name: SymbolId) -> Result<(), RuntimeError> {
        if self.limits.eval_depth != 0 && self.frames.len() as u64 >= self.limits.eval_depth {
            return Err(RuntimeError::LimitExceeded {
                limit: "eval_depth",
                value: self.limits.eval_depth,
            });
        }

        let index = self
            .find_function(name)
            .ok_or_else(|| RuntimeError::MissingFunction {
                name: self.lookup_string(name),
            })?;

        let is_ctor = self
            .symbols
            .get_string(name)
            .is_some_and(|n| n.starts_with(CTOR_PREFIX));

        let mut frame = Frame::new(index);
        if is_ctor {
            if let Some(caller) = self.frames.last_mut() {
                let receiver = caller.stack.pop().ok_or(RuntimeError::StackUnderflow)?;
                frame.locals.insert(self.statics.this, receiver.clone());
                frame.stack.push(receiver);
            }
        }
        self.frames.push(frame);
        Ok(())
    }

    /// RETURN: drop the current frame, handing its stack top to the parent
    /// or recording it as the session result when this was the last frame.
    fn leave_function(&mut self) {
        let mut finished = self.frames.pop().expect("return with no frame");
        let returned = finished.stack.pop();
        match self.frames.last_mut() {
            Some(parent) => {
                if let Some(value) = returned {
                    parent.stack.push(value);
                }
            }
            None => {
                self.result = returned;
                self.running.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Relative branch from the instruction's own index.
    fn branch(&mut self, offset: i16) -> Result<(), RuntimeError> {
        if offset <= 0 {
            let frame = self.frame();
            frame.back_jumps += 1;
            let taken = frame.back_jumps;
            if self.limits.loop_limit != 0 && taken > self.limits.loop_limit {
                return Err(RuntimeError::LimitExceeded {
                    limit: "loop",
                    value: self.limits.loop_limit,
                });
            }
        }

        let frame = self.frame();
        let base = frame.pc as i64 - 1;
        let target = base + offset as i64;
        frame.pc = usize::try_from(target)
            .map_err(|_| RuntimeError::mismatch("jump target outside function"))?;
        Ok(())
    }

    // --- loads and stores -------------------------------------------------

    fn exec_load_symbol(&mut self, id: SymbolId) -> Result<(), RuntimeError> {
        let value = match self.symbols.get(id) {
            Some(carve_core::Symbol::Unsigned(v)) => {
                new_value(ValueKind::Unsigned(*v as u128), 0, 0, MAIN_SECTION)
            }
            Some(carve_core::Symbol::Signed(v)) => {
                new_value(ValueKind::Signed(*v as i128), 0, 0, MAIN_SECTION)
            }
            Some(carve_core::Symbol::Str(_)) => {
                return Err(RuntimeError::mismatch(
                    "cannot load a string symbol as a value",
                ))
            }
            None => {
                return Err(RuntimeError::mismatch("load of the null symbol"));
            }
        };
        self.push(value);
        Ok(())
    }

    fn exec_load_local(&mut self, name: SymbolId) -> Result<(), RuntimeError> {
        let value = self.frame().locals.get(&name).cloned();
        match value {
            Some(value) => {
                self.push(value);
                Ok(())
            }
            None => Err(RuntimeError::UndefinedVariable {
                name: self.lookup_string(name),
            }),
        }
    }

    fn exec_store_local(&mut self, name: SymbolId) -> Result<(), RuntimeError> {
        let value = self.pop()?;
        // storing to the reserved address symbol moves the reader cursor
        if name == self.statics.address {
            let address = value
                .borrow()
                .to_unsigned()
                .ok_or_else(|| RuntimeError::mismatch("cursor position is not an integer"))?;
            self.address = address;
            return Ok(());
        }
        self.frame().locals.insert(name, value);
        Ok(())
    }

    fn exec_load_from_this(&mut self, field: SymbolId) -> Result<(), RuntimeError> {
        let this = self.this_value()?;
        let this = this.borrow();
        let structure = this
            .as_struct()
            .ok_or_else(|| RuntimeError::mismatch("load_from_this: `<this>` is not a structure"))?;
        let value = structure
            .fields
            .get(&field)
            .map(|f| f.borrow().value.clone())
            .ok_or_else(|| RuntimeError::UndefinedVariable {
                name: self.lookup_string(field),
            })?;
        drop(this);
        self.push(value);
        Ok(())
    }

    fn exec_load_field(&mut self, field: SymbolId) -> Result<(), RuntimeError> {
        let target = self.pop()?;
        let target = target.borrow();
        let structure = target
            .as_struct()
            .ok_or_else(|| RuntimeError::mismatch("load_field: target is not a structure"))?;
        let value = structure
            .fields
            .get(&field)
            .map(|f| f.borrow().value.clone())
            .ok_or_else(|| RuntimeError::UndefinedVariable {
                name: self.lookup_string(field),
            })?;
        drop(target);
        self.push(value);
        Ok(())
    }

    fn exec_store_attribute(&mut self, name: SymbolId) -> Result<(), RuntimeError> {
        let value = self.pop()?;
        if let Some(structure) = value.borrow_mut().as_struct_mut() {
            structure
                .header
                .attributes
                .insert(name, Attribute { name });
        }
        self.push(value);
        Ok(())
    }

    /// Write a field into a struct value, growing the struct's size.
    fn attach_field(
        &mut self,
        target: &Value,
        name: SymbolId,
        type_name: SymbolId,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let (address, section, size) = {
            let cell = value.borrow();
            (cell.address, cell.section, cell.size)
        };

        let field: FieldHandle = std::rc::Rc::new(std::cell::RefCell::new(Field {
            header: ObjectHeader {
                name,
                type_name,
                address,
                section,
                color: 0,
                attributes: IndexMap::new(),
            },
            value,
        }));

        let mut cell = target.borrow_mut();
        match &mut cell.kind {
            ValueKind::Struct(structure) => {
                structure.fields.insert(name, field);
            }
            _ => {
                return Err(RuntimeError::mismatch(
                    "field store target is not a structure",
                ))
            }
        }
        cell.size += size;
        Ok(())
    }

    fn make_struct(&self, type_name: SymbolId) -> Value {
        new_value(
            ValueKind::Struct(StructValue {
                header: ObjectHeader {
                    name: SymbolId::NULL,
                    type_name,
                    address: self.address,
                    section: MAIN_SECTION,
                    color: 0,
                    attributes: IndexMap::new(),
                },
                fields: IndexMap::new(),
            }),
            0,
            self.address,
            MAIN_SECTION,
        )
    }

    // --- reads ------------------------------------------------------------

    fn exec_read_value(&mut self, type_name: SymbolId, raw_id: u16) -> Result<(), RuntimeError> {
        if self.frame().read_state == ReadState::AwaitingCtor {
            // the constructor has returned; its struct is on the stack
            self.frame().read_state = ReadState::Idle;
            return Ok(());
        }

        let id = TypeId::from_u16(raw_id).ok_or(RuntimeError::InvalidType { id: raw_id })?;
        if id.is_builtin() {
            let value = self.read_scalar(id)?;
            self.push(value);
            return Ok(());
        }
        if id.is_complex() {
            return self.begin_complex_read(type_name);
        }
        Err(RuntimeError::InvalidType { id: raw_id })
    }

    /// Push a fresh struct, rewind to re-enter this instruction after the
    /// constructor returns, and transfer control into `<init><T>`.
    fn begin_complex_read(&mut self, type_name: SymbolId) -> Result<(), RuntimeError> {
        let value = self.make_struct(type_name);
        self.push(value);

        let frame = self.frame();
        frame.read_state = ReadState::AwaitingCtor;
        frame.pc -= 1;

        let ctor = format!(
            "{CTOR_PREFIX}{}",
            self.symbols.get_string(type_name).unwrap_or_default()
        );
        let ctor_sym = self
            .functions
            .iter()
            .find(|f| self.symbols.get_string(f.name) == Some(ctor.as_str()))
            .map(|f| f.name)
            .ok_or(RuntimeError::MissingFunction { name: ctor })?;
        self.enter_function(ctor_sym)
    }

    fn exec_read_field(
        &mut self,
        name: SymbolId,
        type_name: SymbolId,
        raw_id: u16,
    ) -> Result<(), RuntimeError> {
        let id = TypeId::from_u16(raw_id).ok_or(RuntimeError::InvalidType { id: raw_id })?;
        if !id.is_builtin() {
            return Err(RuntimeError::InvalidType { id: raw_id });
        }
        let value = self.read_scalar(id)?;
        let this = self.this_value()?;
        self.attach_field(&this, name, type_name, value)
    }

    /// Read one builtin scalar at the cursor and advance it.
    fn read_scalar(&mut self, id: TypeId) -> Result<Value, RuntimeError> {
        let size = id.byte_size() as u64;
        let address = self.address;

        let mut buffer = [0u8; 16];
        self.read_data(address, &mut buffer[..size as usize])?;
        let bytes = &buffer[..size as usize];

        let kind = if id.is_unsigned() || id == TypeId::Char || id == TypeId::Char16 {
            ValueKind::Unsigned(decode_unsigned(bytes, self.endian))
        } else if id.is_signed() {
            ValueKind::Signed(decode_signed(bytes, self.endian))
        } else if id == TypeId::Bool {
            ValueKind::Bool(bytes[0] != 0)
        } else if id == TypeId::Float {
            let bits = decode_unsigned(bytes, self.endian) as u32;
            ValueKind::Float(f32::from_bits(bits) as f64)
        } else if id == TypeId::Double {
            let bits = decode_unsigned(bytes, self.endian) as u64;
            ValueKind::Float(f64::from_bits(bits))
        } else {
            return Err(RuntimeError::InvalidType { id: id.to_u16() });
        };

        self.address += size as u128;
        Ok(new_value(kind, size, address, MAIN_SECTION))
    }

    pub(crate) fn read_data(&mut self, address: u128, buffer: &mut [u8]) -> Result<(), RuntimeError> {
        let io = self.io.as_mut().ok_or(RuntimeError::NoDataSource)?;
        let size = buffer.len() as u64;
        let address = u64::try_from(address).map_err(|_| RuntimeError::OutOfBounds {
            address: u64::MAX,
            size,
        })?;

        let in_range = address >= self.data_base
            && address
                .checked_add(size)
                .is_some_and(|end| end <= self.data_base.saturating_add(self.data_size));
        if !in_range {
            return Err(RuntimeError::OutOfBounds { address, size });
        }

        (io.read)(address, buffer);
        Ok(())
    }

    // --- array state machines ---------------------------------------------

    fn check_array_limit(&self, count: u64) -> Result<(), RuntimeError> {
        if self.limits.array_limit != 0 && count > self.limits.array_limit {
            return Err(RuntimeError::LimitExceeded {
                limit: "array",
                value: self.limits.array_limit,
            });
        }
        Ok(())
    }

    /// Count-governed homogeneous array: the template element was already
    /// read as a probe, so the cursor advances by `count - 1` further
    /// elements while the array value covers all `count`.
    fn exec_read_static_array_with_size(
        &mut self,
        elem_type: SymbolId,
    ) -> Result<(), RuntimeError> {
        let count = self.pop_unsigned()? as u64;
        self.check_array_limit(count)?;
        let template = self.pop()?;

        let (elem_size, template_address) = {
            let cell = template.borrow();
            (cell.size, cell.address)
        };

        let total = elem_size * count;
        let value = new_value(
            ValueKind::StaticArray(StaticArray {
                template,
                elem_type,
                count,
            }),
            total,
            template_address,
            MAIN_SECTION,
        );
        self.push(value);

        // probe already consumed one element
        self.address = (self.address as i128 + elem_size as i128 * (count as i128 - 1)) as u128;
        Ok(())
    }

    /// While-governed homogeneous array. Each true condition advances the
    /// cursor one element and loops back; a false condition materializes
    /// the array from the probe template.
    fn exec_read_static_array(
        &mut self,
        elem_type: SymbolId,
        offset: i16,
    ) -> Result<(), RuntimeError> {
        let condition = self.pop_bool()?;

        if self.frame().array.is_none() {
            let elem_size = {
                let frame = self.frames.last().expect("no active frame");
                let template = frame.stack.last().ok_or(RuntimeError::StackUnderflow)?;
                template.borrow().size
            };
            self.frame().array = Some(ArrayState::Static {
                index: 1,
                elem_size,
            });
        }

        if condition {
            let (index, elem_size) = {
                let Some(ArrayState::Static { index, elem_size }) = self.frame().array.as_mut()
                else {
                    return Err(RuntimeError::mismatch("array state is not a static read"));
                };
                *index += 1;
                (*index, *elem_size)
            };
            self.check_array_limit(index)?;
            self.current_array_index = Some(index);
            self.address += elem_size as u128;
            return self.branch(offset);
        }

        let Some(ArrayState::Static { index, .. }) = self.frame().array.take() else {
            return Err(RuntimeError::mismatch("array state is not a static read"));
        };
        self.current_array_index = None;

        let template = self.pop()?;
        let (elem_size, template_address) = {
            let cell = template.borrow();
            (cell.size, cell.address)
        };
        let value = new_value(
            ValueKind::StaticArray(StaticArray {
                template,
                elem_type,
                count: index,
            }),
            elem_size * index,
            template_address,
            MAIN_SECTION,
        );
        self.push(value);
        Ok(())
    }

    /// Count-governed array of constructor-read elements. Re-entered once
    /// per element through the complex-read protocol.
    fn exec_read_dynamic_array_with_size(
        &mut self,
        elem_type: SymbolId,
    ) -> Result<(), RuntimeError> {
        if self.frame().read_state == ReadState::AwaitingCtor {
            self.frame().read_state = ReadState::Idle;
            let element = self.pop()?;
            let Some(ArrayState::DynamicSized { remaining, values }) = self.frame().array.as_mut()
            else {
                return Err(RuntimeError::mismatch("array state is not a sized read"));
            };
            values.push(element);
            *remaining -= 1;
        } else if self.frame().array.is_none() {
            let count = self.pop_unsigned()? as u64;
            self.check_array_limit(count)?;
            self.frame().array = Some(ArrayState::DynamicSized {
                remaining: count,
                values: Vec::with_capacity(count as usize),
            });
        }

        let (remaining, produced) = {
            let Some(ArrayState::DynamicSized { remaining, values }) = self.frame().array.as_ref()
            else {
                return Err(RuntimeError::mismatch("array state is not a sized read"));
            };
            (*remaining, values.len() as u64)
        };

        if remaining > 0 {
            self.current_array_index = Some(produced);
            self.frame().pc -= 1;
            self.frame().read_state = ReadState::AwaitingCtor;
            return self.begin_ctor_for(elem_type);
        }

        let Some(ArrayState::DynamicSized { values, .. }) = self.frame().array.take() else {
            unreachable!("state checked above");
        };
        self.current_array_index = None;
        self.push_dynamic_array(values, elem_type);
        Ok(())
    }

    /// While-governed array of constructor-read elements.
    fn exec_read_dynamic_array(
        &mut self,
        elem_type: SymbolId,
        offset: i16,
    ) -> Result<(), RuntimeError> {
        if self.frame().read_state == ReadState::AwaitingCtor {
            self.frame().read_state = ReadState::Idle;
            let element = self.pop()?;
            let produced = {
                let Some(ArrayState::Dynamic { values }) = self.frame().array.as_mut() else {
                    return Err(RuntimeError::mismatch("array state is not a dynamic read"));
                };
                values.push(element);
                values.len() as u64
            };
            self.current_array_index = Some(produced);
            // loop back to re-evaluate the condition
            return self.branch(offset);
        }

        let condition = self.pop_bool()?;
        if self.frame().array.is_none() {
            self.frame().array = Some(ArrayState::Dynamic { values: Vec::new() });
        }

        if condition {
            let count = {
                let Some(ArrayState::Dynamic { values }) = self.frame().array.as_ref() else {
                    return Err(RuntimeError::mismatch("array state is not a dynamic read"));
                };
                values.len() as u64 + 1
            };
            self.check_array_limit(count)?;
            self.frame().pc -= 1;
            self.frame().read_state = ReadState::AwaitingCtor;
            return self.begin_ctor_for(elem_type);
        }

        let Some(ArrayState::Dynamic { values }) = self.frame().array.take() else {
            return Err(RuntimeError::mismatch("array state is not a dynamic read"));
        };
        self.current_array_index = None;
        self.push_dynamic_array(values, elem_type);
        Ok(())
    }

    /// Push a fresh struct for one array element and enter its constructor.
    fn begin_ctor_for(&mut self, type_name: SymbolId) -> Result<(), RuntimeError> {
        let value = self.make_struct(type_name);
        self.push(value);

        let ctor = format!(
            "{CTOR_PREFIX}{}",
            self.symbols.get_string(type_name).unwrap_or_default()
        );
        let ctor_sym = self
            .functions
            .iter()
            .find(|f| self.symbols.get_string(f.name) == Some(ctor.as_str()))
            .map(|f| f.name)
            .ok_or(RuntimeError::MissingFunction { name: ctor })?;
        self.enter_function(ctor_sym)
    }

    fn push_dynamic_array(&mut self, values: Vec<Value>, elem_type: SymbolId) {
        let address = values
            .first()
            .map(|v| v.borrow().address)
            .unwrap_or(self.address);
        let array = DynamicArray { values, elem_type };
        let total = array.total_size();
        let value = new_value(
            ValueKind::DynamicArray(array),
            total,
            address,
            MAIN_SECTION,
        );
        self.push(value);
    }

    // --- comparisons ------------------------------------------------------

    fn exec_compare(&mut self, condition: Condition) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = compare(&a, &b, condition);
        self.push(new_value(ValueKind::Bool(result), 0, 0, MAIN_SECTION));
        Ok(())
    }

    // --- export -----------------------------------------------------------

    fn exec_export(&mut self, name: SymbolId) -> Result<(), RuntimeError> {
        self.pattern_count += 1;
        if self.limits.pattern_limit != 0 && self.pattern_count > self.limits.pattern_limit {
            return Err(RuntimeError::LimitExceeded {
                limit: "pattern",
                value: self.limits.pattern_limit,
            });
        }

        let value = self.pop()?;
        let variable = self.lookup_string(name);
        let pattern = self.project_value(&value, Some(&variable))?;
        let section = value.borrow().section;
        self.patterns.entry(section).or_default().push(pattern);
        Ok(())
    }
}

// --- scalar decoding -------------------------------------------------------

fn decode_unsigned(bytes: &[u8], endian: Endian) -> u128 {
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

fn decode_signed(bytes: &[u8], endian: Endian) -> i128 {
    let unsigned = decode_unsigned(bytes, endian);
    let bits = bytes.len() as u32 * 8;
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

/// Scalar view used by comparisons, after forwarding through nested values
/// and field references.
#[derive(Clone, Copy)]
enum Scalar {
    Bool(bool),
    Unsigned(u128),
    Signed(i128),
    Float(f64),
}

fn scalar_of(value: &Value) -> Option<Scalar> {
    let forwarded;
    {
        let cell = value.borrow();
        match &cell.kind {
            ValueKind::Bool(v) => return Some(Scalar::Bool(*v)),
            ValueKind::Unsigned(v) => return Some(Scalar::Unsigned(*v)),
            ValueKind::Signed(v) => return Some(Scalar::Signed(*v)),
            ValueKind::Float(v) => return Some(Scalar::Float(*v)),
            ValueKind::Nested(inner) => forwarded = inner.clone(),
            ValueKind::FieldRef(field) => {
                let field = field.upgrade()?;
                forwarded = field.borrow().value.clone();
            }
            _ => return None,
        }
    }
    scalar_of(&forwarded)
}

/// Compare two values. Same-variant pairs compare directly; mixed-sign
/// integers compare without conflating the two domains; incompatible kinds
/// compare false under every condition.
fn compare(a: &Value, b: &Value, condition: Condition) -> bool {
    use std::cmp::Ordering;

    let (Some(a), Some(b)) = (scalar_of(a), scalar_of(b)) else {
        return false;
    };

    let ordering: Option<Ordering> = match (a, b) {
        (Scalar::Unsigned(x), Scalar::Unsigned(y)) => Some(x.cmp(&y)),
        (Scalar::Signed(x), Scalar::Signed(y)) => Some(x.cmp(&y)),
        (Scalar::Unsigned(x), Scalar::Signed(y)) => Some(cmp_mixed(y, x).reverse()),
        (Scalar::Signed(x), Scalar::Unsigned(y)) => Some(cmp_mixed(x, y)),
        (Scalar::Float(x), Scalar::Float(y)) => x.partial_cmp(&y),
        (Scalar::Bool(x), Scalar::Bool(y)) => Some(x.cmp(&y)),
        _ => None,
    };

    let Some(ordering) = ordering else {
        return false;
    };

    match condition {
        Condition::Equal => ordering == Ordering::Equal,
        Condition::NotEqual => ordering != Ordering::Equal,
        Condition::Less => ordering == Ordering::Less,
        Condition::LessEqual => ordering != Ordering::Greater,
        Condition::Greater => ordering == Ordering::Greater,
        Condition::GreaterEqual => ordering != Ordering::Less,
    }
}

/// Signed vs unsigned without a lossy cast.
fn cmp_mixed(signed: i128, unsigned: u128) -> std::cmp::Ordering {
    if signed < 0 {
        std::cmp::Ordering::Less
    } else {
        (signed as u128).cmp(&unsigned)
    }
}
