//! Fluent instruction builder for one function body.
//!
//! The emitter interns string and type operands into the containing symbol
//! table as it appends instructions. Jump targets go through [`Label`]s:
//! a jump emitted before its target holds a placeholder operand that
//! `resolve_label` rewrites to the signed distance `target_pc - jump_pc`.

use carve_core::{SymbolId, SymbolTable, TypeId};
use indexmap::IndexMap;

use crate::instructions::{Instruction, Opcode};

/// Emission context flags.
#[derive(Clone, Copy, Default, Debug)]
pub struct EmitterFlags {
    /// Body of the `<main>` entry point.
    pub main: bool,
    /// Body of an `<init>` constructor: declarations become fields of `<this>`.
    pub ctor: bool,
}

/// Handle to a deferred jump target owned by the emitter.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Label(usize);

#[derive(Debug, Default)]
struct LabelState {
    /// Instruction index the label resolves to, set by `place_label`.
    target: Option<u16>,
    /// (instruction index, operand index) pairs awaiting patching.
    sites: Vec<(usize, usize)>,
}

/// Emitter errors.
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("label resolved before being placed")]
    UnplacedLabel,
    #[error("jump distance {0} exceeds the signed 16-bit operand range")]
    JumpOutOfRange(i64),
}

/// Instruction builder for one function body.
pub struct Emitter<'a> {
    symbols: &'a mut SymbolTable,
    instructions: Vec<Instruction>,
    labels: Vec<LabelState>,
    locals: IndexMap<String, String>,
    pub flags: EmitterFlags,
}

impl<'a> Emitter<'a> {
    pub fn new(symbols: &'a mut SymbolTable) -> Self {
        Self {
            symbols,
            instructions: Vec::new(),
            labels: Vec::new(),
            locals: IndexMap::new(),
            flags: EmitterFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: EmitterFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Consume the emitter, yielding the finished instruction vector.
    pub fn finish(self) -> Vec<Instruction> {
        debug_assert!(
            self.labels.iter().all(|l| l.sites.is_empty() || l.target.is_some()),
            "unresolved label left in function body"
        );
        self.instructions
    }

    pub fn symbols(&mut self) -> &mut SymbolTable {
        self.symbols
    }

    fn push(&mut self, opcode: Opcode, operands: Vec<u16>) -> usize {
        let index = self.instructions.len();
        self.instructions.push(Instruction::new(opcode, operands));
        index
    }

    /// Current instruction count; the pc the next instruction will get.
    pub fn here(&self) -> usize {
        self.instructions.len()
    }

    pub fn instruction(&self, index: usize) -> &Instruction {
        &self.instructions[index]
    }

    // --- stores and loads -------------------------------------------------

    pub fn store_field(&mut self, name: &str, type_name: &str) {
        let name = self.symbols.intern_string(name);
        let ty = self.symbols.intern_string(type_name);
        self.push(Opcode::StoreField, vec![name.get(), ty.get()]);
    }

    pub fn store_in_this(&mut self, name: &str, type_name: &str) {
        let name = self.symbols.intern_string(name);
        let ty = self.symbols.intern_string(type_name);
        self.push(Opcode::StoreInThis, vec![name.get(), ty.get()]);
    }

    pub fn load_field(&mut self, name: &str) {
        let name = self.symbols.intern_string(name);
        self.push(Opcode::LoadField, vec![name.get()]);
    }

    pub fn load_from_this(&mut self, name: &str) {
        let name = self.symbols.intern_string(name);
        self.push(Opcode::LoadFromThis, vec![name.get()]);
    }

    pub fn store_attribute(&mut self, name: &str) {
        let name = self.symbols.intern_string(name);
        self.push(Opcode::StoreAttribute, vec![name.get()]);
    }

    pub fn store_local(&mut self, name: &str, type_name: &str) {
        let name = self.symbols.intern_string(name);
        let ty = self.symbols.intern_string(type_name);
        self.push(Opcode::StoreLocal, vec![name.get(), ty.get()]);
    }

    pub fn load_local(&mut self, name: &str) {
        let name = self.symbols.intern_string(name);
        self.push(Opcode::LoadLocal, vec![name.get()]);
    }

    pub fn load_symbol(&mut self, id: SymbolId) {
        self.push(Opcode::LoadSymbol, vec![id.get()]);
    }

    // --- reads ------------------------------------------------------------

    pub fn new_struct(&mut self, type_name: &str) {
        let ty = self.symbols.intern_string(type_name);
        self.push(Opcode::NewStruct, vec![ty.get()]);
    }

    pub fn read_value(&mut self, type_name: &str, type_id: TypeId) {
        let ty = self.symbols.intern_string(type_name);
        self.push(Opcode::ReadValue, vec![ty.get(), type_id.to_u16()]);
    }

    pub fn read_field(&mut self, name: &str, type_name: &str, type_id: TypeId) {
        let name = self.symbols.intern_string(name);
        let ty = self.symbols.intern_string(type_name);
        self.push(Opcode::ReadField, vec![name.get(), ty.get(), type_id.to_u16()]);
    }

    /// While-governed static array step; jumps back to `loop_head` while the
    /// popped condition holds.
    pub fn read_static_array(&mut self, elem_type: &str, loop_head: Label) {
        let ty = self.symbols.intern_string(elem_type);
        let index = self.push(Opcode::ReadStaticArray, vec![ty.get(), 0]);
        self.labels[loop_head.0].sites.push((index, 1));
    }

    /// Form a static array from the template and count on the stack.
    pub fn read_static_array_with_size(&mut self, elem_type: &str) {
        let ty = self.symbols.intern_string(elem_type);
        self.push(Opcode::ReadStaticArrayWithSize, vec![ty.get()]);
    }

    /// While-governed dynamic array step; reads one complex element per true
    /// condition, jumping back to `loop_head` between elements.
    pub fn read_dynamic_array(&mut self, type_name: &str, loop_head: Label) {
        let ty = self.symbols.intern_string(type_name);
        let index = self.push(Opcode::ReadDynamicArray, vec![ty.get(), 0]);
        self.labels[loop_head.0].sites.push((index, 1));
    }

    /// Count-governed dynamic array; pops the element count from the stack.
    pub fn read_dynamic_array_with_size(&mut self, type_name: &str) {
        let ty = self.symbols.intern_string(type_name);
        self.push(Opcode::ReadDynamicArrayWithSize, vec![ty.get()]);
    }

    // --- stack and control flow -------------------------------------------

    pub fn call(&mut self, name: &str) {
        let name = self.symbols.intern_string(name);
        self.push(Opcode::Call, vec![name.get()]);
    }

    pub fn export(&mut self, name: &str) {
        let name = self.symbols.intern_string(name);
        self.push(Opcode::Export, vec![name.get()]);
    }

    pub fn dup(&mut self) {
        self.push(Opcode::Dup, vec![]);
    }

    pub fn pop(&mut self) {
        self.push(Opcode::Pop, vec![]);
    }

    pub fn eq(&mut self) {
        self.push(Opcode::Eq, vec![]);
    }

    pub fn neq(&mut self) {
        self.push(Opcode::Neq, vec![]);
    }

    pub fn lt(&mut self) {
        self.push(Opcode::Lt, vec![]);
    }

    pub fn lte(&mut self) {
        self.push(Opcode::Lte, vec![]);
    }

    pub fn gt(&mut self) {
        self.push(Opcode::Gt, vec![]);
    }

    pub fn gte(&mut self) {
        self.push(Opcode::Gte, vec![]);
    }

    pub fn not(&mut self) {
        self.push(Opcode::Not, vec![]);
    }

    pub fn cmp(&mut self) {
        self.push(Opcode::Cmp, vec![]);
    }

    pub fn return_(&mut self) {
        self.push(Opcode::Return, vec![]);
    }

    // --- labels -----------------------------------------------------------

    /// Create an unplaced label.
    pub fn label(&mut self) -> Label {
        let id = self.labels.len();
        self.labels.push(LabelState::default());
        Label(id)
    }

    /// Emit a jump to `label`, recording the site for later patching.
    pub fn jmp(&mut self, label: Label) {
        let index = self.push(Opcode::Jmp, vec![0]);
        self.labels[label.0].sites.push((index, 0));
    }

    /// Pin the label to the current instruction index.
    pub fn place_label(&mut self, label: Label) {
        self.labels[label.0].target = Some(self.instructions.len() as u16);
    }

    /// Rewrite every recorded site to the signed offset `target - site`.
    /// The label must have been placed first; jumps may target positions
    /// before or after their site.
    pub fn resolve_label(&mut self, label: Label) -> Result<(), EmitError> {
        let state = &self.labels[label.0];
        let target = state.target.ok_or(EmitError::UnplacedLabel)?;

        for &(index, operand) in &state.sites {
            let distance = target as i64 - index as i64;
            let offset =
                i16::try_from(distance).map_err(|_| EmitError::JumpOutOfRange(distance))?;
            self.instructions[index].operands[operand] = offset as u16;
        }
        Ok(())
    }

    // --- locals -----------------------------------------------------------

    /// Record that `name` is a local of the given type name.
    pub fn local(&mut self, name: &str, type_name: &str) {
        self.locals.insert(name.to_owned(), type_name.to_owned());
    }

    /// Type name recorded for a local, if declared.
    pub fn local_type(&self, name: &str) -> Option<&str> {
        self.locals.get(name).map(|s| s.as_str())
    }

    /// Bind the value on top of the stack to `name`.
    ///
    /// Outside a constructor the value becomes a local *and* an exported
    /// pattern: record the local, duplicate, store, export. Inside a
    /// constructor it becomes a field of `<this>`.
    pub fn store_value(&mut self, name: &str, type_name: &str) {
        if self.flags.ctor {
            self.store_in_this(name, type_name);
        } else {
            self.local(name, type_name);
            self.dup();
            self.store_local(name, type_name);
            self.export(name);
        }
    }
}
