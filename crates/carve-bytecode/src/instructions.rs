//! Instruction and function definitions.
//!
//! All operands are 16-bit: symbol ids, type ids, or signed jump offsets
//! stored two's-complement, depending on the opcode.

use carve_core::{SymbolId, SymbolTable};

/// Instruction opcodes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Opcode {
    StoreField,
    LoadField,
    StoreInThis,
    LoadFromThis,
    StoreAttribute,
    StoreLocal,
    LoadLocal,
    NewStruct,
    ReadValue,
    ReadField,
    ReadArray,
    ReadStaticArray,
    ReadStaticArrayWithSize,
    ReadDynamicArray,
    ReadDynamicArrayWithSize,
    LoadSymbol,
    Call,
    Export,
    Dup,
    Pop,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Not,
    Cmp,
    Jmp,
    Return,
}

impl Opcode {
    /// Disassembly mnemonic.
    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            StoreField => "store_field",
            LoadField => "load_field",
            StoreInThis => "store_in_this",
            LoadFromThis => "load_from_this",
            StoreAttribute => "store_attribute",
            StoreLocal => "store_local",
            LoadLocal => "load_local",
            NewStruct => "new_struct",
            ReadValue => "read_value",
            ReadField => "read_field",
            ReadArray => "read_array",
            ReadStaticArray => "read_static_array",
            ReadStaticArrayWithSize => "read_static_array_with_size",
            ReadDynamicArray => "read_dynamic_array",
            ReadDynamicArrayWithSize => "read_dynamic_array_with_size",
            LoadSymbol => "load_symbol",
            Call => "call",
            Export => "export",
            Dup => "dup",
            Pop => "pop",
            Eq => "eq",
            Neq => "neq",
            Gt => "gt",
            Gte => "gte",
            Lt => "lt",
            Lte => "lte",
            Not => "not",
            Cmp => "cmp",
            Jmp => "jmp",
            Return => "return",
        }
    }
}

/// One encoded instruction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<u16>,
}

impl Instruction {
    pub fn new(opcode: Opcode, operands: Vec<u16>) -> Self {
        Self { opcode, operands }
    }

    /// Operand reinterpreted as a signed jump offset.
    #[inline]
    pub fn offset_operand(&self, index: usize) -> i16 {
        self.operands[index] as i16
    }

    /// Operand reinterpreted as a symbol id.
    #[inline]
    pub fn symbol_operand(&self, index: usize) -> SymbolId {
        SymbolId::new(self.operands[index])
    }
}

/// A named function body.
#[derive(Clone, Debug)]
pub struct Function {
    pub name: SymbolId,
    pub instructions: Vec<Instruction>,
}

/// A compiled program: interned symbols plus an ordered function table.
#[derive(Debug, Default)]
pub struct Bytecode {
    symbols: SymbolTable,
    functions: Vec<Function>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self {
            symbols: SymbolTable::new(),
            functions: Vec::new(),
        }
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    /// Append a finished function body under the given name.
    pub fn add_function(&mut self, name: &str, instructions: Vec<Instruction>) -> SymbolId {
        let name = self.symbols.intern_string(name);
        self.functions.push(Function { name, instructions });
        name
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Linear lookup by name symbol; the function table is small.
    pub fn function(&self, name: SymbolId) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Split into the parts the virtual machine loads.
    pub fn into_parts(self) -> (SymbolTable, Vec<Function>) {
        (self.symbols, self.functions)
    }
}
