//! Human-readable bytecode listing for logs and debugging.
//!
//! Output shape: `function <name> { pc: mnemonic operands }` with symbol
//! operands resolved inline. Not a stable format.

use std::fmt::Write as _;

use carve_core::{SymbolTable, TypeId};

use crate::instructions::{Bytecode, Instruction, Opcode};

impl Bytecode {
    /// Render every function as a textual listing.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for function in self.functions() {
            let name = self.symbols().display(function.name);
            writeln!(out, "function {name} {{").unwrap();
            for (pc, instruction) in function.instructions.iter().enumerate() {
                let line = render(instruction, self.symbols());
                writeln!(out, "    {pc}: {line}").unwrap();
            }
            writeln!(out, "}}").unwrap();
        }
        out
    }
}

fn symbol(table: &SymbolTable, raw: u16) -> String {
    format!("#{raw} ({})", table.display(carve_core::SymbolId::new(raw)))
}

fn type_id(raw: u16) -> String {
    let name = TypeId::from_u16(raw).map(TypeId::name).unwrap_or("?");
    format!("{raw} ({name})")
}

fn offset(raw: u16) -> String {
    let value = raw as i16;
    if value >= 0 {
        format!("+{value}")
    } else {
        format!("{value}")
    }
}

fn render(instruction: &Instruction, table: &SymbolTable) -> String {
    use Opcode::*;
    let mnemonic = instruction.opcode.mnemonic();
    let ops = &instruction.operands;

    let rendered = match instruction.opcode {
        LoadField | StoreAttribute | LoadLocal | NewStruct | LoadFromThis | LoadSymbol | Call
        | Export => symbol(table, ops[0]),
        StoreField | StoreInThis | StoreLocal => {
            format!("{}, {}", symbol(table, ops[0]), symbol(table, ops[1]))
        }
        ReadValue | ReadArray => format!("{}, {}", symbol(table, ops[0]), type_id(ops[1])),
        ReadField => format!(
            "{}, {}, {}",
            symbol(table, ops[0]),
            symbol(table, ops[1]),
            type_id(ops[2])
        ),
        ReadStaticArray | ReadDynamicArray => {
            format!("{}, {}", symbol(table, ops[0]), offset(ops[1]))
        }
        ReadStaticArrayWithSize | ReadDynamicArrayWithSize => symbol(table, ops[0]),
        Jmp => offset(ops[0]),
        Dup | Pop | Eq | Neq | Gt | Gte | Lt | Lte | Not | Cmp | Return => String::new(),
    };

    if rendered.is_empty() {
        mnemonic.to_owned()
    } else {
        format!("{mnemonic} {rendered}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::Emitter;

    #[test]
    fn listing_resolves_symbols_and_offsets() {
        let mut bytecode = Bytecode::new();

        let mut emitter = Emitter::new(bytecode.symbols_mut());
        let end = emitter.label();
        emitter.read_value("u32", TypeId::U32);
        emitter.jmp(end);
        emitter.pop();
        emitter.place_label(end);
        emitter.resolve_label(end).unwrap();
        emitter.return_();
        let body = emitter.finish();
        bytecode.add_function("<main>", body);

        let listing = bytecode.disassemble();
        assert!(listing.contains("function <main> {"));
        assert!(listing.contains("read_value #1 (u32), 3 (u32)"));
        assert!(listing.contains("jmp +2"));
        assert!(listing.contains("3: return"));
    }
}
