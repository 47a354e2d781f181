use carve_bytecode::{Bytecode, Emitter};
use carve_core::{Endian, TypeId, PALETTE};

use crate::machine::{IoOperations, Limits, VirtualMachine};
use crate::pattern::PatternKind;
use crate::RuntimeError;

fn vm_over(data: Vec<u8>) -> VirtualMachine {
    let mut vm = VirtualMachine::new();
    vm.set_data_window(0, data.len() as u64);
    vm.set_io_operations(IoOperations {
        read: Box::new(move |address, buffer| {
            let start = address as usize;
            buffer.copy_from_slice(&data[start..start + buffer.len()]);
        }),
        write: None,
    });
    vm.set_default_endian(Endian::Little);
    vm
}

fn run(vm: &mut VirtualMachine, bytecode: Bytecode) {
    vm.load_bytecode(bytecode);
    vm.enter_main().unwrap();
    vm.run().unwrap();
}

fn main_only(build: impl FnOnce(&mut Emitter<'_>)) -> Bytecode {
    let mut bytecode = Bytecode::new();
    let mut emitter = Emitter::new(bytecode.symbols_mut());
    build(&mut emitter);
    emitter.return_();
    let body = emitter.finish();
    bytecode.add_function("<main>", body);
    bytecode
}

#[test]
fn scalar_read_advances_cursor_and_exports() {
    let mut vm = vm_over(vec![0x78, 0x56, 0x34, 0x12]);
    let bytecode = main_only(|emitter| {
        emitter.read_value("u32", TypeId::U32);
        emitter.store_value("x", "u32");
    });
    run(&mut vm, bytecode);

    assert_eq!(vm.data_offset(), 4);

    let patterns = &vm.patterns()[&0];
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].name, "x");
    assert_eq!(patterns[0].type_name, "u32");
    assert_eq!(patterns[0].address, 0);
    assert_eq!(patterns[0].size, 4);
    assert_eq!(patterns[0].kind, PatternKind::Unsigned(0x1234_5678));
}

#[test]
fn big_endian_decoding() {
    let mut vm = vm_over(vec![0x12, 0x34]);
    vm.set_default_endian(Endian::Big);
    let bytecode = main_only(|emitter| {
        emitter.read_value("u16", TypeId::U16);
        emitter.store_value("x", "u16");
    });
    run(&mut vm, bytecode);

    assert_eq!(vm.patterns()[&0][0].as_unsigned(), Some(0x1234));
}

#[test]
fn signed_reads_sign_extend() {
    let mut vm = vm_over(vec![0xFF]);
    let bytecode = main_only(|emitter| {
        emitter.read_value("s8", TypeId::S8);
        emitter.store_value("x", "s8");
    });
    run(&mut vm, bytecode);

    assert_eq!(vm.patterns()[&0][0].as_signed(), Some(-1));
}

#[test]
fn constructor_read_populates_a_struct() {
    let mut vm = vm_over(vec![0xAA, 0xBB, 0xCC]);

    let mut bytecode = Bytecode::new();
    let mut ctor = Emitter::new(bytecode.symbols_mut());
    ctor.read_field("a", "u8", TypeId::U8);
    ctor.read_field("b", "u16", TypeId::U16);
    ctor.return_();
    let body = ctor.finish();
    bytecode.add_function("<init>P", body);

    let mut main = Emitter::new(bytecode.symbols_mut());
    main.read_value("P", TypeId::Structure);
    main.export("p");
    main.return_();
    let body = main.finish();
    bytecode.add_function("<main>", body);

    run(&mut vm, bytecode);

    let pattern = &vm.patterns()[&0][0];
    assert_eq!(pattern.type_name, "P");
    assert_eq!(pattern.size, 3);

    let members = pattern.children();
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].name, "a");
    assert_eq!(members[0].as_unsigned(), Some(0xAA));
    assert_eq!(members[0].address, 0);
    assert_eq!(members[1].name, "b");
    assert_eq!(members[1].as_unsigned(), Some(0xCCBB));
    assert_eq!(members[1].address, 1);

    assert_eq!(vm.data_offset(), 3);
}

#[test]
fn load_field_reads_from_the_struct_on_the_stack() {
    let mut vm = vm_over(vec![0xAA, 0xBB, 0xCC]);

    let mut bytecode = Bytecode::new();
    let mut ctor = Emitter::new(bytecode.symbols_mut());
    ctor.read_field("a", "u8", TypeId::U8);
    ctor.read_field("b", "u16", TypeId::U16);
    ctor.return_();
    let body = ctor.finish();
    bytecode.add_function("<init>P", body);

    let mut main = Emitter::new(bytecode.symbols_mut());
    main.read_value("P", TypeId::Structure);
    main.load_field("b");
    main.store_value("x", "u16");
    main.return_();
    let body = main.finish();
    bytecode.add_function("<main>", body);

    run(&mut vm, bytecode);

    let pattern = &vm.patterns()[&0][0];
    assert_eq!(pattern.name, "x");
    assert_eq!(pattern.address, 1);
    assert_eq!(pattern.as_unsigned(), Some(0xCCBB));
}

#[test]
fn store_attribute_records_on_the_struct_header() {
    let mut vm = vm_over(vec![0xAA]);

    let mut bytecode = Bytecode::new();
    let mut ctor = Emitter::new(bytecode.symbols_mut());
    ctor.read_field("a", "u8", TypeId::U8);
    ctor.return_();
    let body = ctor.finish();
    bytecode.add_function("<init>P", body);

    let mut main = Emitter::new(bytecode.symbols_mut());
    main.read_value("P", TypeId::Structure);
    main.store_attribute("hidden");
    main.return_();
    let body = main.finish();
    bytecode.add_function("<main>", body);

    run(&mut vm, bytecode);

    // the attributed struct stays on the stack and becomes the result
    let result = vm.result().unwrap();
    let cell = result.borrow();
    let structure = cell.as_struct().unwrap();
    assert_eq!(structure.header.attributes.len(), 1);

    let (&name, attribute) = structure.header.attributes.first().unwrap();
    assert_eq!(vm.symbols().get_string(name), Some("hidden"));
    assert_eq!(attribute.name, name);
}

#[test]
fn static_array_with_size_materializes_entries() {
    let mut vm = vm_over(vec![1, 2, 3, 4]);
    let bytecode = main_only(|emitter| {
        emitter.read_value("u8", TypeId::U8);
        let count = emitter.symbols().intern_unsigned(4);
        emitter.load_symbol(count);
        emitter.read_static_array_with_size("u8");
        emitter.store_value("arr", "u8[]");
    });
    run(&mut vm, bytecode);

    assert_eq!(vm.data_offset(), 4);

    let pattern = &vm.patterns()[&0][0];
    assert_eq!(pattern.size, 4);
    let entries = pattern.children();
    assert_eq!(entries.len(), 4);
    let values: Vec<u128> = entries.iter().filter_map(|e| e.as_unsigned()).collect();
    assert_eq!(values, vec![1, 2, 3, 4]);
    assert_eq!(entries[2].address, 2);
}

#[test]
fn cmp_skips_next_instruction_when_true() {
    let mut vm = vm_over(vec![0xAA, 0xBB]);
    let bytecode = main_only(|emitter| {
        let truthy = emitter.symbols().intern_unsigned(1);
        emitter.load_symbol(truthy);
        emitter.cmp();
        emitter.read_value("u8", TypeId::U8); // skipped
        emitter.read_value("u16", TypeId::U16);
        emitter.store_value("x", "u16");
    });
    run(&mut vm, bytecode);

    assert_eq!(vm.patterns()[&0][0].as_unsigned(), Some(0xBBAA));
}

#[test]
fn comparisons_handle_mixed_signedness() {
    fn compare_one(op: fn(&mut Emitter<'_>), a: i64, b: u64) -> bool {
        let mut vm = vm_over(vec![]);
        let bytecode = main_only(|emitter| {
            let a = emitter.symbols().intern_signed(a);
            let b = emitter.symbols().intern_unsigned(b);
            emitter.load_symbol(a);
            emitter.load_symbol(b);
            op(emitter);
            emitter.store_value("r", "bool");
        });
        run(&mut vm, bytecode);
        match vm.patterns()[&0][0].kind {
            PatternKind::Bool(v) => v,
            _ => panic!("expected a bool pattern"),
        }
    }

    // -1 never casts into the unsigned domain
    assert!(compare_one(|e| e.lt(), -1, 1));
    assert!(!compare_one(|e| e.gt(), -1, 1));
    assert!(!compare_one(|e| e.eq(), -1, u64::MAX));
    assert!(compare_one(|e| e.lte(), 5, 5));
    assert!(compare_one(|e| e.gte(), 6, 5));
}

#[test]
fn comparison_totality_over_integer_pairs() {
    let samples: [(i64, u64); 6] = [
        (-3, 0),
        (0, 0),
        (1, 4),
        (4, 4),
        (7, 2),
        (i64::MIN, u64::MAX),
    ];

    for (a, b) in samples {
        let conditions: [fn(&mut Emitter<'_>); 3] = [|e| e.eq(), |e| e.lt(), |e| e.gt()];
        let results: Vec<bool> = conditions
            .into_iter()
            .map(|op| {
                let mut vm = vm_over(vec![]);
                let bytecode = main_only(|emitter| {
                    let a = emitter.symbols().intern_signed(a);
                    let b = emitter.symbols().intern_unsigned(b);
                    emitter.load_symbol(a);
                    emitter.load_symbol(b);
                    op(emitter);
                    emitter.store_value("r", "bool");
                });
                run(&mut vm, bytecode);
                match vm.patterns()[&0][0].kind {
                    PatternKind::Bool(v) => v,
                    _ => panic!("expected a bool pattern"),
                }
            })
            .collect();

        let holds = results.iter().filter(|&&r| r).count();
        assert_eq!(holds, 1, "exactly one of eq/lt/gt must hold for ({a}, {b})");
    }
}

#[test]
fn colors_cycle_deterministically() {
    fn export_colors() -> Vec<u32> {
        let mut vm = vm_over(vec![0; 16]);
        let bytecode = main_only(|emitter| {
            for name in ["a", "b", "c"] {
                emitter.read_value("u8", TypeId::U8);
                emitter.store_value(name, "u8");
            }
        });
        run(&mut vm, bytecode);
        vm.patterns()[&0].iter().map(|p| p.color).collect()
    }

    let first = export_colors();
    let second = export_colors();
    assert_eq!(first, second);
    assert_eq!(first[0], PALETTE[0]);
}

#[test]
fn pop_on_empty_stack_reports_underflow_with_context() {
    let mut vm = vm_over(vec![]);
    let bytecode = main_only(|emitter| emitter.pop());
    vm.load_bytecode(bytecode);
    vm.enter_main().unwrap();

    let error = vm.run().unwrap_err();
    assert_eq!(error.error, RuntimeError::StackUnderflow);
    assert_eq!(error.function, "<main>");
    assert_eq!(error.pc, 0);
}

#[test]
fn undefined_local_reports_its_name() {
    let mut vm = vm_over(vec![]);
    let bytecode = main_only(|emitter| emitter.load_local("missing"));
    vm.load_bytecode(bytecode);
    vm.enter_main().unwrap();

    let error = vm.run().unwrap_err();
    assert_eq!(
        error.error,
        RuntimeError::UndefinedVariable {
            name: "missing".to_owned()
        }
    );
}

#[test]
fn call_to_unknown_function_is_reported() {
    let mut vm = vm_over(vec![]);
    let bytecode = main_only(|emitter| emitter.call("nope"));
    vm.load_bytecode(bytecode);
    vm.enter_main().unwrap();

    let error = vm.run().unwrap_err();
    assert!(matches!(error.error, RuntimeError::MissingFunction { .. }));
}

#[test]
fn out_of_bounds_read_is_reported() {
    let mut vm = vm_over(vec![0x01]);
    let bytecode = main_only(|emitter| emitter.read_value("u32", TypeId::U32));
    vm.load_bytecode(bytecode);
    vm.enter_main().unwrap();

    let error = vm.run().unwrap_err();
    assert!(matches!(error.error, RuntimeError::OutOfBounds { .. }));
}

#[test]
fn eval_depth_limit_stops_nesting() {
    let mut vm = vm_over(vec![]);
    vm.set_limits(Limits {
        eval_depth: 1,
        ..Limits::default()
    });

    let mut bytecode = Bytecode::new();
    let mut noop = Emitter::new(bytecode.symbols_mut());
    noop.return_();
    let body = noop.finish();
    bytecode.add_function("helper", body);

    let mut main = Emitter::new(bytecode.symbols_mut());
    main.call("helper");
    main.return_();
    let body = main.finish();
    bytecode.add_function("<main>", body);

    vm.load_bytecode(bytecode);
    vm.enter_main().unwrap();
    let error = vm.run().unwrap_err();
    assert!(matches!(
        error.error,
        RuntimeError::LimitExceeded {
            limit: "eval_depth",
            ..
        }
    ));
}

#[test]
fn abort_flag_stops_the_run() {
    let mut vm = vm_over(vec![0; 4]);
    let bytecode = main_only(|emitter| {
        emitter.read_value("u32", TypeId::U32);
        emitter.store_value("x", "u32");
    });
    vm.load_bytecode(bytecode);
    vm.enter_main().unwrap();

    vm.abort();
    vm.run().unwrap();

    assert!(vm.was_aborted());
    assert!(vm.patterns().is_empty());
}

#[test]
fn reset_restores_pre_run_state() {
    let mut vm = vm_over(vec![0; 4]);
    let bytecode = main_only(|emitter| {
        emitter.read_value("u32", TypeId::U32);
        emitter.store_value("x", "u32");
    });
    run(&mut vm, bytecode);
    assert!(!vm.patterns().is_empty());

    vm.reset();
    assert!(vm.patterns().is_empty());
    assert_eq!(vm.data_offset(), 0);
    assert!(vm.result().is_none());

    // reset twice is reset once
    vm.reset();
    assert!(vm.patterns().is_empty());
    assert_eq!(vm.data_offset(), 0);
}

#[test]
fn start_address_positions_the_first_read() {
    let mut vm = vm_over(vec![0x00, 0x00, 0x99]);
    let bytecode = main_only(|emitter| {
        emitter.read_value("u8", TypeId::U8);
        emitter.store_value("x", "u8");
    });
    vm.load_bytecode(bytecode);
    vm.set_start_address(2);
    vm.enter_main().unwrap();
    vm.run().unwrap();

    assert_eq!(vm.patterns()[&0][0].address, 2);
    assert_eq!(vm.patterns()[&0][0].as_unsigned(), Some(0x99));
}

#[test]
fn cursor_store_moves_the_reader() {
    let mut vm = vm_over(vec![0x00, 0x00, 0x42]);
    let bytecode = main_only(|emitter| {
        let offset = emitter.symbols().intern_unsigned(2);
        emitter.load_symbol(offset);
        emitter.store_local("$", "u64");
        emitter.read_value("u8", TypeId::U8);
        emitter.store_value("x", "u8");
    });
    run(&mut vm, bytecode);

    let pattern = &vm.patterns()[&0][0];
    assert_eq!(pattern.address, 2);
    assert_eq!(pattern.as_unsigned(), Some(0x42));
}
