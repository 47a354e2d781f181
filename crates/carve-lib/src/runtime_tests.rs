use std::collections::BTreeMap;

use indoc::indoc;

use crate::{Endian, Level, Literal, PatternKind, Runtime};

fn runtime_over(data: Vec<u8>) -> Runtime {
    let mut runtime = Runtime::new();
    let size = data.len() as u64;
    runtime.set_data_source(0, size, move |address, buffer| {
        let start = address as usize;
        buffer.copy_from_slice(&data[start..start + buffer.len()]);
    });
    runtime.set_default_endian(Endian::Little);
    runtime
}

fn run(runtime: &mut Runtime, code: &str) -> bool {
    runtime.execute_string(code, &BTreeMap::new(), &BTreeMap::new(), false)
}

#[test]
fn single_u32_little_endian() {
    let mut runtime = runtime_over(vec![0x78, 0x56, 0x34, 0x12]);

    assert!(run(&mut runtime, "u32 x @ 0x00;"));

    let patterns = runtime.get_all_patterns(0);
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].name, "x");
    assert_eq!(patterns[0].type_name, "u32");
    assert_eq!(patterns[0].address, 0);
    assert_eq!(patterns[0].size, 4);
    assert_eq!(patterns[0].kind, PatternKind::Unsigned(0x1234_5678));
}

#[test]
fn struct_with_two_fields() {
    let mut runtime = runtime_over(vec![0xAA, 0xBB, 0xCC]);

    assert!(run(
        &mut runtime,
        "struct P { u8 a; u16 b; }; P p @ 0x00;"
    ));

    let patterns = runtime.get_all_patterns(0);
    assert_eq!(patterns.len(), 1);
    let p = &patterns[0];
    assert_eq!(p.name, "p");
    assert_eq!(p.type_name, "P");
    assert_eq!(p.size, 3);

    let members = p.children();
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].name, "a");
    assert_eq!(members[0].type_name, "u8");
    assert_eq!(members[0].address, 0);
    assert_eq!(members[0].as_unsigned(), Some(0xAA));
    assert_eq!(members[1].name, "b");
    assert_eq!(members[1].type_name, "u16");
    assert_eq!(members[1].address, 1);
    assert_eq!(members[1].as_unsigned(), Some(0xCCBB));
}

#[test]
fn static_array() {
    let mut runtime = runtime_over(vec![1, 2, 3, 4]);

    assert!(run(&mut runtime, "u8 arr[4] @ 0x00;"));

    let patterns = runtime.get_all_patterns(0);
    let arr = &patterns[0];
    assert_eq!(arr.name, "arr");
    assert_eq!(arr.size, 4);

    let entries = arr.children();
    assert_eq!(entries.len(), 4);
    let values: Vec<u128> = entries.iter().filter_map(|e| e.as_unsigned()).collect();
    assert_eq!(values, vec![1, 2, 3, 4]);
}

#[test]
fn conditional_member_selects_by_tag() {
    let program = indoc! {"
        struct M {
            u8 tag;
            if (tag == 1)
                u16 a;
            else
                u8 a;
        };
        M m @ 0x00;
    "};

    let mut runtime = runtime_over(vec![0x01, 0x02, 0x00]);
    assert!(run(&mut runtime, program));
    let m = &runtime.get_all_patterns(0)[0];
    let a = &m.children()[1];
    assert_eq!(a.name, "a");
    assert_eq!(a.type_name, "u16");
    assert_eq!(a.as_unsigned(), Some(0x0002));
    assert_eq!(m.size, 3);

    let mut runtime = runtime_over(vec![0x02, 0x07]);
    assert!(run(&mut runtime, program));
    let m = &runtime.get_all_patterns(0)[0];
    let a = &m.children()[1];
    assert_eq!(a.type_name, "u8");
    assert_eq!(a.as_unsigned(), Some(7));
    assert_eq!(m.size, 2);
}

#[test]
fn inheritance_reads_base_fields_first() {
    let program = indoc! {"
        struct Base { u32 magic; };
        struct Derived : Base { u16 version; };
        Derived d @ 0x00;
    "};

    let mut runtime = runtime_over(vec![0x7F, 0x45, 0x4C, 0x46, 0x01, 0x00]);
    assert!(run(&mut runtime, program));

    let d = &runtime.get_all_patterns(0)[0];
    assert_eq!(d.size, 6);

    let members = d.children();
    assert_eq!(members[0].name, "magic");
    assert_eq!(members[0].as_unsigned(), Some(0x464C_457F));
    assert_eq!(members[1].name, "version");
    assert_eq!(members[1].as_unsigned(), Some(1));
}

#[test]
fn abort_discards_the_run_without_an_error() {
    let mut runtime = Runtime::new();
    runtime.set_data_source(0, u64::MAX, |_, buffer| buffer.fill(0));
    runtime.set_default_endian(Endian::Little);

    let handle = runtime.abort_handle();
    let watchdog = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        handle.store(false, std::sync::atomic::Ordering::Relaxed);
    });

    let program = indoc! {"
        #pragma loop_limit 0
        #pragma array_limit 0
        u8 first @ 0x00;
        u8 rest[while (first == 0)] @ 0x01;
    "};
    let success = run(&mut runtime, program);
    watchdog.join().unwrap();

    assert!(success);
    assert!(runtime.get_all_patterns(0).is_empty());
    assert!(runtime
        .get_console_log()
        .iter()
        .all(|(level, _)| *level != Level::Error));
}

#[test]
fn endian_pragma_changes_decoding() {
    let mut runtime = runtime_over(vec![0x12, 0x34]);

    assert!(run(&mut runtime, "#pragma endian big\nu16 x @ 0x00;"));
    assert_eq!(
        runtime.get_all_patterns(0)[0].as_unsigned(),
        Some(0x1234)
    );
}

#[test]
fn array_limit_pragma_is_enforced() {
    let mut runtime = runtime_over(vec![0; 8]);

    let success = run(&mut runtime, "#pragma array_limit 2\nu8 a[4] @ 0x00;");

    assert!(!success);
    let error = runtime.get_error().unwrap();
    assert!(error.message.contains("array limit"), "{}", error.message);
}

#[test]
fn unknown_pragma_is_an_error() {
    let mut runtime = runtime_over(vec![0; 4]);

    assert!(!run(&mut runtime, "#pragma frobnicate on\nu8 x @ 0;"));
    let error = runtime.get_error().unwrap();
    assert_eq!(error.line, 1);
    assert!(error.message.contains("frobnicate"));
}

#[test]
fn parse_errors_surface_with_position_and_console_echo() {
    let mut runtime = runtime_over(vec![0; 4]);

    assert!(!run(&mut runtime, "u32 @ ;"));

    let error = runtime.get_error().unwrap();
    assert_eq!(error.line, 1);
    assert!(error.message.contains("P0001"));

    let (level, message) = runtime.get_console_log().last().unwrap();
    assert_eq!(*level, Level::Error);
    assert!(message.contains("P0001"));
}

#[test]
fn validation_errors_abort_the_pipeline() {
    let mut runtime = runtime_over(vec![0; 4]);

    assert!(!run(&mut runtime, "Mystery m @ 0x00;"));
    assert!(runtime.get_error().unwrap().message.contains("E0002"));
    assert!(runtime.get_all_patterns(0).is_empty());
}

#[test]
fn defines_substitute_before_compilation() {
    let mut runtime = runtime_over(vec![0x00, 0x42]);
    runtime.add_define("OFFSET", "1");

    assert!(run(&mut runtime, "u8 x @ OFFSET;"));
    let x = &runtime.get_all_patterns(0)[0];
    assert_eq!(x.address, 1);
    assert_eq!(x.as_unsigned(), Some(0x42));
}

#[test]
fn in_variables_are_visible_to_expressions() {
    let mut runtime = runtime_over(vec![0x10, 0x20, 0x30]);

    let mut in_vars = BTreeMap::new();
    in_vars.insert("which".to_owned(), Literal::Unsigned(1));

    let success = runtime.execute_string(
        "u8 x @ (which == 1 ? 2 : 0);",
        &BTreeMap::new(),
        &in_vars,
        false,
    );
    assert!(success, "{:?}", runtime.get_error());
    assert_eq!(runtime.get_all_patterns(0)[0].as_unsigned(), Some(0x30));
}

#[test]
fn interval_queries_find_overlapping_patterns() {
    let mut runtime = runtime_over(vec![0xAA, 0xBB, 0xCC, 0xDD]);

    assert!(run(
        &mut runtime,
        "struct P { u8 a; u16 b; }; P p @ 0x00; u8 tail @ 0x03;"
    ));

    let hits = runtime.get_patterns_at_address(1, 0);
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name, "p");

    let hits = runtime.get_patterns_at_address(3, 0);
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name, "tail");

    assert!(runtime.get_patterns_at_address(4, 0).is_empty());
}

#[test]
fn repeated_runs_are_deterministic() {
    fn snapshot() -> String {
        let mut runtime = runtime_over(vec![0xAA, 0xBB, 0xCC]);
        assert!(run(
            &mut runtime,
            "struct P { u8 a; u16 b; }; P p @ 0x00;"
        ));
        serde_json::to_string(runtime.get_all_patterns(0)).unwrap()
    }

    assert_eq!(snapshot(), snapshot());
}

#[test]
fn reset_is_idempotent() {
    let mut runtime = runtime_over(vec![0; 4]);
    assert!(run(&mut runtime, "u32 x @ 0x00;"));
    assert!(!runtime.get_all_patterns(0).is_empty());

    runtime.reset();
    let after_once = (
        runtime.get_all_patterns(0).len(),
        runtime.get_console_log().len(),
        runtime.get_error().cloned(),
    );

    runtime.reset();
    let after_twice = (
        runtime.get_all_patterns(0).len(),
        runtime.get_console_log().len(),
        runtime.get_error().cloned(),
    );

    assert_eq!(after_once, after_twice);
    assert_eq!(after_once.0, 0);
}

#[test]
fn sections_report_main_and_heap() {
    let mut runtime = runtime_over(vec![0; 4]);
    assert!(run(&mut runtime, "u32 x @ 0x00;"));

    let sections = runtime.get_sections();
    assert_eq!(sections[&crate::MAIN_SECTION].name, "Data");
    assert_eq!(sections[&crate::MAIN_SECTION].size, 4);
    assert!(sections.contains_key(&crate::HEAP_SECTION));
}

#[test]
fn execute_function_runs_a_bare_body() {
    let mut runtime = runtime_over(vec![7]);

    let (success, result) = runtime.execute_function("u8 t @ 0x00;");
    assert!(success);
    assert!(result.is_none());
    assert_eq!(runtime.get_all_patterns(0)[0].as_unsigned(), Some(7));
}

#[test]
fn while_array_keeps_its_probe_element_when_the_condition_fails() {
    let program = indoc! {"
        struct S {
            u8 len;
            u8 body[while (len == 3)];
        };
        S s @ 0x00;
    "};

    // the template element is read once before the first condition check
    let mut runtime = runtime_over(vec![5, 9]);
    assert!(run(&mut runtime, program), "{:?}", runtime.get_error());

    let s = &runtime.get_all_patterns(0)[0];
    assert_eq!(s.size, 2);
    let body = &s.children()[1];
    assert_eq!(body.children().len(), 1);
    assert_eq!(body.children()[0].as_unsigned(), Some(9));
}

#[test]
fn runaway_while_array_trips_the_loop_limit() {
    let program = indoc! {"
        struct S {
            u8 len;
            u8 body[while (len == 3)];
        };
        S s @ 0x00;
    "};

    // the condition never turns false; the loop limit stops the run
    let mut runtime = Runtime::new();
    runtime.set_data_source(0, u64::MAX, |_, buffer| buffer.fill(3));
    runtime.set_default_endian(Endian::Little);

    assert!(!run(&mut runtime, program));
    assert!(runtime.get_error().unwrap().message.contains("limit"));
}

#[test]
fn enum_typed_pattern_carries_the_enum_name() {
    let program = indoc! {"
        enum Color : u8 { Red = 1, Green };
        Color c @ 0x00;
    "};

    let mut runtime = runtime_over(vec![2]);
    assert!(run(&mut runtime, program));

    let c = &runtime.get_all_patterns(0)[0];
    assert_eq!(c.type_name, "Color");
    assert_eq!(c.size, 1);
    assert_eq!(c.as_unsigned(), Some(2));
}

#[test]
fn console_records_phase_timings_at_debug_level() {
    let mut runtime = runtime_over(vec![0; 4]);
    assert!(run(&mut runtime, "u32 x @ 0x00;"));

    let debug_lines = runtime
        .get_console_log()
        .iter()
        .filter(|(level, _)| *level == Level::Debug)
        .count();
    assert!(debug_lines >= 2);
}

#[test]
fn debug_pragma_logs_the_disassembly() {
    let mut runtime = runtime_over(vec![0; 4]);
    assert!(run(&mut runtime, "#pragma debug\nu32 x @ 0x00;"));

    let listing = runtime
        .get_console_log()
        .iter()
        .any(|(_, message)| message.contains("function <main>"));
    assert!(listing);
}
