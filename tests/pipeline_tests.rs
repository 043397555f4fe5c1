use bumpalo::Bump;
use object::{Object, ObjectSection, ObjectSymbol, RelocationTarget, SymbolSection};

use freestand::core::{CompilationContext, CompileError};
use freestand::fixup::RelocationEntry;
use freestand::frontend::{EntrySignature, Field, HeapValue, Scalar, ScalarKind, TextualFrontend};
use freestand::ir::{CastOp, InstKind, Operand, Type};
use freestand::pipeline::{compile, CompiledUnit};
use freestand::runtime::{Machine, MachineError, RtObject};

const RECORD: u64 = 0x7f0000100000;
const TEXT: u64 = 0x7f0000100040;
const ARRAY: u64 = 0x7f0000300000;

fn frontend(source: &str, heap: Vec<(u64, HeapValue)>) -> TextualFrontend {
    let mut fe = TextualFrontend::new();
    fe.add_source("entry", source).unwrap();
    for (address, value) in heap {
        fe.heap_image_mut().insert(address, value);
    }
    fe
}

fn compile_unit(fe: &TextualFrontend, signature: &EntrySignature) -> CompiledUnit {
    let arena = Bump::new();
    let ctx = CompilationContext::new(&arena);
    compile(&ctx, fe, signature).unwrap()
}

fn ptr_entry() -> EntrySignature {
    EntrySignature::new("main", vec![], Type::PTR)
}

fn tuple_heap() -> Vec<(u64, HeapValue)> {
    vec![
        (TEXT, HeapValue::Text("hi".into())),
        (
            RECORD,
            HeapValue::Record {
                ty: None,
                fields: vec![Field::Scalar(Scalar::Int64(1)), Field::Ref(Some(TEXT))],
            },
        ),
    ]
}

const RETURN_RECORD: &str = r#"
define @julia_main_1() -> ptr {
entry:
    ret inttoptr(0x7f0000100000)
}
"#;

fn relocation_targets(file: &object::File<'_>, section: &str) -> Vec<String> {
    let section = file.section_by_name(section).unwrap();
    section
        .relocations()
        .map(|(_, reloc)| {
            let RelocationTarget::Symbol(index) = reloc.target() else {
                panic!("relocation without a symbol");
            };
            file.symbol_by_index(index).unwrap().name().unwrap().to_string()
        })
        .collect()
}

#[test]
fn test_fixed_record_embeds_one_slot() {
    let _ = env_logger::builder().is_test(true).try_init();

    let fe = frontend(RETURN_RECORD, tuple_heap());
    let unit = compile_unit(&fe, &ptr_entry());

    assert_eq!(unit.slots.len(), 1);
    assert_eq!(unit.slots[0].address, RECORD);
    // Tuple image first, then the text at the next 8-byte boundary.
    assert_eq!(&unit.blob[0..8], &1u64.to_le_bytes());
    assert_eq!(&unit.blob[8..16], &0u64.to_le_bytes());
    assert_eq!(&unit.blob[16..18], b"hi");
    assert_eq!(unit.blob.len(), 18);

    let mut machine = Machine::new(&unit.module).unwrap();
    machine.call("main_init", &[]).unwrap();
    let record = machine.call("main", &[]).unwrap();
    assert!(matches!(
        machine.object(record),
        Some(RtObject::Record { nfields: 2, refmask: 0b10, .. })
    ));
    assert_eq!(machine.record_field(record, 0).unwrap(), 1);
    let text = machine.record_field(record, 1).unwrap();
    assert_eq!(machine.text(text).unwrap(), "hi");
}

#[test]
fn test_object_layout() {
    let _ = env_logger::builder().is_test(true).try_init();

    let fe = frontend(RETURN_RECORD, tuple_heap());
    let unit = compile_unit(&fe, &ptr_entry());
    let file = object::File::parse(&*unit.object).unwrap();
    assert_eq!(file.architecture(), object::Architecture::X86_64);

    for name in ["main", "main_init"] {
        let symbol = file.symbol_by_name(name).unwrap();
        assert!(symbol.is_global(), "{name} must be exported");
        assert!(symbol.is_definition());
        let section = file.section_by_index(symbol.section_index().unwrap()).unwrap();
        assert_eq!(section.name().unwrap(), ".text");
    }
    assert!(file.symbol_by_name("main_deserialize").unwrap().is_local());
    assert!(file.symbol_by_name("julia_main_1").is_none());

    let blob = file.symbol_by_name("main_blob").unwrap();
    let rodata = file.section_by_name(".rodata").unwrap();
    assert_eq!(blob.section_index(), Some(rodata.index()));
    let start = (blob.address() - rodata.address()) as usize;
    assert_eq!(&rodata.data().unwrap()[start..start + unit.blob.len()], &unit.blob[..]);

    let bss = file.section_by_name(".bss").unwrap();
    for name in ["main_slot0", "main_init_guard"] {
        let symbol = file.symbol_by_name(name).unwrap();
        assert_eq!(symbol.section(), SymbolSection::Section(bss.index()));
    }

    assert_eq!(relocation_targets(&file, ".data"), vec!["main_slot0".to_string()]);
}

#[test]
fn test_runtime_addresses_become_two_declarations() {
    let _ = env_logger::builder().is_test(true).try_init();

    let fe = frontend(
        r#"
symbol 0x7f0000001000 "rt_alloc" library
symbol 0x7f0000002000 "rt_report_oom" library
define @julia_main_2(i64 %n) -> ptr {
entry:
    %a = call ptr inttoptr(0x7f0000001000)(i64 %n)
    %b = call ptr inttoptr(0x7f0000001000)(i64 16)
    call void inttoptr(0x7f0000002000)(i64 %n)
    call void inttoptr(0x7f0000002000)(i64 16)
    ret %b
}
"#,
        Vec::new(),
    );
    let unit = compile_unit(&fe, &EntrySignature::new("main", vec![Type::I64], Type::PTR));

    let externals: Vec<(&u64, &RelocationEntry)> = unit.relocations.iter().collect();
    assert_eq!(externals.len(), 2);
    assert!(matches!(
        externals[0],
        (0x7f0000001000, RelocationEntry::ExternalSymbol { name }) if name == "rt_alloc"
    ));
    assert!(matches!(
        externals[1],
        (0x7f0000002000, RelocationEntry::ExternalSymbol { name }) if name == "rt_report_oom"
    ));
    for name in ["rt_alloc", "rt_report_oom"] {
        let declared = unit.module.functions.iter().filter(|f| f.name == name).count();
        assert_eq!(declared, 1, "{name}");
    }

    let file = object::File::parse(&*unit.object).unwrap();
    let targets = relocation_targets(&file, ".text");
    assert_eq!(targets.iter().filter(|t| *t == "rt_alloc").count(), 2);
    assert_eq!(targets.iter().filter(|t| *t == "rt_report_oom").count(), 2);
    assert!(file.symbol_by_name("rt_alloc").unwrap().is_undefined());

    let mut machine = Machine::new(&unit.module).unwrap();
    machine.call("main_init", &[]).unwrap();
    assert_eq!(machine.call("main", &[24]), Err(MachineError::OutOfMemory(24)));
    assert_eq!(machine.runtime_calls(), &["rt_alloc", "rt_alloc", "rt_report_oom"]);
}

#[test]
fn test_aliased_array_is_rebuilt_once() {
    let _ = env_logger::builder().is_test(true).try_init();

    let payload: Vec<u8> = [10i64, 20, 30].iter().flat_map(|v| v.to_le_bytes()).collect();
    let heap = vec![
        (
            ARRAY,
            HeapValue::RawArray {
                elem: ScalarKind::Int64,
                dims: vec![3],
                data: payload.clone(),
            },
        ),
        (
            RECORD,
            HeapValue::Record {
                ty: None,
                fields: vec![Field::Ref(Some(ARRAY)), Field::Ref(Some(ARRAY))],
            },
        ),
    ];
    let unit = compile_unit(&frontend(RETURN_RECORD, heap), &ptr_entry());

    let occurrences = unit.blob.windows(payload.len()).filter(|w| *w == &payload[..]).count();
    assert_eq!(occurrences, 1);

    let mut machine = Machine::new(&unit.module).unwrap();
    machine.call("main_init", &[]).unwrap();
    let record = machine.call("main", &[]).unwrap();
    let first = machine.record_field(record, 0).unwrap();
    let second = machine.record_field(record, 1).unwrap();
    assert_eq!(first, second);
    let Some(RtObject::Array { elem, dims, data, .. }) = machine.object(first).cloned() else {
        panic!("field does not hold an array");
    };
    assert_eq!(elem, Some(ScalarKind::Int64));
    assert_eq!(dims, vec![3]);
    assert_eq!(machine.read_u64(data + 16).unwrap(), 30);
    let adopted = machine
        .runtime_calls()
        .iter()
        .filter(|name| *name == "rt_adopt_array")
        .count();
    assert_eq!(adopted, 1);
}

#[test]
fn test_one_object_used_twice_shares_a_slot() {
    let fe = frontend(
        r#"
define @julia_main_3() -> i64 {
entry:
    %a = load i64, inttoptr(0x7f0000100000)
    %p = gep ptr inttoptr(0x7f0000100000), 8
    %b = load i64, %p
    %c = add i64 %a, %b
    ret %c
}
"#,
        tuple_heap(),
    );
    let unit = compile_unit(&fe, &EntrySignature::new("main", vec![], Type::I64));
    assert_eq!(unit.slots.len(), 1);

    let slot = unit.module.global_by_name("main_slot0").unwrap();
    let main = unit.module.func(unit.module.function_by_name("main").unwrap());
    let slot_loads = main
        .placed_insts()
        .filter(|&(_, id)| main.inst(id).kind == InstKind::Load { ptr: Operand::Global(slot) })
        .count();
    assert!(slot_loads >= 1);

    let mut machine = Machine::new(&unit.module).unwrap();
    machine.call("main_init", &[]).unwrap();
    // Field 0 holds 1, field 1 the text pointer.
    let text = {
        let record = machine.load_global("main_slot0").unwrap();
        machine.record_field(record, 1).unwrap()
    };
    assert_eq!(machine.call("main", &[]).unwrap(), 1 + text);
}

#[test]
fn test_compilation_is_deterministic() {
    let source = r#"
symbol 0x7f0000001000 "rt_alloc" library
define @julia_main_4(i64 %n) -> ptr {
entry:
    %a = call ptr inttoptr(0x7f0000001000)(i64 %n)
    store ptr inttoptr(0x7f0000100000), %a
    ret inttoptr(0x7f0000100040)
}
"#;
    let first = compile_unit(&frontend(source, tuple_heap()), &EntrySignature::new("main", vec![Type::I64], Type::PTR));
    let second = compile_unit(&frontend(source, tuple_heap()), &EntrySignature::new("main", vec![Type::I64], Type::PTR));

    assert_eq!(first.blob, second.blob);
    assert_eq!(first.relocations, second.relocations);
    assert_eq!(first.object, second.object);
    assert_eq!(first.module.to_string(), second.module.to_string());
}

#[test]
fn test_blob_words_are_aligned() {
    let heap = vec![
        (0x7f0000400000, HeapValue::Text("abc".into())),
        (
            0x7f0000400040,
            HeapValue::RawArray {
                elem: ScalarKind::Int8,
                dims: vec![5],
                data: vec![1, 2, 3, 4, 5],
            },
        ),
        (
            RECORD,
            HeapValue::Record {
                ty: None,
                fields: vec![
                    Field::Ref(Some(0x7f0000400000)),
                    Field::Scalar(Scalar::Int8(-1)),
                    Field::Ref(Some(0x7f0000400040)),
                ],
            },
        ),
    ];
    let unit = compile_unit(&frontend(RETURN_RECORD, heap), &ptr_entry());
    assert!(unit.blob_writes.iter().any(|w| !w.bytes));
    for write in &unit.blob_writes {
        if !write.bytes {
            assert_eq!(write.offset % 8, 0, "{write:?}");
        }
        assert!(write.offset + write.len <= unit.blob.len() as u64);
    }
}

#[test]
fn test_no_process_address_survives() {
    let fe = frontend(
        r#"
symbol 0x7f0000001000 "rt_alloc" library
define @julia_main_5(i64 %n) -> ptr {
entry:
    %a = call ptr bitcast(inttoptr(0x7f0000001000))(i64 %n)
    %b = inttoptr i64 139637977776192 to ptr
    %c = gep ptr bitcast(inttoptr(0x7f0000100000)), 8
    store ptr %b, %a
    ret %c
}
"#,
        tuple_heap(),
    );
    let unit = compile_unit(&fe, &EntrySignature::new("main", vec![Type::I64], Type::PTR));

    let threshold = freestand::core::CompileOptions::default().embed_threshold;
    for function in &unit.module.functions {
        for (_, id) in function.placed_insts() {
            let inst = function.inst(id);
            assert!(
                !inst.operands().iter().any(|op| matches!(op, Operand::Const(_))),
                "constant left in @{}",
                function.name
            );
            if let InstKind::Cast {
                op: CastOp::IntToPtr,
                value: Operand::Int(literal),
                ..
            } = inst.kind
            {
                assert!((literal as u64) < threshold, "raw address in @{}", function.name);
            }
        }
    }
}

#[test]
fn test_unresolved_address_reports_its_location() {
    let fe = frontend(
        r#"
define @julia_main_6() -> ptr {
entry:
    %a = call ptr inttoptr(0x7f00000dead0)(i64 1)
    ret %a
}
"#,
        Vec::new(),
    );
    let arena = Bump::new();
    let ctx = CompilationContext::new(&arena);
    match compile(&ctx, &fe, &ptr_entry()) {
        Err(CompileError::RelocationResolutionFailure { address, location }) => {
            assert_eq!(address, 0x7f00000dead0);
            assert_eq!(location.function.as_deref(), Some("main"));
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("expected a resolution failure"),
    }
}

#[test]
fn test_opaque_object_is_unsupported() {
    let heap = vec![
        (
            0x7f0000500000,
            HeapValue::Opaque {
                type_name: "Task".into(),
            },
        ),
        (
            RECORD,
            HeapValue::Record {
                ty: None,
                fields: vec![Field::Ref(Some(0x7f0000500000))],
            },
        ),
    ];
    let fe = frontend(RETURN_RECORD, heap);
    let arena = Bump::new();
    let ctx = CompilationContext::new(&arena);
    match compile(&ctx, &fe, &ptr_entry()) {
        Err(CompileError::UnsupportedConstruct { what, .. }) => {
            assert!(what.contains("Task"), "{what}");
            assert!(what.contains("field 0"), "{what}");
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("opaque object was serialized"),
    }
}
