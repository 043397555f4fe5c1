use bumpalo::Bump;

use freestand::core::{CompilationContext, CompileResult};
use freestand::frontend::{
    EntrySignature, ExtensionKind, Field, HeapValue, Scalar, ScalarKind, SingletonKind, TextualFrontend,
};
use freestand::ir::Type;
use freestand::pipeline::{compile, CompiledUnit};
use freestand::runtime::{Machine, RtObject};
use freestand::serialize::{Expr, ExtensionEncoder, ExtensionObject, Serializer};

const ROOT: u64 = 0x7f0000100000;

const RETURN_ROOT: &str = r#"
define @julia_main_1() -> ptr {
entry:
    ret inttoptr(0x7f0000100000)
}
"#;

fn frontend(heap: Vec<(u64, HeapValue)>) -> TextualFrontend {
    let mut fe = TextualFrontend::new();
    fe.add_source("entry", RETURN_ROOT).unwrap();
    for (address, value) in heap {
        fe.heap_image_mut().insert(address, value);
    }
    fe
}

fn compile_root(heap: Vec<(u64, HeapValue)>) -> CompiledUnit {
    let fe = frontend(heap);
    let arena = Bump::new();
    let ctx = CompilationContext::new(&arena);
    compile(&ctx, &fe, &EntrySignature::new("main", vec![], Type::PTR)).unwrap()
}

/// Run the initializer, then the entry, and return the entry's result.
fn initialize_and_run(machine: &mut Machine<'_>) -> u64 {
    machine.call("main_init", &[]).unwrap();
    machine.call("main", &[]).unwrap()
}

#[test]
fn test_scalars_round_trip_bit_identically() {
    let _ = env_logger::builder().is_test(true).try_init();

    let scalars = [
        Scalar::Int8(-5),
        Scalar::Int16(-300),
        Scalar::Int32(-70_000),
        Scalar::Int64(i64::MIN),
        Scalar::UInt8(250),
        Scalar::Float64(f64::from_bits(0x7ff8_0000_0000_0001)),
        Scalar::Float64(-0.0),
        Scalar::Bool(true),
        Scalar::Char('λ'),
    ];
    for scalar in scalars {
        let unit = compile_root(vec![(ROOT, HeapValue::Scalar(scalar))]);
        let mut machine = Machine::new(&unit.module).unwrap();
        let boxed = initialize_and_run(&mut machine);
        let rebuilt = machine.scalar(boxed).unwrap();
        assert!(rebuilt.bit_eq(scalar), "{scalar:?} came back as {rebuilt:?}");
        assert_eq!(rebuilt.kind(), scalar.kind());
    }
}

#[test]
fn test_initializer_runs_once() {
    let unit = compile_root(vec![(ROOT, HeapValue::Scalar(Scalar::Int64(42)))]);
    let mut machine = Machine::new(&unit.module).unwrap();

    // Without the initializer the slot is still empty.
    assert_eq!(machine.call("main", &[]).unwrap(), 0);

    machine.call("main_init", &[]).unwrap();
    let first = machine.call("main", &[]).unwrap();
    assert_ne!(first, 0);
    let calls = machine.runtime_calls().len();

    machine.call("main_init", &[]).unwrap();
    assert_eq!(machine.call("main", &[]).unwrap(), first);
    assert_eq!(machine.runtime_calls().len(), calls);
    assert_eq!(machine.load_global("main_init_guard").unwrap(), 1);
}

#[test]
fn test_self_referencing_record() {
    let unit = compile_root(vec![(
        ROOT,
        HeapValue::Record {
            ty: None,
            fields: vec![Field::Scalar(Scalar::Int32(7)), Field::Ref(Some(ROOT))],
        },
    )]);
    let mut machine = Machine::new(&unit.module).unwrap();
    let record = initialize_and_run(&mut machine);
    assert_eq!(machine.record_field(record, 0).unwrap(), 7);
    assert_eq!(machine.record_field(record, 1).unwrap(), record);
}

#[test]
fn test_boxed_array_keeps_unassigned_entries() {
    let element = 0x7f0000100100;
    let unit = compile_root(vec![
        (element, HeapValue::Scalar(Scalar::Int64(9))),
        (
            ROOT,
            HeapValue::BoxedArray {
                elem_type: None,
                dims: vec![3],
                elements: vec![Some(element), None, Some(element)],
            },
        ),
    ]);
    let mut machine = Machine::new(&unit.module).unwrap();
    let array = initialize_and_run(&mut machine);
    let Some(RtObject::Array { elem: None, dims, data, .. }) = machine.object(array).cloned() else {
        panic!("expected a boxed array");
    };
    assert_eq!(dims, vec![3]);
    let first = machine.read_u64(data).unwrap();
    assert_eq!(machine.read_u64(data + 8).unwrap(), 0);
    assert_eq!(machine.read_u64(data + 16).unwrap(), first);
    assert_eq!(machine.scalar(first), Some(Scalar::Int64(9)));
}

#[test]
fn test_descriptors_and_symbols() {
    let param = 0x7f0000100200;
    let desc = 0x7f0000100300;
    let unit = compile_root(vec![
        (param, HeapValue::Symbol("T".into())),
        (
            desc,
            HeapValue::TypeDescriptor {
                name: "Point".into(),
                params: vec![param],
            },
        ),
        (0x7f0000100400, HeapValue::Symbol("T".into())),
        (
            ROOT,
            HeapValue::Record {
                ty: Some(desc),
                fields: vec![Field::Ref(Some(0x7f0000100400)), Field::Ref(Some(param))],
            },
        ),
    ]);
    let mut machine = Machine::new(&unit.module).unwrap();
    let record = initialize_and_run(&mut machine);

    let Some(RtObject::Record { desc, .. }) = machine.object(record).cloned() else {
        panic!("expected a record");
    };
    let Some(RtObject::Descriptor { name, params }) = machine.object(desc).cloned() else {
        panic!("record has no descriptor");
    };
    assert_eq!(name, "Point");
    // Two symbol objects with one name intern to the same runtime symbol.
    let a = machine.record_field(record, 0).unwrap();
    let b = machine.record_field(record, 1).unwrap();
    assert_eq!(a, b);
    assert_eq!(params, vec![b]);
    assert_eq!(machine.object(a), Some(&RtObject::Symbol("T".into())));
}

#[test]
fn test_singletons_are_never_serialized() {
    let nothing = 0x7f0000100500;
    let unit = compile_root(vec![
        (nothing, HeapValue::Singleton(SingletonKind::Nothing)),
        (
            ROOT,
            HeapValue::Record {
                ty: None,
                fields: vec![Field::Ref(Some(nothing))],
            },
        ),
    ]);
    assert!(unit.module.global(unit.module.global_by_name("rt_nothing").unwrap()).is_extern());

    let mut machine = Machine::new(&unit.module).unwrap();
    let record = initialize_and_run(&mut machine);
    let field = machine.record_field(record, 0).unwrap();
    assert_eq!(machine.object(field), Some(&RtObject::Singleton(SingletonKind::Nothing)));
}

#[test]
fn test_raw_array_of_bytes() {
    let unit = compile_root(vec![(
        ROOT,
        HeapValue::RawArray {
            elem: ScalarKind::UInt8,
            dims: vec![2, 3],
            data: vec![1, 2, 3, 4, 5, 6],
        },
    )]);
    let mut machine = Machine::new(&unit.module).unwrap();
    let array = initialize_and_run(&mut machine);
    let Some(RtObject::Array { elem, dims, data, .. }) = machine.object(array).cloned() else {
        panic!("expected an array");
    };
    assert_eq!(elem, Some(ScalarKind::UInt8));
    assert_eq!(dims, vec![2, 3]);
    assert_eq!(machine.read_bytes(data, 6).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    // Header: data pointer, length, rank, dims.
    assert_eq!(machine.read_u64(array + 8).unwrap(), 6);
    assert_eq!(machine.read_u64(array + 16).unwrap(), 2);
}

struct PairEncoder;

impl ExtensionEncoder for PairEncoder {
    fn name(&self) -> &str {
        "pair"
    }

    fn encode(&self, serializer: &mut Serializer<'_>, object: ExtensionObject<'_>) -> CompileResult<Expr> {
        let offset = serializer.blob_mut().write_bytes(object.payload);
        let child = serializer.serialize_child("pair child", object.children[0])?;
        let made = serializer.context_mut().emit_named(
            "host_make_pair",
            vec![Type::PTR, Type::I64, Type::PTR],
            Type::PTR,
            vec![Expr::Blob(offset), Expr::Int(object.payload.len() as i64), child],
        );
        Ok(made.unwrap_or(Expr::Null))
    }
}

#[test]
fn test_registered_extension_encoder() {
    let child = 0x7f0000100600;
    let fe = frontend(vec![
        (child, HeapValue::Scalar(Scalar::Int64(3))),
        (
            ROOT,
            HeapValue::Extension {
                kind: ExtensionKind(7),
                payload: b"pair".to_vec(),
                children: vec![child],
            },
        ),
    ]);

    let arena = Bump::new();
    let mut ctx = CompilationContext::new(&arena);
    ctx.encoders_mut().register(ExtensionKind(7), Box::new(PairEncoder));
    let unit = compile(&ctx, &fe, &EntrySignature::new("main", vec![], Type::PTR)).unwrap();
    assert_eq!(&unit.blob[..4], b"pair");

    let mut machine = Machine::new(&unit.module).unwrap();
    machine.define_host("host_make_pair", Box::new(|args: &[u64]| Ok(0xAB00 + args[1])));
    assert_eq!(initialize_and_run(&mut machine), 0xAB04);
}

#[test]
fn test_unregistered_extension_is_rejected() {
    let fe = frontend(vec![(
        ROOT,
        HeapValue::Extension {
            kind: ExtensionKind(99),
            payload: Vec::new(),
            children: Vec::new(),
        },
    )]);
    let arena = Bump::new();
    let ctx = CompilationContext::new(&arena);
    let err = compile(&ctx, &fe, &EntrySignature::new("main", vec![], Type::PTR))
        .err()
        .unwrap();
    assert!(err.to_string().contains("extension kind 99"), "{err}");
}
