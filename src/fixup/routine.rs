//! Synthesis of the blob global, the slot table, the deserialization routine
//! and the guarded initializer.
//!
//! The initializer is the only exported entry into this machinery:
//!
//! ```text
//! define @<entry>_init() -> void [generated] {
//! entry:
//!     %done = load i64, @<entry>_init_guard
//!     %seen = icmp ne i64 %done, 0
//!     condbr %seen, ^exit, ^run
//! run:
//!     call void @<entry>_deserialize(ptr @<entry>_blob, ptr @<entry>_slot_table)
//!     store i64 1, @<entry>_init_guard
//!     br ^exit
//! exit:
//!     ret
//! }
//! ```
//!
//! The guard is set only once the deserializer has returned, so an
//! initializer that faults part way leaves the guard clear and can run again.

use hashbrown::HashMap;

use super::globals::SlotInfo;
use crate::core::error::{CompileError, CompileResult, Location};
use crate::frontend::SingletonKind;
use crate::ir::{
    DataReloc, Function, FunctionBuilder, Global, GlobalKind, IntPredicate, Linkage, Module,
    Operand, Param, Type,
};
use crate::runtime::abi;
use crate::serialize::{Expr, InitStmt, LocalId};

/// Names of everything the global fixup pass added to the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializerSymbols {
    pub init: String,
    pub deserialize: String,
    pub blob: String,
    pub slot_table: String,
    pub guard: String,
}

impl InitializerSymbols {
    pub fn for_entry(entry: &str) -> Self {
        Self {
            init: format!("{entry}_init"),
            deserialize: format!("{entry}_deserialize"),
            blob: format!("{entry}_blob"),
            slot_table: format!("{entry}_slot_table"),
            guard: format!("{entry}_init_guard"),
        }
    }
}

/// Add the blob, slot table, guard, deserializer and initializer for
/// `entry`. They are created even when nothing was embedded, so the
/// initializer contract holds for every compiled unit.
pub fn synthesize(
    module: &mut Module,
    entry: &str,
    blob: &[u8],
    stmts: &[InitStmt],
    slots: &[SlotInfo],
) -> CompileResult<InitializerSymbols> {
    let names = InitializerSymbols::for_entry(entry);
    for name in [&names.init, &names.deserialize] {
        if module.function_by_name(name).is_some() {
            return Err(CompileError::malformed(
                format!("@{name} is already defined"),
                Location::default(),
            ));
        }
    }

    let blob_global = module.add_global(Global::data(names.blob.as_str(), blob.to_vec(), true));

    let mut table = Global::data(names.slot_table.as_str(), vec![0; slots.len() * 8], false);
    if let GlobalKind::Data { relocs, .. } = &mut table.kind {
        relocs.extend(slots.iter().map(|slot| DataReloc {
            offset: slot.index as u64 * 8,
            target: Operand::Global(slot.global),
            addend: 0,
        }));
    }
    let table_global = module.add_global(table);
    let guard = module.add_global(Global::zeroed(names.guard.as_str(), 8));

    let deserialize = build_deserializer(module, &names.deserialize, stmts, slots)?;
    let deserialize = module.add_function(deserialize);

    let mut init = Function::new(names.init.as_str(), Vec::new(), Type::Void);
    init.attrs.generated = true;
    {
        let mut b = FunctionBuilder::with_entry(&mut init);
        let run = b.add_block("run");
        let exit = b.add_block("exit");
        let done = b.load(Type::I64, Operand::Global(guard));
        let seen = b.icmp(IntPredicate::Ne, Type::I64, done, Operand::Int(0));
        b.cond_br(seen, exit, run);

        b.switch_to(run);
        b.call(
            Type::Void,
            Operand::Func(deserialize),
            vec![
                (Type::PTR, Operand::Global(blob_global)),
                (Type::PTR, Operand::Global(table_global)),
            ],
        );
        b.store(Type::I64, Operand::Int(1), Operand::Global(guard));
        b.br(exit);

        b.switch_to(exit);
        b.ret(None);
    }
    module.add_function(init);

    log::debug!(
        "synthesized @{} over {} statements and {} slots",
        names.init,
        stmts.len(),
        slots.len()
    );
    Ok(names)
}

fn build_deserializer(
    module: &mut Module,
    name: &str,
    stmts: &[InitStmt],
    slots: &[SlotInfo],
) -> CompileResult<Function> {
    let params = vec![
        Param {
            name: "blob".into(),
            ty: Type::PTR,
        },
        Param {
            name: "slots".into(),
            ty: Type::PTR,
        },
    ];
    let mut function = Function::new(name, params, Type::Void);
    function.linkage = Linkage::Internal;
    function.attrs.generated = true;
    function.attrs.noinline = true;

    let mut lowering = ExprLowering {
        locals: HashMap::new(),
        blob_views: HashMap::new(),
        singletons: HashMap::new(),
    };
    let mut b = FunctionBuilder::with_entry(&mut function);

    for stmt in stmts {
        let callee = module.get_or_declare_function(&stmt.routine, &stmt.params, stmt.ret);
        let mut args = Vec::with_capacity(stmt.args.len());
        for (&ty, &arg) in stmt.params.iter().zip(&stmt.args) {
            args.push((ty, lowering.operand(module, &mut b, arg)?));
        }
        let result = b.call(stmt.ret, Operand::Func(callee), args);
        if let Some(local) = stmt.dest {
            lowering.locals.insert(local, result);
        }
    }

    for slot in slots {
        let value = lowering.operand(module, &mut b, slot.root)?;
        let entry = b.gep(Type::PTR, Operand::Arg(1), Operand::Int(slot.index as i64 * 8));
        let target = b.load(Type::PTR, entry);
        b.store(Type::PTR, value, target);
    }
    b.ret(None);

    Ok(function)
}

/// Maps serializer expressions onto operands of the routine being built.
/// Everything is emitted into the single entry block, so earlier values
/// dominate later uses and can be reused.
struct ExprLowering {
    locals: HashMap<LocalId, Operand>,
    blob_views: HashMap<u64, Operand>,
    singletons: HashMap<SingletonKind, Operand>,
}

impl ExprLowering {
    fn operand(&mut self, module: &mut Module, b: &mut FunctionBuilder<'_>, expr: Expr) -> CompileResult<Operand> {
        Ok(match expr {
            Expr::Int(value) => Operand::Int(value),
            Expr::Null => Operand::Null,
            Expr::Local(local) => *self.locals.get(&local).ok_or_else(|| {
                CompileError::malformed(
                    format!("initializer uses {expr} before it is defined"),
                    Location::in_function(b.function().name.clone()),
                )
            })?,
            Expr::Blob(offset) => *self
                .blob_views
                .entry(offset)
                .or_insert_with(|| b.gep(Type::PTR, Operand::Arg(0), Operand::Int(offset as i64))),
            Expr::Singleton(kind) => *self.singletons.entry(kind).or_insert_with(|| {
                let global = module.get_or_declare_global(abi::singleton_global(kind));
                b.load(Type::PTR, Operand::Global(global))
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GlobalId, InstKind};
    use crate::runtime::abi::Routine;
    use crate::serialize::SerializeContext;

    #[test]
    fn initializer_is_guarded() {
        let mut module = Module::new("m");
        let names = synthesize(&mut module, "main", &[], &[], &[]).unwrap();
        assert_eq!(names.guard, "main_init_guard");

        let init = module.func(module.function_by_name("main_init").unwrap());
        assert_eq!(init.linkage, Linkage::External);
        assert_eq!(init.blocks.len(), 3);
        let entry_ops: Vec<_> = init.blocks[0]
            .insts
            .iter()
            .map(|&id| init.inst(id).opcode())
            .collect();
        assert_eq!(entry_ops, vec!["load", "icmp", "condbr"]);
        let run_ops: Vec<_> = init.blocks[1]
            .insts
            .iter()
            .map(|&id| init.inst(id).opcode())
            .collect();
        assert_eq!(run_ops, vec!["call", "store", "br"]);

        let table = module.global(module.global_by_name("main_slot_table").unwrap());
        assert!(matches!(&table.kind, GlobalKind::Data { bytes, .. } if bytes.is_empty()));
    }

    #[test]
    fn deserializer_replays_statements_then_fills_slots() {
        let mut ctx = SerializeContext::new();
        let offset = ctx.blob.write_bytes(b"hi");
        let text = ctx
            .emit(Routine::TextView, vec![Expr::Blob(offset), Expr::Int(2)])
            .unwrap();
        let (blob, stmts) = ctx.into_parts();

        let mut module = Module::new("m");
        let slot = module.add_global(Global::zeroed("main_slot0", 8));
        let slots = vec![
            SlotInfo {
                index: 0,
                address: 0x7f0000100000,
                name: "main_slot0".into(),
                global: slot,
                root: text,
            },
            SlotInfo {
                index: 1,
                address: 0x7f0000100040,
                name: "main_slot1".into(),
                global: GlobalId(0),
                root: Expr::Singleton(SingletonKind::Nothing),
            },
        ];
        synthesize(&mut module, "main", blob.as_bytes(), &stmts, &slots).unwrap();

        let deserialize = module.func(module.function_by_name("main_deserialize").unwrap());
        let ops: Vec<_> = deserialize
            .placed_insts()
            .map(|(_, id)| deserialize.inst(id).opcode())
            .collect();
        assert_eq!(
            ops,
            vec![
                "gep", "call", // text view
                "gep", "load", "store", // slot 0
                "load", "gep", "load", "store", // singleton into slot 1
                "ret",
            ]
        );
        assert!(module.function_by_name("rt_text_view").is_some());
        assert!(module.global_by_name("rt_nothing").is_some());

        let table = module.global(module.global_by_name("main_slot_table").unwrap());
        let GlobalKind::Data { relocs, readonly, .. } = &table.kind else {
            panic!("slot table must be data");
        };
        assert!(!readonly);
        assert_eq!(relocs.len(), 2);
        assert_eq!(relocs[1].offset, 8);

        let init = module.func(module.function_by_name("main_init").unwrap());
        let calls: Vec<_> = init
            .placed_insts()
            .filter(|&(_, id)| matches!(init.inst(id).kind, InstKind::Call { .. }))
            .collect();
        assert_eq!(calls.len(), 1);
    }
}
