//! Textual IR printer.
//!
//! Output is accepted by [`parse_module`](super::parse_module); printing the
//! parsed result again reproduces the same text.

use super::*;
use std::fmt::{self, Write};

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {}", quote(&self.name))?;
        for global in &self.globals {
            write_global(f, self, global)?;
        }
        for function in &self.functions {
            writeln!(f)?;
            write_function(f, self, function)?;
        }
        Ok(())
    }
}

impl Module {
    /// Print a single function in module context.
    pub fn display_function(&self, id: FuncId) -> String {
        let mut out = String::new();
        let _ = write_function(&mut out, self, self.func(id));
        out
    }

    /// Render an operand the way the printer does.
    pub fn display_operand(&self, function: Option<&Function>, op: Operand) -> String {
        let mut out = String::new();
        let _ = write_operand(&mut out, self, function, op);
        out
    }
}

fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for b in text.bytes() {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(out, "\\x{b:02x}");
            }
        }
    }
    out.push('"');
    out
}

fn linkage_prefix(linkage: Linkage) -> &'static str {
    match linkage {
        Linkage::External => "",
        Linkage::Internal => "internal ",
    }
}

fn write_global<W: Write>(w: &mut W, module: &Module, global: &Global) -> fmt::Result {
    match &global.kind {
        GlobalKind::Extern => return writeln!(w, "extern global @{}", global.name),
        GlobalKind::Zeroed { size } => write!(
            w,
            "global {}@{} : zeroed {}",
            linkage_prefix(global.linkage),
            global.name,
            size
        )?,
        GlobalKind::Data {
            bytes,
            readonly,
            relocs,
        } => {
            write!(
                w,
                "global {}@{} : {} x\"",
                linkage_prefix(global.linkage),
                global.name,
                if *readonly { "rodata" } else { "data" }
            )?;
            for b in bytes {
                write!(w, "{b:02x}")?;
            }
            write!(w, "\"")?;
            for reloc in relocs {
                write!(w, " reloc({}, ", reloc.offset)?;
                write_operand(w, module, None, reloc.target)?;
                if reloc.addend != 0 {
                    write!(w, ", {}", reloc.addend)?;
                }
                write!(w, ")")?;
            }
        }
    }
    if global.align != 8 {
        write!(w, " align {}", global.align)?;
    }
    writeln!(w)
}

fn write_signature<W: Write>(w: &mut W, function: &Function, named: bool) -> fmt::Result {
    write!(w, "{}@{}(", linkage_prefix(function.linkage), function.name)?;
    for (idx, param) in function.params.iter().enumerate() {
        if idx > 0 {
            write!(w, ", ")?;
        }
        if named {
            write!(w, "{} %{}", param.ty, param.name)?;
        } else {
            write!(w, "{}", param.ty)?;
        }
    }
    write!(w, ") -> {}", function.ret)?;
    let attrs: Vec<&str> = [
        (function.attrs.dispatch_wrapper, "wrapper"),
        (function.attrs.noinline, "noinline"),
        (function.attrs.generated, "generated"),
    ]
    .iter()
    .filter_map(|&(set, name)| set.then_some(name))
    .collect();
    if !attrs.is_empty() {
        write!(w, " [{}]", attrs.join(", "))?;
    }
    Ok(())
}

fn write_function<W: Write>(w: &mut W, module: &Module, function: &Function) -> fmt::Result {
    if function.is_declaration() {
        write!(w, "declare ")?;
        write_signature(w, function, false)?;
        return writeln!(w);
    }

    write!(w, "define ")?;
    write_signature(w, function, true)?;
    writeln!(w, " {{")?;
    for block in &function.blocks {
        writeln!(w, "{}:", block.name)?;
        for &id in &block.insts {
            write!(w, "    ")?;
            write_inst(w, module, function, id)?;
            writeln!(w)?;
        }
    }
    writeln!(w, "}}")
}

fn write_inst<W: Write>(w: &mut W, module: &Module, function: &Function, id: InstId) -> fmt::Result {
    let inst = function.inst(id);
    if !inst.ty.is_void() {
        write!(w, "%{} = ", function.value_name(id))?;
    }
    let op = |w: &mut W, operand: Operand| write_operand(w, module, Some(function), operand);
    let block = |id: BlockId| &function.block(id).name;

    match &inst.kind {
        InstKind::Binary { op: bin, lhs, rhs } => {
            write!(w, "{} {} ", bin.name(), inst.ty)?;
            op(w, *lhs)?;
            write!(w, ", ")?;
            op(w, *rhs)?;
        }
        InstKind::ICmp { pred, ty, lhs, rhs } => {
            write!(w, "icmp {} {} ", pred.name(), ty)?;
            op(w, *lhs)?;
            write!(w, ", ")?;
            op(w, *rhs)?;
        }
        InstKind::Load { ptr } => {
            write!(w, "load {}, ", inst.ty)?;
            op(w, *ptr)?;
        }
        InstKind::Store { ty, value, ptr } => {
            write!(w, "store {ty} ")?;
            op(w, *value)?;
            write!(w, ", ")?;
            op(w, *ptr)?;
        }
        InstKind::Gep { base, offset } => {
            write!(w, "gep {} ", inst.ty)?;
            op(w, *base)?;
            write!(w, ", ")?;
            op(w, *offset)?;
        }
        InstKind::Cast { op: cast, from, value } => {
            write!(w, "{} {} ", cast.name(), from)?;
            op(w, *value)?;
            write!(w, " to {}", inst.ty)?;
        }
        InstKind::Alloca { size } => write!(w, "alloca {size}")?,
        InstKind::Call { callee, args } => {
            write!(w, "call {} ", inst.ty)?;
            op(w, *callee)?;
            write!(w, "(")?;
            for (idx, (ty, arg)) in args.iter().enumerate() {
                if idx > 0 {
                    write!(w, ", ")?;
                }
                write!(w, "{ty} ")?;
                op(w, *arg)?;
            }
            write!(w, ")")?;
        }
        InstKind::Ret { value: None } => write!(w, "ret void")?,
        InstKind::Ret { value: Some(value) } => {
            write!(w, "ret ")?;
            op(w, *value)?;
        }
        InstKind::Br { target } => write!(w, "br ^{}", block(*target))?,
        InstKind::CondBr {
            cond,
            then_block,
            else_block,
        } => {
            write!(w, "condbr ")?;
            op(w, *cond)?;
            write!(w, ", ^{}, ^{}", block(*then_block), block(*else_block))?;
        }
        InstKind::Unreachable => write!(w, "unreachable")?,
    }

    if let Some(loc) = &inst.loc {
        write!(w, " !loc({}, {})", quote(&loc.file), loc.line)?;
    }
    Ok(())
}

fn write_operand<W: Write>(
    w: &mut W,
    module: &Module,
    function: Option<&Function>,
    op: Operand,
) -> fmt::Result {
    match op {
        Operand::Value(id) => match function {
            Some(func) => write!(w, "%{}", func.value_name(id)),
            None => write!(w, "%{}", id.0),
        },
        Operand::Arg(idx) => match function.and_then(|f| f.params.get(idx as usize)) {
            Some(param) => write!(w, "%{}", param.name),
            None => write!(w, "%arg{idx}"),
        },
        Operand::Int(value) if value >= 0x10000 => write!(w, "{value:#x}"),
        Operand::Int(value) => write!(w, "{value}"),
        Operand::Null => write!(w, "null"),
        Operand::Undef => write!(w, "undef"),
        Operand::Func(id) => write!(w, "@{}", module.func(id).name),
        Operand::Global(id) => write!(w, "@{}", module.global(id).name),
        Operand::Const(id) => {
            let expr = module.consts.get(id);
            write!(w, "{}(", expr.op.name())?;
            for (idx, &child) in expr.operands.iter().enumerate() {
                if idx > 0 {
                    write!(w, ", ")?;
                }
                write_operand(w, module, function, child)?;
            }
            if let ConstOp::AddrSpaceCast(space) = expr.op {
                write!(w, ", {space}")?;
            }
            write!(w, ")")
        }
    }
}
