// This module is the reference runtime: an evaluator that executes IR modules against a
// simulated 64-bit address space and implements the runtime library ABI the compiled output
// links against. It exists so generated code can be checked end to end without a native
// toolchain: the tests compile a unit, load its final IR here, call `<entry>_init` and the entry
// function, and then inspect the objects the reconstruction primitives built. Memory is a set of
// disjoint regions keyed by base address; every access is bounds-checked and a stray pointer is
// reported as a fault rather than silently read. Runtime objects live in that memory (so
// generated code can load their fields) and are described by a side table that the tests read.
// Functions have synthetic addresses so indirect calls work; routines declared but not defined
// in the module are dispatched by name to the built-in runtime or to host functions registered
// by the caller.

//! Reference runtime and IR evaluator.

use std::collections::BTreeMap;

use thiserror::Error;

use super::abi::{singleton_global, Routine, TASK_STATE};
use crate::frontend::{Scalar, ScalarKind, SingletonKind};
use crate::ir::{BinOp, BlockId, CastOp, FuncId, Function, GlobalId, GlobalKind, InstKind, Module, Operand, Type};

/// Errors raised while executing IR.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MachineError {
    #[error("memory fault accessing {len} bytes at {address:#x}")]
    Fault { address: u64, len: u64 },

    #[error("rt_throw({value:#x})")]
    Thrown { value: u64 },

    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(u64),

    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),

    #[error("step limit of {0} instructions exceeded")]
    StepLimit(u64),

    #[error("bad call: {0}")]
    BadCall(String),

    #[error("reached unreachable in @{0}")]
    Trap(String),

    #[error("cannot execute: {0}")]
    Unsupported(String),
}

pub type MachineResult<T> = Result<T, MachineError>;

/// A host function callable from IR by name.
pub type HostFn = Box<dyn Fn(&[u64]) -> MachineResult<u64>>;

/// An object built by a runtime primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtObject {
    /// `rt_box`; memory holds the bits.
    Boxed { kind: ScalarKind, bits: u64 },
    /// `rt_text_view`; memory holds `[data, len]`.
    Text { data: u64, len: u64 },
    /// `rt_adopt_array` (`elem` is the scalar kind) or `rt_new_array`
    /// (`elem_type` is the element descriptor); memory holds
    /// `[data, len, ndims, dims...]`.
    Array {
        elem: Option<ScalarKind>,
        elem_type: u64,
        dims: Vec<u64>,
        data: u64,
    },
    /// `rt_new_record`; memory holds one 8-byte word per field.
    Record { desc: u64, nfields: u64, refmask: u64 },
    Descriptor { name: String, params: Vec<u64> },
    Symbol(String),
    Singleton(SingletonKind),
    TaskState,
}

const HEAP_BASE: u64 = 0x1000_0000;
const FUNC_BASE: u64 = 0xF000_0000_0000;
const FUNC_STRIDE: u64 = 16;
/// Largest single allocation the machine accepts.
const MAX_ALLOCATION: u64 = 1 << 30;
const DEFAULT_STEP_LIMIT: u64 = 1_000_000;

fn mask(value: u64, bits: u32) -> u64 {
    if bits >= 64 {
        value
    } else {
        value & ((1u64 << bits) - 1)
    }
}

fn sign_extend(value: u64, bits: u32) -> u64 {
    if bits >= 64 || bits == 0 {
        value
    } else {
        let shift = 64 - bits;
        (((value << shift) as i64) >> shift) as u64
    }
}

fn width(ty: Type) -> u32 {
    match ty {
        Type::Int(bits) => bits as u32,
        _ => 64,
    }
}

/// Disjoint regions of a flat address space.
#[derive(Debug, Default)]
struct Memory {
    regions: BTreeMap<u64, Vec<u8>>,
    next: u64,
}

impl Memory {
    fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            next: HEAP_BASE,
        }
    }

    fn alloc(&mut self, size: u64) -> MachineResult<u64> {
        if size > MAX_ALLOCATION {
            return Err(MachineError::OutOfMemory(size));
        }
        let base = self.next;
        // Leave a gap so running off the end of one region faults.
        self.next += size.max(1).div_ceil(16) * 16 + 16;
        self.regions.insert(base, vec![0; size as usize]);
        Ok(base)
    }

    fn free(&mut self, base: u64) {
        self.regions.remove(&base);
    }

    fn span(&self, address: u64, len: u64) -> MachineResult<(u64, usize)> {
        let fault = MachineError::Fault { address, len };
        let (&base, region) = self.regions.range(..=address).next_back().ok_or(fault.clone())?;
        let start = address - base;
        if start.checked_add(len).is_some_and(|end| end <= region.len() as u64) {
            Ok((base, start as usize))
        } else {
            Err(fault)
        }
    }

    fn read_bytes(&self, address: u64, len: u64) -> MachineResult<&[u8]> {
        let (base, start) = self.span(address, len)?;
        Ok(&self.regions[&base][start..start + len as usize])
    }

    fn write_bytes(&mut self, address: u64, bytes: &[u8]) -> MachineResult<()> {
        let (base, start) = self.span(address, bytes.len() as u64)?;
        let region = self
            .regions
            .get_mut(&base)
            .ok_or(MachineError::Fault { address, len: bytes.len() as u64 })?;
        region[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, address: u64, len: u64) -> MachineResult<u64> {
        let bytes = self.read_bytes(address, len)?;
        let mut word = [0u8; 8];
        word[..bytes.len()].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(word))
    }

    fn write(&mut self, address: u64, len: u64, value: u64) -> MachineResult<()> {
        self.write_bytes(address, &value.to_le_bytes()[..len as usize])
    }
}

/// Executes one module.
pub struct Machine<'m> {
    module: &'m Module,
    memory: Memory,
    /// Address of each defined global; externs resolve by name on use.
    globals: Vec<Option<u64>>,
    objects: BTreeMap<u64, RtObject>,
    /// Cell holding the object pointer of each singleton, by global name.
    singleton_cells: BTreeMap<&'static str, u64>,
    interned: BTreeMap<String, u64>,
    task_state: u64,
    hosts: BTreeMap<String, HostFn>,
    runtime_calls: Vec<String>,
    steps: u64,
    step_limit: u64,
}

impl<'m> Machine<'m> {
    /// Lay out the module's globals and the runtime's singletons.
    pub fn new(module: &'m Module) -> MachineResult<Self> {
        let mut machine = Self {
            module,
            memory: Memory::new(),
            globals: Vec::with_capacity(module.globals.len()),
            objects: BTreeMap::new(),
            singleton_cells: BTreeMap::new(),
            interned: BTreeMap::new(),
            task_state: 0,
            hosts: BTreeMap::new(),
            runtime_calls: Vec::new(),
            steps: 0,
            step_limit: DEFAULT_STEP_LIMIT,
        };

        for kind in SingletonKind::ALL {
            let object = machine.memory.alloc(8)?;
            machine.objects.insert(object, RtObject::Singleton(kind));
            let cell = machine.memory.alloc(8)?;
            machine.memory.write(cell, 8, object)?;
            machine.singleton_cells.insert(singleton_global(kind), cell);
        }
        machine.task_state = machine.memory.alloc(64)?;
        machine.objects.insert(machine.task_state, RtObject::TaskState);

        for global in &module.globals {
            let address = match &global.kind {
                GlobalKind::Extern => None,
                GlobalKind::Zeroed { size } => Some(machine.memory.alloc(*size)?),
                GlobalKind::Data { bytes, .. } => {
                    let base = machine.memory.alloc(bytes.len() as u64)?;
                    machine.memory.write_bytes(base, bytes)?;
                    Some(base)
                }
            };
            machine.globals.push(address);
        }
        for (idx, global) in module.globals.iter().enumerate() {
            if let GlobalKind::Data { relocs, .. } = &global.kind {
                let base = machine.global_address(GlobalId::new(idx))?;
                for reloc in relocs {
                    let target = machine.symbol_address(reloc.target)?;
                    machine
                        .memory
                        .write(base + reloc.offset, 8, target.wrapping_add(reloc.addend as u64))?;
                }
            }
        }
        log::debug!(
            "machine: {} globals, {} functions loaded",
            module.globals.len(),
            module.functions.len()
        );
        Ok(machine)
    }

    /// Make `name` callable from IR when the module only declares it.
    pub fn define_host(&mut self, name: impl Into<String>, function: HostFn) {
        self.hosts.insert(name.into(), function);
    }

    pub fn set_step_limit(&mut self, limit: u64) {
        self.step_limit = limit;
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Names of runtime routines called so far, in order.
    pub fn runtime_calls(&self) -> &[String] {
        &self.runtime_calls
    }

    pub fn object(&self, address: u64) -> Option<&RtObject> {
        self.objects.get(&address)
    }

    pub fn objects(&self) -> impl Iterator<Item = (u64, &RtObject)> {
        self.objects.iter().map(|(&a, o)| (a, o))
    }

    pub fn read_u64(&self, address: u64) -> MachineResult<u64> {
        self.memory.read(address, 8)
    }

    pub fn read_bytes(&self, address: u64, len: u64) -> MachineResult<Vec<u8>> {
        Ok(self.memory.read_bytes(address, len)?.to_vec())
    }

    /// Address of the global named `name`.
    pub fn global(&self, name: &str) -> MachineResult<u64> {
        let id = self
            .module
            .global_by_name(name)
            .ok_or_else(|| MachineError::UnknownSymbol(name.to_string()))?;
        self.global_address(id)
    }

    /// The 8-byte value stored in the global named `name`.
    pub fn load_global(&self, name: &str) -> MachineResult<u64> {
        self.read_u64(self.global(name)?)
    }

    /// Scalar held by a boxed object.
    pub fn scalar(&self, address: u64) -> Option<Scalar> {
        match self.objects.get(&address)? {
            RtObject::Boxed { kind, bits } => Scalar::from_bits(*kind, *bits),
            _ => None,
        }
    }

    /// Contents of a text view.
    pub fn text(&self, address: u64) -> MachineResult<String> {
        match self.objects.get(&address) {
            Some(RtObject::Text { data, len }) => {
                Ok(String::from_utf8_lossy(self.memory.read_bytes(*data, *len)?).into_owned())
            }
            _ => Err(MachineError::BadCall(format!("{address:#x} is not a text view"))),
        }
    }

    /// Word `index` of a record.
    pub fn record_field(&self, address: u64, index: u64) -> MachineResult<u64> {
        match self.objects.get(&address) {
            Some(RtObject::Record { nfields, .. }) if index < *nfields => self.read_u64(address + index * 8),
            _ => Err(MachineError::BadCall(format!("{address:#x} has no field {index}"))),
        }
    }

    fn global_address(&self, id: GlobalId) -> MachineResult<u64> {
        if let Some(address) = self.globals.get(id.index()).copied().flatten() {
            return Ok(address);
        }
        let name = self.module.global(id).name.as_str();
        self.singleton_cells
            .get(name)
            .copied()
            .ok_or_else(|| MachineError::UnknownSymbol(name.to_string()))
    }

    fn symbol_address(&self, op: Operand) -> MachineResult<u64> {
        match op {
            Operand::Func(f) => Ok(FUNC_BASE + f.index() as u64 * FUNC_STRIDE),
            Operand::Global(g) => self.global_address(g),
            other => Err(MachineError::Unsupported(format!("{other:?} is not a symbol"))),
        }
    }

    fn function_at(&self, address: u64) -> MachineResult<FuncId> {
        let offset = address.wrapping_sub(FUNC_BASE);
        let index = offset / FUNC_STRIDE;
        if address < FUNC_BASE || offset % FUNC_STRIDE != 0 || index >= self.module.functions.len() as u64 {
            return Err(MachineError::BadCall(format!("call to non-function address {address:#x}")));
        }
        Ok(FuncId::new(index as usize))
    }

    /// Call the function named `name`.
    pub fn call(&mut self, name: &str, args: &[u64]) -> MachineResult<u64> {
        match self.module.function_by_name(name) {
            Some(id) => self.call_function(id, args),
            None => self.call_external(name, args),
        }
    }

    fn call_function(&mut self, id: FuncId, args: &[u64]) -> MachineResult<u64> {
        let module = self.module;
        let function = module.func(id);
        if function.is_declaration() {
            return self.call_external(&function.name, args);
        }
        if args.len() != function.params.len() {
            return Err(MachineError::BadCall(format!(
                "@{} takes {} arguments, got {}",
                function.name,
                function.params.len(),
                args.len()
            )));
        }
        let args: Vec<u64> = args
            .iter()
            .zip(&function.params)
            .map(|(&value, param)| mask(value, width(param.ty)))
            .collect();

        let mut allocas = Vec::new();
        let result = self.run_body(function, &args, &mut allocas);
        for base in allocas {
            self.memory.free(base);
        }
        result
    }

    fn run_body(&mut self, function: &'m Function, args: &[u64], allocas: &mut Vec<u64>) -> MachineResult<u64> {
        let mut values = vec![0u64; function.insts.len()];
        let mut block = BlockId::new(0);
        loop {
            let mut next = None;
            for &id in &function.block(block).insts {
                self.steps += 1;
                if self.steps > self.step_limit {
                    return Err(MachineError::StepLimit(self.step_limit));
                }
                let inst = function.inst(id);
                let eval = |machine: &Self, op: Operand, ty: Type| machine.eval(&values, args, op, ty);
                let result = match &inst.kind {
                    InstKind::Binary { op, lhs, rhs } => {
                        if inst.ty == Type::F64 {
                            return Err(MachineError::Unsupported(format!("floating-point {}", op.name())));
                        }
                        let bits = width(inst.ty);
                        let l = eval(self, *lhs, inst.ty)?;
                        let r = eval(self, *rhs, inst.ty)?;
                        let value = match op {
                            BinOp::Add => l.wrapping_add(r),
                            BinOp::Sub => l.wrapping_sub(r),
                            BinOp::Mul => l.wrapping_mul(r),
                            BinOp::And => l & r,
                            BinOp::Or => l | r,
                            BinOp::Xor => l ^ r,
                            BinOp::Shl => l << (r & 63),
                            BinOp::LShr => l >> (r & 63),
                            BinOp::AShr => ((sign_extend(l, bits) as i64) >> (r & 63)) as u64,
                        };
                        mask(value, bits)
                    }
                    InstKind::ICmp { pred, ty, lhs, rhs } => {
                        let bits = width(*ty);
                        let l = eval(self, *lhs, *ty)?;
                        let r = eval(self, *rhs, *ty)?;
                        let (sl, sr) = (sign_extend(l, bits) as i64, sign_extend(r, bits) as i64);
                        use crate::ir::IntPredicate::*;
                        let holds = match pred {
                            Eq => l == r,
                            Ne => l != r,
                            Slt => sl < sr,
                            Sle => sl <= sr,
                            Sgt => sl > sr,
                            Sge => sl >= sr,
                            Ult => l < r,
                            Ule => l <= r,
                            Ugt => l > r,
                            Uge => l >= r,
                        };
                        holds as u64
                    }
                    InstKind::Load { ptr } => {
                        let address = eval(self, *ptr, Type::PTR)?;
                        mask(self.memory.read(address, u64::from(inst.ty.store_size()))?, width(inst.ty))
                    }
                    InstKind::Store { ty, value, ptr } => {
                        let value = eval(self, *value, *ty)?;
                        let address = eval(self, *ptr, Type::PTR)?;
                        self.memory.write(address, u64::from(ty.store_size()), value)?;
                        0
                    }
                    InstKind::Gep { base, offset } => {
                        eval(self, *base, Type::PTR)?.wrapping_add(eval(self, *offset, Type::I64)?)
                    }
                    InstKind::Cast { op, from, value } => {
                        let mut value = eval(self, *value, *from)?;
                        if *op == CastOp::SExt {
                            value = sign_extend(value, width(*from));
                        }
                        mask(value, width(inst.ty))
                    }
                    InstKind::Alloca { size } => {
                        let base = self.memory.alloc(u64::from(*size))?;
                        allocas.push(base);
                        base
                    }
                    InstKind::Call { callee, args: call_args } => {
                        let target = eval(self, *callee, Type::PTR)?;
                        let mut actual = Vec::with_capacity(call_args.len());
                        for (ty, arg) in call_args {
                            actual.push(eval(self, *arg, *ty)?);
                        }
                        let callee = self.function_at(target)?;
                        mask(self.call_function(callee, &actual)?, width(inst.ty))
                    }
                    InstKind::Ret { value } => {
                        return match value {
                            Some(value) => eval(self, *value, function.ret),
                            None => Ok(0),
                        };
                    }
                    InstKind::Br { target } => {
                        next = Some(*target);
                        0
                    }
                    InstKind::CondBr {
                        cond,
                        then_block,
                        else_block,
                    } => {
                        let taken = eval(self, *cond, Type::I1)? != 0;
                        next = Some(if taken { *then_block } else { *else_block });
                        0
                    }
                    InstKind::Unreachable => return Err(MachineError::Trap(function.name.clone())),
                };
                values[id.index()] = result;
            }
            block = next.ok_or_else(|| {
                MachineError::Unsupported(format!(
                    "block ^{} of @{} has no terminator",
                    function.block(block).name,
                    function.name
                ))
            })?;
        }
    }

    fn eval(&self, values: &[u64], args: &[u64], op: Operand, ty: Type) -> MachineResult<u64> {
        match op {
            Operand::Value(v) => Ok(values[v.index()]),
            Operand::Arg(a) => args
                .get(a as usize)
                .copied()
                .ok_or_else(|| MachineError::BadCall(format!("argument {a} out of range"))),
            Operand::Int(value) => Ok(mask(value as u64, width(ty))),
            Operand::Null | Operand::Undef => Ok(0),
            Operand::Func(_) | Operand::Global(_) => self.symbol_address(op),
            Operand::Const(_) => Err(MachineError::Unsupported("constant expression".into())),
        }
    }

    fn call_external(&mut self, name: &str, args: &[u64]) -> MachineResult<u64> {
        self.runtime_calls.push(name.to_string());
        if let Some(routine) = Routine::from_name(name) {
            if args.len() != routine.params().len() {
                return Err(MachineError::BadCall(format!(
                    "{name} takes {} arguments, got {}",
                    routine.params().len(),
                    args.len()
                )));
            }
            return self.run_routine(routine, args);
        }
        if name == TASK_STATE {
            return Ok(self.task_state);
        }
        match self.hosts.get(name) {
            Some(host) => host(args),
            None => Err(MachineError::UnknownSymbol(name.to_string())),
        }
    }

    fn read_string(&self, data: u64, len: u64) -> MachineResult<String> {
        Ok(String::from_utf8_lossy(self.memory.read_bytes(data, len)?).into_owned())
    }

    fn read_dims(&self, dims: u64, ndims: u64) -> MachineResult<Vec<u64>> {
        (0..ndims).map(|i| self.memory.read(dims + i * 8, 8)).collect()
    }

    fn new_object(&mut self, size: u64, object: RtObject) -> MachineResult<u64> {
        let address = self.memory.alloc(size)?;
        self.objects.insert(address, object);
        Ok(address)
    }

    fn array_header(data: u64, dims: &[u64]) -> Vec<u8> {
        let len: u64 = dims.iter().product();
        let mut header = Vec::with_capacity(24 + dims.len() * 8);
        for word in [data, len, dims.len() as u64].iter().chain(dims) {
            header.extend_from_slice(&word.to_le_bytes());
        }
        header
    }

    fn run_routine(&mut self, routine: Routine, args: &[u64]) -> MachineResult<u64> {
        match routine {
            Routine::Throw => Err(MachineError::Thrown { value: args[0] }),
            Routine::Alloc => self.memory.alloc(args[0]),
            Routine::ReportOom => Err(MachineError::OutOfMemory(args[0])),
            Routine::Box => {
                let kind = ScalarKind::from_code(args[0] as i64)
                    .ok_or_else(|| MachineError::BadCall(format!("rt_box: unknown kind {}", args[0])))?;
                let bits = args[1];
                let address = self.new_object(8, RtObject::Boxed { kind, bits })?;
                self.memory.write(address, 8, bits)?;
                Ok(address)
            }
            Routine::TextView => {
                let (data, len) = (args[0], args[1]);
                self.memory.read_bytes(data, len)?;
                let address = self.new_object(16, RtObject::Text { data, len })?;
                self.memory.write(address, 8, data)?;
                self.memory.write(address + 8, 8, len)?;
                Ok(address)
            }
            Routine::AdoptArray => {
                let (data, code, dims, ndims) = (args[0], args[1], args[2], args[3]);
                let kind = ScalarKind::from_code(code as i64)
                    .ok_or_else(|| MachineError::BadCall(format!("rt_adopt_array: unknown kind {code}")))?;
                let dims = self.read_dims(dims, ndims)?;
                let len: u64 = dims.iter().product();
                self.memory.read_bytes(data, len * kind.size() as u64)?;
                let header = Self::array_header(data, &dims);
                let address = self.new_object(
                    header.len() as u64,
                    RtObject::Array {
                        elem: Some(kind),
                        elem_type: 0,
                        dims,
                        data,
                    },
                )?;
                self.memory.write_bytes(address, &header)?;
                Ok(address)
            }
            Routine::NewArray => {
                let (elem_type, dims, ndims) = (args[0], args[1], args[2]);
                let dims = self.read_dims(dims, ndims)?;
                let len: u64 = dims.iter().product();
                let data = self.memory.alloc(len * 8)?;
                let header = Self::array_header(data, &dims);
                let address = self.new_object(
                    header.len() as u64,
                    RtObject::Array {
                        elem: None,
                        elem_type,
                        dims,
                        data,
                    },
                )?;
                self.memory.write_bytes(address, &header)?;
                Ok(address)
            }
            Routine::ArraySet => {
                let (array, index, value) = (args[0], args[1], args[2]);
                let Some(RtObject::Array { elem: None, dims, data, .. }) = self.objects.get(&array) else {
                    return Err(MachineError::BadCall(format!("rt_array_set: {array:#x} is not a boxed array")));
                };
                let len: u64 = dims.iter().product();
                if index >= len {
                    return Err(MachineError::BadCall(format!("rt_array_set: index {index} of {len}")));
                }
                let slot = data + index * 8;
                self.memory.write(slot, 8, value)?;
                Ok(0)
            }
            Routine::NewRecord => {
                let (desc, image, nfields, refmask) = (args[0], args[1], args[2], args[3]);
                let bytes = self.memory.read_bytes(image, nfields * 8)?.to_vec();
                let address = self.new_object(
                    (nfields * 8).max(8),
                    RtObject::Record {
                        desc,
                        nfields,
                        refmask,
                    },
                )?;
                self.memory.write_bytes(address, &bytes)?;
                Ok(address)
            }
            Routine::RecordSet => {
                let (record, field, value) = (args[0], args[1], args[2]);
                match self.objects.get(&record) {
                    Some(RtObject::Record { nfields, refmask, .. })
                        if field < *nfields && field < 64 && refmask & (1 << field) != 0 => {}
                    _ => {
                        return Err(MachineError::BadCall(format!(
                            "rt_record_set: {record:#x} has no reference field {field}"
                        )))
                    }
                }
                self.memory.write(record + field * 8, 8, value)?;
                Ok(0)
            }
            Routine::NewDescriptor => {
                let name = self.read_string(args[0], args[1])?;
                let params = vec![0; args[2] as usize];
                self.new_object(8, RtObject::Descriptor { name, params })
            }
            Routine::DescriptorSetParam => {
                let (desc, index, param) = (args[0], args[1], args[2]);
                match self.objects.get_mut(&desc) {
                    Some(RtObject::Descriptor { params, .. }) if (index as usize) < params.len() => {
                        params[index as usize] = param;
                        Ok(0)
                    }
                    _ => Err(MachineError::BadCall(format!(
                        "rt_descriptor_set_param: {desc:#x} has no parameter {index}"
                    ))),
                }
            }
            Routine::InternSymbol => {
                let name = self.read_string(args[0], args[1])?;
                if let Some(&address) = self.interned.get(&name) {
                    return Ok(address);
                }
                let address = self.new_object(8, RtObject::Symbol(name.clone()))?;
                self.interned.insert(name, address);
                Ok(address)
            }
        }
    }
}
