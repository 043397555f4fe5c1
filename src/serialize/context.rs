//! Serialization state: the blob, the identity memo and the ordered list of
//! initializer statements the deserialization routine will execute.

use std::fmt;

use crate::frontend::{Address, SingletonKind};
use crate::ir::Type;
use crate::runtime::abi::{self, Routine};

/// Alignment of every payload written to the blob.
pub const BLOB_ALIGN: u64 = 8;

/// One append to the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobWrite {
    pub offset: u64,
    pub len: u64,
    /// Raw byte payload (text, array elements) rather than 64-bit words.
    pub bytes: bool,
}

/// Append-only byte buffer that becomes the read-only blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blob {
    data: Vec<u8>,
    writes: Vec<BlobWrite>,
}

impl Blob {
    pub fn new() -> Self {
        Self::default()
    }

    fn align(&mut self) {
        let padded = (self.data.len() as u64).next_multiple_of(BLOB_ALIGN);
        self.data.resize(padded as usize, 0);
    }

    /// Append raw bytes at the next aligned offset.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> u64 {
        self.align();
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(bytes);
        self.writes.push(BlobWrite {
            offset,
            len: bytes.len() as u64,
            bytes: true,
        });
        offset
    }

    /// Append little-endian 64-bit words at the next aligned offset.
    pub fn write_words(&mut self, words: &[u64]) -> u64 {
        self.align();
        let offset = self.data.len() as u64;
        for word in words {
            self.data.extend_from_slice(&word.to_le_bytes());
        }
        self.writes.push(BlobWrite {
            offset,
            len: words.len() as u64 * 8,
            bytes: false,
        });
        offset
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Every write in order, for alignment checks and reports.
    pub fn writes(&self) -> &[BlobWrite] {
        &self.writes
    }
}

/// Result of an earlier initializer statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

/// A value the deserialization routine can compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expr {
    Local(LocalId),
    /// Blob base plus offset.
    Blob(u64),
    Int(i64),
    Null,
    /// Value of a runtime singleton global.
    Singleton(SingletonKind),
}

impl Expr {
    /// IR type of the value.
    pub fn ty(self) -> Type {
        match self {
            Expr::Int(_) => Type::I64,
            _ => Type::PTR,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Local(LocalId(id)) => write!(f, "%t{id}"),
            Expr::Blob(offset) => write!(f, "blob+{offset}"),
            Expr::Int(value) => write!(f, "{value}"),
            Expr::Null => write!(f, "null"),
            Expr::Singleton(kind) => write!(f, "@{}", abi::singleton_global(*kind)),
        }
    }
}

/// One call in the deserialization routine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitStmt {
    pub dest: Option<LocalId>,
    pub routine: String,
    pub params: Vec<Type>,
    pub ret: Type,
    pub args: Vec<Expr>,
}

impl fmt::Display for InitStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(LocalId(id)) = self.dest {
            write!(f, "%t{id} = ")?;
        }
        write!(f, "{}(", self.routine)?;
        for (idx, arg) in self.args.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ")")
    }
}

/// Memo state of one object identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Memo {
    Done(Expr),
    /// Being serialized and not yet constructible; reaching it again is a
    /// cycle that cannot be broken.
    InProgress,
}

/// Blob, identity memo and initializer statements of one compilation unit.
#[derive(Debug, Default)]
pub struct SerializeContext {
    pub blob: Blob,
    memo: hashbrown::HashMap<Address, Memo>,
    stmts: Vec<InitStmt>,
    /// First blob offset written for each object.
    payloads: hashbrown::HashMap<Address, u64>,
    next_local: u32,
}

impl SerializeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memo(&self, address: Address) -> Option<Memo> {
        self.memo.get(&address).copied()
    }

    pub fn set_memo(&mut self, address: Address, memo: Memo) {
        self.memo.insert(address, memo);
    }

    pub fn note_payload(&mut self, address: Address, offset: u64) {
        self.payloads.entry(address).or_insert(offset);
    }

    pub fn payload_offset(&self, address: Address) -> Option<u64> {
        self.payloads.get(&address).copied()
    }

    /// Append a call to a runtime routine.
    pub fn emit(&mut self, routine: Routine, args: Vec<Expr>) -> Option<Expr> {
        self.emit_named(routine.name(), routine.params().to_vec(), routine.ret(), args)
    }

    /// Append a call to any routine; it yields a local when `ret` is not void.
    pub fn emit_named(
        &mut self,
        routine: &str,
        params: Vec<Type>,
        ret: Type,
        args: Vec<Expr>,
    ) -> Option<Expr> {
        let dest = (!ret.is_void()).then(|| {
            let id = LocalId(self.next_local);
            self.next_local += 1;
            id
        });
        let stmt = InitStmt {
            dest,
            routine: routine.to_string(),
            params,
            ret,
            args,
        };
        log::trace!("init: {stmt}");
        self.stmts.push(stmt);
        dest.map(Expr::Local)
    }

    pub fn stmts(&self) -> &[InitStmt] {
        &self.stmts
    }

    /// The statement that defines `local`.
    pub fn defining_stmt(&self, local: LocalId) -> Option<&InitStmt> {
        self.stmts.iter().find(|s| s.dest == Some(local))
    }

    pub fn local_count(&self) -> u32 {
        self.next_local
    }

    pub fn into_parts(self) -> (Blob, Vec<InitStmt>) {
        (self.blob, self.stmts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_are_aligned() {
        let mut blob = Blob::new();
        assert_eq!(blob.write_bytes(b"abc"), 0);
        assert_eq!(blob.write_words(&[1, 2]), 8);
        assert_eq!(blob.write_bytes(b"x"), 24);
        assert_eq!(blob.len(), 25);
        assert!(blob.writes().iter().all(|w| w.offset % BLOB_ALIGN == 0));
        assert_eq!(&blob.as_bytes()[8..16], &1u64.to_le_bytes());
    }

    #[test]
    fn void_routines_have_no_destination() {
        let mut ctx = SerializeContext::new();
        let boxed = ctx.emit(Routine::Box, vec![Expr::Int(4), Expr::Int(7)]);
        assert_eq!(boxed, Some(Expr::Local(LocalId(0))));
        let set = ctx.emit(
            Routine::RecordSet,
            vec![Expr::Local(LocalId(0)), Expr::Int(0), Expr::Null],
        );
        assert_eq!(set, None);
        assert_eq!(ctx.stmts()[0].to_string(), "%t0 = rt_box(4, 7)");
        assert_eq!(ctx.local_count(), 1);
    }
}
