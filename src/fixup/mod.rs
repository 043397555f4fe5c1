// This module turns an IR module whose constants point into a live process into one that only
// refers to link-time symbols and to data carried in the object itself. It runs in two passes.
// The relocation pass looks at foreign calls and global loads whose operand is a constant
// expression chain ending in a literal address, asks the runtime symbol table and then the
// address oracle what lives there, and rewrites runtime-library routines and data into
// external declarations. Addresses that belong to heap objects are left for the global fixup
// pass, which materializes every remaining constant chain into instructions at its point of
// use, serializes each referenced object once, gives it a zero-initialized pointer slot and
// rewrites uses into loads from that slot. Finally it synthesizes the blob, the slot table,
// the deserialization routine and the guarded initializer that populates the slots. Every
// resolution lands in the context's relocation table.

//! Relocation and global fixup passes.

pub mod chain;
pub mod globals;
pub mod materialize;
pub mod relocation;
pub mod routine;

pub use globals::{GlobalFixupOutput, GlobalFixupPass, SlotInfo};
pub use relocation::{RelocationPass, RelocationSummary};
pub use routine::InitializerSymbols;

use std::fmt;

/// How an embedded object is described in the relocation table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobRef {
    /// Offset of the object's payload in the blob.
    Offset(u64),
    /// Construction expression, for objects without a blob payload.
    Expr(String),
}

/// Resolution of one process address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocationEntry {
    ExternalSymbol { name: String },
    EmbeddedObject { slot: String, payload: BlobRef },
}

impl fmt::Display for RelocationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelocationEntry::ExternalSymbol { name } => write!(f, "external {name}"),
            RelocationEntry::EmbeddedObject {
                slot,
                payload: BlobRef::Offset(offset),
            } => write!(f, "embedded {slot} (blob+{offset})"),
            RelocationEntry::EmbeddedObject {
                slot,
                payload: BlobRef::Expr(expr),
            } => write!(f, "embedded {slot} ({expr})"),
        }
    }
}
