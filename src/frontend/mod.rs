// This module defines the boundary between freestand and the front end that produced the IR.
// The front end is an external capability: it owns type inference and specialization and
// hands over (1) the IR module containing the entry function, (2) on request, the modules
// defining further subroutines the entry transitively calls, (3) a read-only view of the
// compiling process's heap, and (4) an address oracle that names runtime-library symbols.
// The Frontend trait captures those four capabilities; TextualFrontend implements them over
// IR text files that additionally carry `symbol` and `heap` directives, which is how the CLI
// and the integration tests drive the pipeline.

//! Front-end capabilities consumed by the pipeline.

pub mod heap;
pub mod oracle;
pub mod textual;

pub use heap::{
    Address, ExtensionKind, Field, HeapImage, HeapValue, HeapView, Scalar, ScalarKind,
    SingletonKind,
};
pub use oracle::{AddressOracle, SymbolDescriptor, SymbolMap};
pub use textual::TextualFrontend;

use crate::core::error::CompileResult;
use crate::ir::{Module, Type};

/// Name and type of the function to compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySignature {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
}

impl EntrySignature {
    pub fn new(name: impl Into<String>, params: Vec<Type>, ret: Type) -> Self {
        Self {
            name: name.into(),
            params,
            ret,
        }
    }
}

/// The external front end.
pub trait Frontend {
    /// IR module holding the specialized entry function.
    fn entry_module(&self, signature: &EntrySignature) -> CompileResult<Module>;

    /// Modules that define any of `functions`, in a stable order.
    fn subroutine_modules(&self, functions: &[String]) -> CompileResult<Vec<Module>>;

    fn heap(&self) -> &dyn HeapView;

    fn oracle(&self) -> &dyn AddressOracle;
}
