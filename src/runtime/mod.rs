//! The runtime side of compiled output.
//!
//! `abi` names the routines and data symbols generated code links against.
//! `machine` is a reference implementation of that ABI together with an IR
//! evaluator, used to execute initializers without a native toolchain.

pub mod abi;
pub mod machine;

pub use abi::{singleton_global, Routine, TASK_STATE};
pub use machine::{HostFn, Machine, MachineError, MachineResult, RtObject};
