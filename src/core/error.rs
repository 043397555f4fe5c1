// This module defines error types for the freestand back end using the thiserror crate for
// idiomatic Rust error handling. CompileError is the single error enum every stage returns:
// unsupported constructs (unknown constant-expression opcodes, non-serializable heap
// objects, codegen shapes the x86-64 emitter cannot lower), ambiguous entry points,
// unresolved process addresses, failed external linker invocations, parse errors from the
// textual IR front end, malformed IR detected by the verifier, and object-writer and I/O
// failures. Each variant carries the context needed to act on it, most importantly a
// Location naming the function, block and instruction where the problem was found.
// CompileResult<T> is the convenience alias used throughout the crate.

//! Error types for the freestand compiler.
//!

use std::fmt;
use std::process::ExitStatus;
use thiserror::Error;

use crate::ir::SourceLoc;

/// Where in the IR an error was detected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub function: Option<String>,
    pub block: Option<String>,
    pub inst: Option<usize>,
    pub source: Option<SourceLoc>,
}

impl Location {
    pub fn in_function(function: impl Into<String>) -> Self {
        Self {
            function: Some(function.into()),
            ..Self::default()
        }
    }

    pub fn at(
        function: impl Into<String>,
        block: impl Into<String>,
        inst: usize,
        source: Option<SourceLoc>,
    ) -> Self {
        Self {
            function: Some(function.into()),
            block: Some(block.into()),
            inst: Some(inst),
            source,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(func) => write!(f, "@{func}")?,
            None => write!(f, "<module>")?,
        }
        if let Some(block) = &self.block {
            write!(f, " ^{block}")?;
        }
        if let Some(inst) = self.inst {
            write!(f, " #{inst}")?;
        }
        if let Some(source) = &self.source {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

/// Main error type for freestanding compilation.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Unsupported construct at {location}: {what}")]
    UnsupportedConstruct { what: String, location: Location },

    #[error("Ambiguous entry point '{entry}': {} candidate definitions {candidates:?}", candidates.len())]
    AmbiguousEntryPoint {
        entry: String,
        candidates: Vec<String>,
    },

    #[error("Cannot resolve address {address:#x} at {location}")]
    RelocationResolutionFailure { address: u64, location: Location },

    #[error("Linker '{program}' failed ({status}):\n{stderr}")]
    LinkerInvocation {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("Parse error at {line}:{column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Malformed IR at {location}: {reason}")]
    MalformedIr { reason: String, location: Location },

    #[error("Frontend failed: {reason}")]
    Frontend { reason: String },

    #[error("Code generation failed: {reason}")]
    CodeGeneration { reason: String },

    #[error("Object emission failed: {0}")]
    ObjectWrite(#[from] object::write::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CompileError {
    pub fn unsupported(what: impl Into<String>, location: Location) -> Self {
        CompileError::UnsupportedConstruct {
            what: what.into(),
            location,
        }
    }

    pub fn malformed(reason: impl Into<String>, location: Location) -> Self {
        CompileError::MalformedIr {
            reason: reason.into(),
            location,
        }
    }

    pub fn codegen(reason: impl Into<String>) -> Self {
        CompileError::CodeGeneration {
            reason: reason.into(),
        }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_display() {
        let loc = Location::at(
            "main",
            "entry",
            3,
            Some(SourceLoc {
                file: "main.jl".into(),
                line: 7,
            }),
        );
        assert_eq!(loc.to_string(), "@main ^entry #3 (main.jl:7)");
        assert_eq!(Location::default().to_string(), "<module>");
    }

    #[test]
    fn ambiguous_entry_lists_candidates() {
        let err = CompileError::AmbiguousEntryPoint {
            entry: "f".into(),
            candidates: vec!["f_1".into(), "f_2".into()],
        };
        let text = err.to_string();
        assert!(text.contains("2 candidate"));
        assert!(text.contains("f_1"));
    }
}
