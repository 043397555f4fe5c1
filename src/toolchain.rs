//! External linker invocation.
//!
//! The object produced by the pipeline is handed to a system linker driver as
//! one blocking subprocess call. There is no timeout and no retry; a failing
//! linker surfaces as [`CompileError::LinkerInvocation`] with its stderr kept
//! verbatim.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::core::error::{CompileError, CompileResult};

/// A configured linker command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalLinker {
    program: String,
    args: Vec<String>,
}

impl Default for ExternalLinker {
    /// `cc -shared`
    fn default() -> Self {
        Self {
            program: "cc".to_string(),
            args: vec!["-shared".to_string()],
        }
    }
}

impl ExternalLinker {
    /// A linker running `program` with no leading arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments passed for one invocation: the configured arguments, the
    /// object and `-o output`.
    pub fn command_line(&self, object: &Path, output: &Path) -> Vec<String> {
        let mut line = self.args.clone();
        line.push(object.display().to_string());
        line.push("-o".to_string());
        line.push(output.display().to_string());
        line
    }

    /// Link an object file on disk into `output`.
    pub fn link(&self, object: &Path, output: &Path) -> CompileResult<()> {
        let args = self.command_line(object, output);
        log::info!("linking: {} {}", self.program, args.join(" "));

        let result = Command::new(&self.program).args(&args).output()?;
        if !result.status.success() {
            return Err(CompileError::LinkerInvocation {
                program: self.program.clone(),
                status: result.status,
                stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
            });
        }
        log::debug!("linker wrote {}", output.display());
        Ok(())
    }

    /// Write `object` next to `output` (as `<output>.o`) and link it.
    /// Returns the object path.
    pub fn link_bytes(&self, object: &[u8], output: &Path) -> CompileResult<PathBuf> {
        let mut object_path = output.as_os_str().to_owned();
        object_path.push(".o");
        let object_path = PathBuf::from(object_path);
        fs::write(&object_path, object)?;
        self.link(&object_path, output)?;
        Ok(object_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_command_line() {
        let linker = ExternalLinker::default();
        assert_eq!(linker.program(), "cc");
        assert_eq!(
            linker.command_line(Path::new("main.o"), Path::new("libmain.so")),
            vec!["-shared", "main.o", "-o", "libmain.so"]
        );
    }

    #[test]
    fn missing_program_is_an_io_error() {
        let linker = ExternalLinker::new("freestand-no-such-linker");
        let err = linker.link(Path::new("a.o"), Path::new("a.so")).unwrap_err();
        assert!(matches!(err, CompileError::Io(_)));
    }

    #[cfg(unix)]
    #[test]
    fn failing_linker_keeps_stderr() {
        let linker = ExternalLinker::new("sh").args(["-c", "echo 'undefined reference' >&2; exit 3"]);
        match linker.link(Path::new("a.o"), Path::new("a.so")) {
            Err(CompileError::LinkerInvocation { program, status, stderr }) => {
                assert_eq!(program, "sh");
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "undefined reference\n");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
