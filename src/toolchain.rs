//! Native compiler driver.
//!
//! Each variant goes through the toolchain twice: C source to textual LLVM IR,
//! then (after the convention rewrite) IR to a relocatable object. The
//! [`Toolchain`] trait is the seam between the pipeline and the external
//! compiler so tests can substitute a toolchain that needs no clang.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::core::{CodeModel, GenError, GenResult, TargetFormat, ToolchainConfig, VariantKey};

/// The two compilation steps the pipeline needs.
pub trait Toolchain: Sync {
    /// Object format this toolchain produces.
    fn target(&self) -> TargetFormat;

    /// Compile the C file at `source` to textual IR at `ir`.
    fn emit_ir(&self, source: &Path, ir: &Path, at: &VariantKey) -> GenResult<()>;

    /// Compile the IR file at `ir` to a relocatable object at `object`.
    fn compile_ir(&self, ir: &Path, object: &Path, model: CodeModel, at: &VariantKey) -> GenResult<()>;
}

/// clang invoked as an external process.
#[derive(Debug, Clone)]
pub struct Clang {
    path: PathBuf,
    target: TargetFormat,
    opt_level: String,
    extra_args: Vec<String>,
}

impl Clang {
    pub fn new(config: &ToolchainConfig) -> Self {
        Self {
            path: config.clang.clone(),
            target: config.target,
            opt_level: config.opt_level.clone(),
            extra_args: config.extra_args.clone(),
        }
    }

    /// Arguments shared by both steps.
    fn common_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            format!("--target={}", self.target.triple()).into(),
            self.opt_level.clone().into(),
        ];
        if self.target == TargetFormat::Elf {
            // Keeps placeholder addresses out of the GOT.
            args.push("-fno-pic".into());
        }
        args.extend(self.extra_args.iter().map(OsString::from));
        args
    }

    fn run(&self, args: Vec<OsString>, at: &VariantKey) -> GenResult<()> {
        let tool = self.path.display().to_string();
        log::trace!("{at}: {tool} {args:?}");
        let output = Command::new(&self.path)
            .args(&args)
            .output()
            .map_err(|e| GenError::ToolInvocation {
                at: at.clone(),
                tool: tool.clone(),
                reason: format!("could not start: {e}"),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GenError::ToolInvocation {
                at: at.clone(),
                tool,
                reason: format!("{}: {}", output.status, stderr.trim()),
            });
        }
        Ok(())
    }
}

impl Toolchain for Clang {
    fn target(&self) -> TargetFormat {
        self.target
    }

    fn emit_ir(&self, source: &Path, ir: &Path, at: &VariantKey) -> GenResult<()> {
        let mut args = self.common_args();
        args.extend(["-emit-llvm", "-S", "-o"].map(OsString::from));
        args.push(ir.into());
        args.push(source.into());
        self.run(args, at)
    }

    fn compile_ir(&self, ir: &Path, object: &Path, model: CodeModel, at: &VariantKey) -> GenResult<()> {
        let mut args = self.common_args();
        args.push(format!("-mcmodel={}", model.as_flag()).into());
        args.extend(["-c", "-o"].map(OsString::from));
        args.push(object.into());
        args.push(ir.into());
        self.run(args, at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elf_builds_without_pic() {
        let clang = Clang::new(&ToolchainConfig {
            target: TargetFormat::Elf,
            extra_args: vec!["-g0".to_string()],
            ..ToolchainConfig::default()
        });
        let args = clang.common_args();
        assert_eq!(args[0], "--target=x86_64-unknown-linux-gnu");
        assert!(args.contains(&OsString::from("-fno-pic")));
        assert_eq!(args.last(), Some(&OsString::from("-g0")));
    }

    #[test]
    fn missing_compiler_is_tool_invocation_error() {
        let clang = Clang::new(&ToolchainConfig {
            clang: PathBuf::from("/nonexistent/snipgen-clang"),
            ..ToolchainConfig::default()
        });
        let at = VariantKey::new("add", 0);
        let err = clang
            .emit_ir(Path::new("add.0.c"), Path::new("add.0.ll"), &at)
            .unwrap_err();
        assert!(matches!(err, GenError::ToolInvocation { .. }));
        assert!(err.to_string().contains("could not start"), "{err}");
    }
}
