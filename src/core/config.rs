//! Generation-run configuration.
//!
//! The binary builds a [`GenConfig`] from its command line; library users and
//! tests construct one directly. [`GenConfig::default`] is the configuration of
//! a no-argument run: `clang` from `PATH`, the host object format and the
//! stamping runtime at `snipgen::stamp`.

use std::path::PathBuf;

/// Object container the toolchain produces. Both are x86-64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TargetFormat {
    /// PE/COFF objects, `IMAGE_REL_AMD64_*` relocations.
    Coff,
    /// ELF objects, `R_X86_64_*` relocations.
    Elf,
}

impl TargetFormat {
    /// Format produced by a toolchain targeting the host.
    pub fn host() -> Self {
        if cfg!(windows) {
            TargetFormat::Coff
        } else {
            TargetFormat::Elf
        }
    }

    pub fn triple(self) -> &'static str {
        match self {
            TargetFormat::Coff => "x86_64-pc-windows-msvc",
            TargetFormat::Elf => "x86_64-unknown-linux-gnu",
        }
    }

    /// C spelling of the stand-in calling convention. clang lowers it to
    /// `x86_vectorcallcc`, which the transformer then renames.
    pub fn stand_in_convention(self) -> &'static str {
        match self {
            TargetFormat::Coff => "__vectorcall",
            TargetFormat::Elf => "__attribute__((vectorcall))",
        }
    }

    pub fn object_extension(self) -> &'static str {
        match self {
            TargetFormat::Coff => "obj",
            TargetFormat::Elf => "o",
        }
    }
}

/// Addressing model passed to the native code generator as `-mcmodel`.
///
/// `Small` keeps continuation jumps as compact `jmp rel32`; `Large` forces
/// full 64-bit absolute addresses, which snippets calling into far-away
/// runtime functions need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodeModel {
    #[default]
    Small,
    Medium,
    Large,
}

impl CodeModel {
    pub fn as_flag(self) -> &'static str {
        match self {
            CodeModel::Small => "small",
            CodeModel::Medium => "medium",
            CodeModel::Large => "large",
        }
    }
}

/// How to reach and drive the native toolchain.
#[derive(Debug, Clone)]
pub struct ToolchainConfig {
    /// Path or name of the clang executable.
    pub clang: PathBuf,
    pub target: TargetFormat,
    pub opt_level: String,
    /// Extra arguments appended to both clang invocations.
    pub extra_args: Vec<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            clang: PathBuf::from("clang"),
            target: TargetFormat::host(),
            opt_level: "-O3".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// Settings for the generated Rust source.
#[derive(Debug, Clone)]
pub struct EmitConfig {
    /// Module path the generated file imports `CodeBuffer` and `Cont` from.
    pub runtime_path: String,
}

impl Default for EmitConfig {
    fn default() -> Self {
        Self {
            runtime_path: "snipgen::stamp".to_string(),
        }
    }
}

/// Complete configuration of one generation run.
#[derive(Debug, Clone, Default)]
pub struct GenConfig {
    pub toolchain: ToolchainConfig,
    pub emit: EmitConfig,
    /// Directory for intermediate files. A fresh temporary directory is used
    /// when unset.
    pub work_dir: Option<PathBuf>,
    /// Keep the temporary directory after the run.
    pub keep_temps: bool,
    /// Restrict the run to these snippet names. Empty means all.
    pub only: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_run_uses_host_format() {
        let config = GenConfig::default();
        assert_eq!(config.toolchain.target, TargetFormat::host());
        assert_eq!(config.emit.runtime_path, "snipgen::stamp");
        assert!(config.only.is_empty());
    }

    #[test]
    fn code_model_flags() {
        assert_eq!(CodeModel::default().as_flag(), "small");
        assert_eq!(CodeModel::Large.as_flag(), "large");
    }
}
