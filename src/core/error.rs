// This module defines the error types for snipgen using the thiserror crate. GenError is the
// single error enum for a generation run and covers every way a run can fail: an external tool
// that is missing or exits non-zero, an object file that does not have the expected shape, a
// relocation outside the supported set, a variant index with no pinned register, a snippet
// whose declarations and references disagree, compiler output missing the calling-convention
// markers the transformer relies on, and plain file I/O. Every variant carries the VariantKey
// of the snippet variant being processed so diagnostics always name the snippet and variant.
// GenResult<T> is the convenience alias used across the pipeline.

//! Error types for the snippet generator.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Identifies one register-pressure variant of one snippet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariantKey {
    pub snippet: String,
    pub variant: usize,
}

impl VariantKey {
    pub fn new(snippet: impl Into<String>, variant: usize) -> Self {
        Self {
            snippet: snippet.into(),
            variant,
        }
    }

    /// Name of the C function compiled for this variant, e.g. `add_i3`.
    pub fn function_name(&self) -> String {
        format!("{}_i{}", self.snippet, self.variant)
    }

    /// Whether `symbol` names this variant's function, allowing the
    /// decorations toolchains add: a `\x01` or `_` prefix and a vectorcall
    /// `@@N` suffix.
    pub fn matches_symbol(&self, symbol: &str) -> bool {
        let name = symbol.strip_prefix('\u{1}').unwrap_or(symbol);
        let name = match name.split_once("@@") {
            Some((base, count)) if count.bytes().all(|b| b.is_ascii_digit()) => base,
            _ => name,
        };
        let expected = self.function_name();
        name == expected || name.strip_prefix('_') == Some(expected.as_str())
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` variant {}", self.snippet, self.variant)
    }
}

/// Main error type for a generation run. All variants are fatal.
#[derive(Error, Debug)]
pub enum GenError {
    #[error("{at}: failed to run {tool}: {reason}")]
    ToolInvocation {
        at: VariantKey,
        tool: String,
        reason: String,
    },

    #[error("{at}: malformed object file: {reason}")]
    FormatParse { at: VariantKey, reason: String },

    #[error("{at}: unsupported relocation {kind} at offset {offset:#x}")]
    UnsupportedRelocationKind {
        at: VariantKey,
        kind: String,
        offset: u64,
    },

    #[error("{at}: no physical register for live slot {slot} in the {table} register table")]
    RegisterMappingExhausted {
        at: VariantKey,
        slot: usize,
        table: &'static str,
    },

    #[error("{at}: malformed snippet definition: {reason}")]
    MalformedSnippetDefinition { at: VariantKey, reason: String },

    #[error("{at}: compiler output drifted: {reason}")]
    CompilerDrift { at: VariantKey, reason: String },

    #[error("{at}: I/O error on {}: {source}", path.display())]
    Io {
        at: VariantKey,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GenError {
    /// The snippet variant the error was raised for.
    pub fn variant_key(&self) -> &VariantKey {
        match self {
            GenError::ToolInvocation { at, .. }
            | GenError::FormatParse { at, .. }
            | GenError::UnsupportedRelocationKind { at, .. }
            | GenError::RegisterMappingExhausted { at, .. }
            | GenError::MalformedSnippetDefinition { at, .. }
            | GenError::CompilerDrift { at, .. }
            | GenError::Io { at, .. } => at,
        }
    }
}

/// Result type alias for generation operations.
pub type GenResult<T> = Result<T, GenError>;
