//! Declarative snippet definitions.
//!
//! A [`SnippetDef`] describes one primitive operation of the target execution
//! engine as a C function body split into [`Fragment`]s. Fragments that read a
//! constant or invoke a continuation are kept structured so the synthesizer can
//! expand them per register-pressure variant and check them against the
//! snippet's declarations. Definitions are plain `const` data; the built-in set
//! lives in [`registry`].

pub mod registry;

use crate::core::CodeModel;

/// Number of register-pressure variants compiled for a snippet unless it says
/// otherwise. Matches the live slots available in the GHC register table.
pub const DEFAULT_VARIANTS: usize = 9;

/// A value forwarded to a continuation in addition to the live registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContArg {
    /// C type of the forwarded value.
    pub ty: &'static str,
    /// C expression producing it.
    pub expr: &'static str,
}

impl ContArg {
    pub const fn int(expr: &'static str) -> Self {
        Self { ty: "int", expr }
    }

    pub const fn uptr(expr: &'static str) -> Self {
        Self {
            ty: "uintptr_t",
            expr,
        }
    }
}

/// One piece of a snippet body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fragment {
    /// Verbatim C text, identical in every variant.
    Text(&'static str),
    /// A read of constant `k`, spelled `$X{k}`.
    Const(usize),
    /// A guaranteed tail call to continuation `index`.
    Continue {
        index: usize,
        args: &'static [ContArg],
    },
}

/// Width of a pinned constant load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinWidth {
    /// `movl $$X, %eax`
    Bits32,
    /// `movq $$X, %rax`
    Bits64,
}

/// A constant whose load instruction is moved out of the live-register slots.
///
/// The snippet loads the constant with inline asm into `eax`/`rax`; the
/// transformer retargets that instruction to the first register not holding
/// live state for the variant being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstPin {
    pub constant: usize,
    pub width: PinWidth,
}

/// Immutable description of one snippet.
#[derive(Debug, Clone, Copy)]
pub struct SnippetDef {
    pub name: &'static str,
    /// Extra C parameters following `$stack` and the live registers.
    pub params: &'static [&'static str],
    pub ret_type: &'static str,
    /// Number of declared constants, `$X0..`.
    pub consts: usize,
    /// Number of declared continuations, `$CONT0..`.
    pub continuations: usize,
    /// Runtime functions the body calls directly; their addresses become
    /// extra parameters of the stamping routine.
    pub externs: &'static [&'static str],
    pub body: &'static [Fragment],
    pub variants: usize,
    pub model: CodeModel,
    pub pin: Option<ConstPin>,
}

impl SnippetDef {
    pub const fn new(name: &'static str, body: &'static [Fragment]) -> Self {
        Self {
            name,
            params: &[],
            ret_type: "void",
            consts: 0,
            continuations: 0,
            externs: &[],
            body,
            variants: DEFAULT_VARIANTS,
            model: CodeModel::Small,
            pin: None,
        }
    }

    pub const fn params(self, params: &'static [&'static str]) -> Self {
        Self { params, ..self }
    }

    pub const fn returns(self, ret_type: &'static str) -> Self {
        Self { ret_type, ..self }
    }

    pub const fn consts(self, consts: usize) -> Self {
        Self { consts, ..self }
    }

    pub const fn continuations(self, continuations: usize) -> Self {
        Self {
            continuations,
            ..self
        }
    }

    pub const fn externs(self, externs: &'static [&'static str]) -> Self {
        Self { externs, ..self }
    }

    pub const fn variants(self, variants: usize) -> Self {
        Self { variants, ..self }
    }

    pub const fn model(self, model: CodeModel) -> Self {
        Self { model, ..self }
    }

    pub const fn pin(self, constant: usize, width: PinWidth) -> Self {
        Self {
            pin: Some(ConstPin { constant, width }),
            ..self
        }
    }

    /// Placeholder symbol for constant `k`.
    pub fn const_symbol(k: usize) -> String {
        format!("$X{k}")
    }

    /// Placeholder symbol for continuation `k`.
    pub fn cont_symbol(k: usize) -> String {
        format!("$CONT{k}")
    }
}
