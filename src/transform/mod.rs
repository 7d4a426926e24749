// This module implements the calling-convention transformer that runs between the two clang
// invocations. clang cannot be asked to emit GHC-convention C functions, so the synthesizer
// tags definitions and continuation casts with vectorcall and this pass renames
// x86_vectorcallcc to ghccc in the textual LLVM IR. Every continuation call must already be a
// tail call; it is upgraded to musttail so the backend either lowers it to a jmp or fails the
// build. Pinned constant loads are written by the snippet as inline asm targeting eax/rax and
// are retargeted to the register of the first free argument slot of the variant. Each
// substitution first checks that the pattern it expects is present: a compiler upgrade that
// changes the IR spelling aborts the run instead of producing a template that is silently wrong.

//! Calling-convention transformer.

#[cfg(feature = "llvm")]
pub mod module;

use crate::core::{GenError, GenResult, VariantKey};
use crate::snippet::{ConstPin, PinWidth, SnippetDef};
use crate::x64::GhcRegisterTable;

/// IR spelling of the stand-in convention clang emits.
pub const STAND_IN_CC: &str = "x86_vectorcallcc";
/// IR spelling of the continuation-passing convention.
pub const TARGET_CC: &str = "ghccc";

/// What the transformer needs to know about the variant being rewritten.
#[derive(Debug, Clone)]
pub struct RewriteContext<'a> {
    pub at: &'a VariantKey,
    pub continuations: usize,
    pub pin: Option<ConstPin>,
    pub table: &'a GhcRegisterTable,
}

/// Rewrites a module's textual IR into its final form.
pub trait ConventionRewriter: Sync {
    fn rewrite(&self, ir: &str, ctx: &RewriteContext<'_>) -> GenResult<String>;
}

/// Guarded textual substitution on serialized IR.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextualRewriter;

impl ConventionRewriter for TextualRewriter {
    fn rewrite(&self, ir: &str, ctx: &RewriteContext<'_>) -> GenResult<String> {
        let ir = install_convention(ir, ctx)?;
        pin_constant_load(&ir, ctx)
    }
}

fn drift(ctx: &RewriteContext<'_>, reason: impl Into<String>) -> GenError {
    GenError::CompilerDrift {
        at: ctx.at.clone(),
        reason: reason.into(),
    }
}

/// Symbol a `define` line defines, without `@` and quotes.
fn defined_symbol(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("define ")?;
    let at = rest.find('@')?;
    let rest = &rest[at + 1..];
    if let Some(quoted) = rest.strip_prefix('"') {
        let end = quoted.find('"')?;
        let name = &quoted[..end];
        Some(name.strip_prefix("\\01").unwrap_or(name))
    } else {
        let end = rest.find('(')?;
        Some(&rest[..end])
    }
}

/// Rename the stand-in convention and force every continuation call into a
/// guaranteed tail call.
pub fn install_convention(ir: &str, ctx: &RewriteContext<'_>) -> GenResult<String> {
    let defined = ir.lines().any(|line| {
        line.contains(STAND_IN_CC) && defined_symbol(line).is_some_and(|sym| ctx.at.matches_symbol(sym))
    });
    if !defined {
        return Err(drift(
            ctx,
            format!(
                "no `define {STAND_IN_CC}` for {} in the initial IR",
                ctx.at.function_name()
            ),
        ));
    }

    let stand_in_call = format!("call {STAND_IN_CC}");
    let tail_call = format!(" tail call {STAND_IN_CC}");
    let musttail_call = format!(" musttail call {STAND_IN_CC}");
    let notail_call = format!("notail call {STAND_IN_CC}");
    if ir.contains(&notail_call) {
        return Err(drift(
            ctx,
            "continuation call marked `notail` cannot become `musttail`",
        ));
    }
    let calls = ir.matches(&stand_in_call).count();
    let tail_calls = ir.matches(&tail_call).count() + ir.matches(&musttail_call).count();
    if calls != tail_calls {
        return Err(drift(
            ctx,
            format!(
                "{} of {calls} continuation calls are not in tail position",
                calls - tail_calls
            ),
        ));
    }
    if ctx.continuations > 0 && tail_calls == 0 {
        return Err(drift(
            ctx,
            format!("expected a `tail call {STAND_IN_CC}` for {} continuations", ctx.continuations),
        ));
    }

    let rewritten = ir
        .replace(&musttail_call, &tail_call)
        .replace(&tail_call, &format!(" musttail call {TARGET_CC}"))
        .replace(STAND_IN_CC, TARGET_CC);
    log::trace!(
        "{}: installed {TARGET_CC} on {tail_calls} continuation calls",
        ctx.at
    );
    Ok(rewritten)
}

/// Leading part of the inline asm a pinned load appears as, up to the
/// destination register, and the accumulator the snippet loads into.
fn pin_pattern(constant: usize, width: PinWidth) -> (String, &'static str) {
    let (mnemonic, acc) = match width {
        PinWidth::Bits32 => ("movl", "eax"),
        PinWidth::Bits64 => ("movq", "rax"),
    };
    // `$` is the operand escape in IR asm strings.
    let operand = format!("${}", SnippetDef::const_symbol(constant)).replace('$', "$$");
    (format!("asm \"{mnemonic} {operand}, %"), acc)
}

/// Retarget the pinned constant load to the first free argument register.
pub fn pin_constant_load(ir: &str, ctx: &RewriteContext<'_>) -> GenResult<String> {
    let Some(pin) = ctx.pin else {
        return Ok(ir.to_string());
    };
    let slot = GhcRegisterTable::free_slot_index(ctx.at.variant);
    let reg = ctx
        .table
        .pinned_register(ctx.at.variant)
        .ok_or_else(|| GenError::RegisterMappingExhausted {
            at: ctx.at.clone(),
            slot,
            table: ctx.table.name,
        })?
        .name(pin.width);

    let (prefix, acc) = pin_pattern(pin.constant, pin.width);
    let expected = format!("{prefix}{acc}\", \"={{ax}},");
    if !ir.contains(&expected) {
        return Err(drift(ctx, format!("pinned load `{expected}` not found")));
    }
    let pinned = format!("{prefix}{reg}\", \"={{{reg}}},");
    log::trace!("{}: pinned $X{} to {reg}", ctx.at, pin.constant);
    Ok(ir.replace(&expected, &pinned))
}
