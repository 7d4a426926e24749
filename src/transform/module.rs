//! Structured convention rewriting on the in-memory LLVM module.
//!
//! Calling conventions and tail-call kinds are set through the C API instead
//! of text substitution. Inline-asm operand strings are not reachable that
//! way, so the printed module still goes through [`pin_constant_load`].

use inkwell::context::Context;
use inkwell::memory_buffer::MemoryBuffer;
use inkwell::values::{AsValueRef, InstructionOpcode};
use llvm_sys::core::{
    LLVMGetInstructionCallConv, LLVMGetTailCallKind, LLVMSetInstructionCallConv,
    LLVMSetTailCallKind,
};
use llvm_sys::LLVMTailCallKind;

use super::{drift, pin_constant_load, ConventionRewriter, RewriteContext};
use crate::core::GenResult;

/// `CallingConv::X86_VectorCall`.
const X86_VECTORCALL_CC: u32 = 80;
/// `CallingConv::GHC`.
const GHC_CC: u32 = 10;

/// Rewrites conventions through inkwell and llvm-sys.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleRewriter;

impl ConventionRewriter for ModuleRewriter {
    fn rewrite(&self, ir: &str, ctx: &RewriteContext<'_>) -> GenResult<String> {
        let context = Context::create();
        let buffer = MemoryBuffer::create_from_memory_range_copy(ir.as_bytes(), "snippet");
        let module = context
            .create_module_from_ir(buffer)
            .map_err(|e| drift(ctx, format!("initial IR does not parse: {e}")))?;

        let mut defined = false;
        let mut tail_calls = 0usize;
        for function in module.get_functions() {
            if function.get_call_conventions() == X86_VECTORCALL_CC {
                function.set_call_conventions(GHC_CC);
                let name = function.get_name().to_string_lossy();
                if function.count_basic_blocks() > 0 && ctx.at.matches_symbol(&name) {
                    defined = true;
                }
            }
            for block in function.get_basic_blocks() {
                for inst in block.get_instructions() {
                    if inst.get_opcode() != InstructionOpcode::Call {
                        continue;
                    }
                    let raw = inst.as_value_ref();
                    // SAFETY: `raw` is a live call instruction owned by `module`.
                    unsafe {
                        if LLVMGetInstructionCallConv(raw) != X86_VECTORCALL_CC {
                            continue;
                        }
                        if LLVMGetTailCallKind(raw) == LLVMTailCallKind::LLVMTailCallKindNone
                            || LLVMGetTailCallKind(raw) == LLVMTailCallKind::LLVMTailCallKindNoTail
                        {
                            return Err(drift(ctx, "continuation call is not in tail position"));
                        }
                        LLVMSetInstructionCallConv(raw, GHC_CC);
                        LLVMSetTailCallKind(raw, LLVMTailCallKind::LLVMTailCallKindMustTail);
                    }
                    tail_calls += 1;
                }
            }
        }

        if !defined {
            return Err(drift(
                ctx,
                format!("no vectorcall definition of {}", ctx.at.function_name()),
            ));
        }
        if ctx.continuations > 0 && tail_calls == 0 {
            return Err(drift(ctx, "no continuation tail call found"));
        }
        module
            .verify()
            .map_err(|e| drift(ctx, format!("rewritten module is invalid: {e}")))?;

        let printed = module.print_to_string().to_string();
        pin_constant_load(&printed, ctx)
    }
}
