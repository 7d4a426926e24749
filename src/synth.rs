// This module implements the template source synthesizer. For every snippet it builds one C
// translation unit per register-pressure variant: variant i declares a function taking the
// opaque $stack pointer, i live-register parameters $r0..$r{i-1} and then the snippet's own
// parameters, and every continuation invocation forwards all i live registers before the extra
// values so the compiled code leaves them untouched. Constants and continuations are spelled as
// placeholder symbols ($X{k}, $CONT{k}) declared extern in a shared prelude; the relocations
// the compiler records against them become the holes of the final template. The synthesizer
// tracks which placeholders the body actually references and rejects a definition whose
// references and declarations disagree before any external tool runs. It also checks that every
// variant's signature and continuation calls fit the integer argument registers of the GHC
// convention; the backend does not reject an overflowing signature and would silently read the
// excess arguments from registers the convention never assigns.

//! Template source synthesis.

use std::collections::BTreeSet;
use std::fmt::Write;

use crate::core::{GenError, GenResult, TargetFormat, VariantKey};
use crate::snippet::{ContArg, Fragment, SnippetDef};
use crate::x64::GhcRegisterTable;

/// C sources for every variant of one snippet, plus the placeholders they use.
#[derive(Debug, Clone)]
pub struct SynthesizedSnippet {
    pub name: String,
    pub target: TargetFormat,
    /// Function definition per variant, without the prelude.
    pub bodies: Vec<String>,
    pub consts: usize,
    pub continuations: usize,
}

impl SynthesizedSnippet {
    pub fn variants(&self) -> usize {
        self.bodies.len()
    }

    /// Complete translation unit for `variant`.
    pub fn source(&self, variant: usize) -> String {
        let mut src = prelude(self.target, self.consts, self.continuations);
        src.push_str(&self.bodies[variant]);
        src.push('\n');
        src
    }

    /// The untransformed variant-0 definition, kept for documentation.
    pub fn representative(&self) -> &str {
        &self.bodies[0]
    }
}

/// Header shared by every translation unit.
fn prelude(target: TargetFormat, consts: usize, continuations: usize) -> String {
    let mut out = String::from("#include <stdbool.h>\n#include <stdint.h>\n#include <stdlib.h>\n");
    let _ = writeln!(out, "#define SNIP_CC {}", target.stand_in_convention());
    for k in 0..consts {
        let sym = SnippetDef::const_symbol(k);
        let _ = writeln!(out, "extern uintptr_t {sym};\n#define {sym} ((uintptr_t)&{sym})");
    }
    for k in 0..continuations {
        let sym = SnippetDef::cont_symbol(k);
        let _ = writeln!(out, "extern uintptr_t {sym};\n#define {sym} ((uintptr_t)&{sym})");
    }
    out
}

/// Builds the per-variant C text of one snippet.
pub struct Synthesizer {
    name: String,
    target: TargetFormat,
    code: Vec<String>,
    consts_used: BTreeSet<usize>,
    continuations_used: BTreeSet<usize>,
}

impl Synthesizer {
    pub fn new(name: &str, variants: usize, target: TargetFormat) -> Self {
        Self {
            name: name.to_string(),
            target,
            code: vec![String::new(); variants],
            consts_used: BTreeSet::new(),
            continuations_used: BTreeSet::new(),
        }
    }

    /// Emit the function signature of every variant.
    pub fn declare(&mut self, ret_type: &str, extra_params: &[&str], cc: &str) {
        for live in 0..self.code.len() {
            let mut decl = format!("{cc} {ret_type} {}_i{live}(uintptr_t $stack", self.name);
            for r in 0..live {
                let _ = write!(decl, ", uintptr_t $r{r}");
            }
            for param in extra_params {
                let _ = write!(decl, ", {param}");
            }
            decl.push(')');
            self.emit_specific(live, &decl);
        }
    }

    /// Emit a read of constant `k`.
    pub fn reference_constant(&mut self, k: usize) {
        self.emit(&SnippetDef::const_symbol(k));
        self.consts_used.insert(k);
    }

    /// Emit a tail call to continuation `k` forwarding the live registers and
    /// `extra`.
    pub fn invoke_continuation(&mut self, k: usize, extra: &[ContArg]) {
        for live in 0..self.code.len() {
            // `return` is required for the call to become musttail, even in a
            // void function.
            let mut call = String::from("return ((void (SNIP_CC *)(uintptr_t");
            for _ in 0..live {
                call.push_str(", uintptr_t");
            }
            for arg in extra {
                let _ = write!(call, ", {}", arg.ty);
            }
            let _ = write!(call, "))$CONT{k})($stack");
            for r in 0..live {
                let _ = write!(call, ", $r{r}");
            }
            for arg in extra {
                let _ = write!(call, ", {}", arg.expr);
            }
            call.push_str(");");
            self.emit_specific(live, &call);
        }
        self.continuations_used.insert(k);
    }

    /// Append `text` to every variant.
    pub fn emit(&mut self, text: &str) {
        for code in &mut self.code {
            code.push_str(text);
        }
    }

    fn emit_specific(&mut self, variant: usize, text: &str) {
        self.code[variant].push_str(text);
    }

    /// Check references against declarations and hand out the sources.
    pub fn finish(self, consts: usize, continuations: usize) -> GenResult<SynthesizedSnippet> {
        check_usage(&self.name, "constant", &self.consts_used, consts)?;
        check_usage(&self.name, "continuation", &self.continuations_used, continuations)?;
        Ok(SynthesizedSnippet {
            name: self.name,
            target: self.target,
            bodies: self.code,
            consts,
            continuations,
        })
    }
}

fn check_usage(snippet: &str, what: &str, used: &BTreeSet<usize>, declared: usize) -> GenResult<()> {
    let malformed = |reason: String| GenError::MalformedSnippetDefinition {
        at: VariantKey::new(snippet, 0),
        reason,
    };
    if let Some(k) = used.iter().find(|k| **k >= declared) {
        return Err(malformed(format!(
            "{what} {k} is referenced but only {declared} declared"
        )));
    }
    if let Some(k) = (0..declared).find(|k| !used.contains(k)) {
        return Err(malformed(format!("{what} {k} is declared but never referenced")));
    }
    Ok(())
}

/// Integer arguments passed at the widest point of `variant`: its own
/// signature or the largest continuation call. All snippet parameters and
/// continuation values are integer-class.
pub fn integer_args(def: &SnippetDef, variant: usize) -> usize {
    let forwarded = def
        .body
        .iter()
        .filter_map(|fragment| match fragment {
            Fragment::Continue { args, .. } => Some(args.len()),
            _ => None,
        })
        .max();
    let widest = forwarded.map_or(def.params.len(), |extra| extra.max(def.params.len()));
    1 + variant + widest
}

/// Reject the first variant that needs more argument registers than `table`
/// has.
fn check_register_budget(def: &SnippetDef, table: &GhcRegisterTable) -> GenResult<()> {
    for variant in 0..def.variants {
        let needed = integer_args(def, variant);
        if needed > table.len() {
            return Err(GenError::RegisterMappingExhausted {
                at: VariantKey::new(def.name, variant),
                slot: needed - 1,
                table: table.name,
            });
        }
    }
    Ok(())
}

/// Expand a definition into per-variant C sources.
pub fn synthesize(
    def: &SnippetDef,
    target: TargetFormat,
    table: &GhcRegisterTable,
) -> GenResult<SynthesizedSnippet> {
    let malformed = |reason: &str| GenError::MalformedSnippetDefinition {
        at: VariantKey::new(def.name, 0),
        reason: reason.to_string(),
    };
    if def.variants == 0 {
        return Err(malformed("snippet declares no variants"));
    }
    if let Some(pin) = def.pin {
        if pin.constant >= def.consts {
            return Err(malformed("pinned constant is not declared"));
        }
    }
    check_register_budget(def, table)?;

    let mut synth = Synthesizer::new(def.name, def.variants, target);
    synth.declare(def.ret_type, def.params, "SNIP_CC");
    for fragment in def.body {
        match *fragment {
            Fragment::Text(text) => synth.emit(text),
            Fragment::Const(k) => synth.reference_constant(k),
            Fragment::Continue { index, args } => synth.invoke_continuation(index, args),
        }
    }
    let out = synth.finish(def.consts, def.continuations)?;
    log::debug!(
        "synthesized `{}`: {} variants, {} constants, {} continuations",
        out.name,
        out.variants(),
        out.consts,
        out.continuations
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snippet::registry;

    const TABLE: GhcRegisterTable = GhcRegisterTable::LLVM_19;

    fn add() -> SynthesizedSnippet {
        let def = registry::find("add").unwrap();
        synthesize(def, TargetFormat::Elf, &TABLE).unwrap()
    }

    #[test]
    fn variant_declares_live_registers() {
        let snip = add();
        assert_eq!(snip.variants(), 8);
        assert!(snip.bodies[0].starts_with("SNIP_CC void add_i0(uintptr_t $stack, int a, int b)"));
        assert!(snip.bodies[2]
            .starts_with("SNIP_CC void add_i2(uintptr_t $stack, uintptr_t $r0, uintptr_t $r1, int a, int b)"));
    }

    #[test]
    fn continuation_forwards_live_registers_then_extras() {
        let snip = add();
        assert!(snip.bodies[2].contains(
            "return ((void (SNIP_CC *)(uintptr_t, uintptr_t, uintptr_t, int))$CONT0)($stack, $r0, $r1, v);"
        ));
        assert!(snip.bodies[0]
            .contains("return ((void (SNIP_CC *)(uintptr_t, int))$CONT0)($stack, v);"));
    }

    #[test]
    fn source_has_placeholder_prelude() {
        let def = registry::find("const_i32").unwrap();
        let snip = synthesize(def, TargetFormat::Coff, &TABLE).unwrap();
        let src = snip.source(1);
        assert!(src.contains("#define SNIP_CC __vectorcall"));
        assert!(src.contains("extern uintptr_t $X0;\n#define $X0 ((uintptr_t)&$X0)"));
        assert!(src.contains("extern uintptr_t $CONT0;"));
        assert!(!src.contains("$X1"));
        assert!(src.contains("asm (\"movl $$X0, %%eax\""));
    }

    #[test]
    fn undeclared_reference_is_rejected() {
        const BODY: &[Fragment] = &[
            Fragment::Text("{"),
            Fragment::Continue { index: 1, args: &[] },
            Fragment::Text("}"),
        ];
        let def = SnippetDef::new("bad", BODY).continuations(1);
        let err = synthesize(&def, TargetFormat::Elf, &TABLE).unwrap_err();
        assert!(matches!(err, GenError::MalformedSnippetDefinition { .. }));
        assert!(err.to_string().contains("continuation 1 is referenced"));
    }

    #[test]
    fn unreferenced_declaration_is_rejected() {
        const BODY: &[Fragment] = &[Fragment::Text("{ }")];
        let def = SnippetDef::new("lazy", BODY).consts(1);
        let err = synthesize(&def, TargetFormat::Elf, &TABLE).unwrap_err();
        assert!(err.to_string().contains("constant 0 is declared but never referenced"));
        assert_eq!(err.variant_key().snippet, "lazy");
    }

    #[test]
    fn builtin_snippets_fit_the_register_table() {
        for def in registry::builtin() {
            let widest = integer_args(def, def.variants - 1);
            assert!(widest <= TABLE.len(), "{} needs {widest} argument registers", def.name);
            synthesize(def, TargetFormat::Elf, &TABLE).unwrap();
        }
    }

    #[test]
    fn parameters_past_the_table_are_rejected() {
        const BODY: &[Fragment] = &[
            Fragment::Text("{ int v = a + b;"),
            Fragment::Continue {
                index: 0,
                args: &[ContArg::int("v")],
            },
            Fragment::Text("}"),
        ];
        let def = SnippetDef::new("sum", BODY)
            .params(&["int a", "int b"])
            .continuations(1);
        assert_eq!(integer_args(&def, 8), 11);

        let err = synthesize(&def, TargetFormat::Elf, &TABLE).unwrap_err();
        match err {
            GenError::RegisterMappingExhausted { at, slot, table } => {
                assert_eq!(at, VariantKey::new("sum", 8));
                assert_eq!(slot, 10);
                assert_eq!(table, "llvm-19");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn forwarded_values_count_against_the_table() {
        const BODY: &[Fragment] = &[
            Fragment::Text("{"),
            Fragment::Continue {
                index: 0,
                args: &[ContArg::int("1"), ContArg::int("2")],
            },
            Fragment::Text("}"),
        ];
        let def = SnippetDef::new("pair", BODY).continuations(1).variants(8);
        assert_eq!(integer_args(&def, 7), 10);
        synthesize(&def, TargetFormat::Elf, &TABLE).unwrap();

        let wide = def.variants(9);
        let err = synthesize(&wide, TargetFormat::Elf, &TABLE).unwrap_err();
        assert_eq!(err.variant_key(), &VariantKey::new("pair", 8));
    }
}
