// This module implements the template emitter. The bytes and relocation table captured for
// every variant of a snippet become a Template: literal byte runs interleaved with holes, each
// hole naming the constant, continuation or external it is patched with. A snippet's templates
// are combined into SnippetTemplates, which decides whether a fallthrough form exists (exactly
// one continuation whose only use in every variant is a trailing jmp rel32) and renders Rust
// source for a stamping routine that matches on the live-register count. The same templates can
// be stamped in-process through Template::stamp, which follows exactly the patch calls the
// generated code makes, so the two never disagree about hole semantics.

//! Template emission: stamping routines from captured code.

use std::collections::BTreeSet;
use std::fmt::{self, Write};

use hashbrown::HashMap;

use crate::core::{EmitConfig, GenError, GenResult, TargetFormat, VariantKey};
use crate::inspect::{CapturedCode, RelocKind, RelocTarget};
use crate::snippet::SnippetDef;
use crate::stamp::{CodeBuffer, Cont};
use crate::x64::{trailing_near_jump, GhcRegisterTable, NEAR_JMP_LEN};

/// Literal bytes per `buf.put` line in generated code.
const BYTES_PER_LINE: usize = 16;

/// What a hole is filled with, by position in the stamping routine's
/// parameter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operand {
    Const(usize),
    Cont(usize),
    Extern(usize),
}

/// One relocation hole of a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hole {
    pub offset: usize,
    pub kind: RelocKind,
    pub operand: Operand,
}

impl Hole {
    pub fn end(&self) -> usize {
        self.offset + self.kind.width()
    }
}

/// A piece of a template in stamping order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Bytes(&'a [u8]),
    Hole(&'a Hole),
}

/// Arguments of one stamping call.
#[derive(Debug, Clone, Copy, Default)]
pub struct StampArgs<'a, 'f> {
    pub consts: &'a [u64],
    /// Addresses of the snippet's externals, in declaration order.
    pub externs: &'a [u64],
    pub conts: &'a [Cont<'f>],
}

/// Bytes of one variant with relocation holes keyed by offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    bytes: Vec<u8>,
    holes: HashMap<usize, Hole>,
    order: Vec<usize>,
}

impl Template {
    /// Build a template, resolving relocation targets against the snippet's
    /// externals.
    pub fn from_captured(captured: &CapturedCode, externs: &[&str], at: &VariantKey) -> GenResult<Self> {
        let mut holes = HashMap::with_capacity(captured.relocations.len());
        for reloc in captured.relocations.values() {
            let operand = match &reloc.target {
                RelocTarget::Const(k) => Operand::Const(*k),
                RelocTarget::Cont(k) => Operand::Cont(*k),
                RelocTarget::Extern(name) => externs
                    .iter()
                    .position(|ext| *ext == name.as_str())
                    .map(Operand::Extern)
                    .ok_or_else(|| GenError::MalformedSnippetDefinition {
                        at: at.clone(),
                        reason: format!("relocation against undeclared external `{name}`"),
                    })?,
            };
            holes.insert(
                reloc.offset,
                Hole {
                    offset: reloc.offset,
                    kind: reloc.kind,
                    operand,
                },
            );
        }
        Ok(Self::from_parts(captured.bytes.clone(), holes))
    }

    fn from_parts(bytes: Vec<u8>, holes: HashMap<usize, Hole>) -> Self {
        let mut order: Vec<usize> = holes.keys().copied().collect();
        order.sort_unstable();
        Self {
            bytes,
            holes,
            order,
        }
    }

    /// Bytes written by one stamp.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Captured bytes; holes hold whatever the object had there.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn hole_at(&self, offset: usize) -> Option<&Hole> {
        self.holes.get(&offset)
    }

    /// Holes in offset order.
    pub fn holes(&self) -> impl Iterator<Item = &Hole> + '_ {
        self.order.iter().map(move |offset| &self.holes[offset])
    }

    /// Bytes copied verbatim by one stamp.
    pub fn literal_len(&self) -> usize {
        self.bytes.len() - self.holes().map(|h| h.kind.width()).sum::<usize>()
    }

    pub fn operands(&self) -> BTreeSet<Operand> {
        self.holes().map(|h| h.operand).collect()
    }

    pub fn segments(&self) -> Vec<Segment<'_>> {
        let mut segments = Vec::with_capacity(self.order.len() * 2 + 1);
        let mut at = 0;
        for hole in self.holes() {
            if hole.offset > at {
                segments.push(Segment::Bytes(&self.bytes[at..hole.offset]));
            }
            segments.push(Segment::Hole(hole));
            at = hole.end();
        }
        if at < self.bytes.len() {
            segments.push(Segment::Bytes(&self.bytes[at..]));
        }
        segments
    }

    /// The template without its trailing `jmp rel32` to continuation 0, if
    /// it ends in one.
    pub fn without_trailing_jump(&self) -> Option<Template> {
        let jmp = trailing_near_jump(&self.bytes)?;
        let hole = self.hole_at(jmp + 1)?;
        if hole.kind != RelocKind::Rel32 || hole.operand != Operand::Cont(0) {
            return None;
        }
        debug_assert_eq!(jmp + NEAR_JMP_LEN, self.bytes.len());
        let mut holes = self.holes.clone();
        holes.remove(&(jmp + 1));
        Some(Self::from_parts(self.bytes[..jmp].to_vec(), holes))
    }

    /// Write this template into `buf`, patching every hole from `args`.
    ///
    /// # Panics
    /// If `args` is missing an operand a hole refers to, or an absolute hole
    /// refers to a pending continuation.
    pub fn stamp(&self, buf: &mut CodeBuffer, args: &StampArgs<'_, '_>) {
        for segment in self.segments() {
            match segment {
                Segment::Bytes(bytes) => buf.put(bytes),
                Segment::Hole(hole) => match hole.operand {
                    Operand::Const(k) => put_value(buf, hole.kind, args.consts[k]),
                    Operand::Extern(k) => put_value(buf, hole.kind, args.externs[k]),
                    Operand::Cont(k) => {
                        let cont = args.conts[k];
                        match hole.kind {
                            RelocKind::Abs64 => buf.put_cont_abs64(cont),
                            RelocKind::Rel32 => buf.put_cont_rel32(cont),
                            RelocKind::Abs32 => buf.put_cont_abs32(cont),
                        }
                    }
                },
            }
        }
    }
}

fn put_value(buf: &mut CodeBuffer, kind: RelocKind, value: u64) {
    match kind {
        RelocKind::Abs64 => buf.put_abs64(value),
        RelocKind::Rel32 => buf.put_rel32(value),
        RelocKind::Abs32 => buf.put_abs32(value),
    }
}

/// All variant templates of one snippet.
#[derive(Debug, Clone)]
pub struct SnippetTemplates {
    pub name: String,
    pub consts: usize,
    pub continuations: usize,
    pub externs: Vec<String>,
    /// Untransformed C definition of variant 0.
    pub source: String,
    pub variants: Vec<Template>,
    /// Templates with the trailing continuation jump removed, present only
    /// when every variant qualifies.
    pub fallthrough: Option<Vec<Template>>,
}

impl SnippetTemplates {
    /// Combine the captured code of every variant, in variant order.
    pub fn build(def: &SnippetDef, source: &str, captured: &[CapturedCode]) -> GenResult<Self> {
        let mut variants = Vec::with_capacity(captured.len());
        for (variant, code) in captured.iter().enumerate() {
            let at = VariantKey::new(def.name, variant);
            let template = Template::from_captured(code, def.externs, &at)?;
            check_operands(def, &template, &at)?;
            variants.push(template);
        }

        let fallthrough = if def.continuations == 1 {
            variants
                .iter()
                .map(|t| {
                    t.without_trailing_jump()
                        .filter(|rest| !rest.operands().contains(&Operand::Cont(0)))
                })
                .collect::<Option<Vec<_>>>()
        } else {
            None
        };
        log::debug!(
            "`{}`: {} variants, fallthrough {}",
            def.name,
            variants.len(),
            if fallthrough.is_some() { "available" } else { "not available" }
        );

        Ok(Self {
            name: def.name.to_string(),
            consts: def.consts,
            continuations: def.continuations,
            externs: def.externs.iter().map(|s| s.to_string()).collect(),
            source: source.to_string(),
            variants,
            fallthrough,
        })
    }

    pub fn routine_name(&self) -> String {
        format!("snip_{}", self.name)
    }

    pub fn fallthrough_routine_name(&self) -> String {
        format!("snip_{}_fallthrough", self.name)
    }

    fn variant_or_panic<'t>(&self, templates: &'t [Template], variant: usize) -> &'t Template {
        templates
            .get(variant)
            .unwrap_or_else(|| crate::stamp::unknown_variant(&self.name, variant))
    }

    /// Stamp variant `num_int_regs_in_use` into `buf`.
    pub fn stamp(&self, num_int_regs_in_use: usize, buf: &mut CodeBuffer, args: &StampArgs<'_, '_>) {
        self.variant_or_panic(&self.variants, num_int_regs_in_use)
            .stamp(buf, args);
    }

    /// Stamp the fallthrough form, if the snippet has one. The caller places
    /// the continuation immediately after.
    pub fn stamp_fallthrough(
        &self,
        num_int_regs_in_use: usize,
        buf: &mut CodeBuffer,
        args: &StampArgs<'_, '_>,
    ) -> bool {
        match &self.fallthrough {
            Some(templates) => {
                self.variant_or_panic(templates, num_int_regs_in_use)
                    .stamp(buf, args);
                true
            }
            None => false,
        }
    }

    fn operand_name(&self, operand: Operand) -> String {
        match operand {
            Operand::Const(k) => format!("x{k}"),
            Operand::Cont(k) => format!("cont{k}"),
            Operand::Extern(k) => format!("ext_{}", self.externs[k]),
        }
    }

    fn operand_symbol(&self, operand: Operand) -> String {
        match operand {
            Operand::Const(k) => SnippetDef::const_symbol(k),
            Operand::Cont(k) => SnippetDef::cont_symbol(k),
            Operand::Extern(k) => self.externs[k].clone(),
        }
    }

    fn signature(&self, name: &str, continuations: usize) -> String {
        let mut params = vec![
            "num_int_regs_in_use: usize".to_string(),
            "buf: &mut CodeBuffer".to_string(),
        ];
        params.extend((0..self.consts).map(|k| format!("x{k}: u64")));
        params.extend(self.externs.iter().map(|e| format!("ext_{e}: u64")));
        params.extend((0..continuations).map(|k| format!("cont{k}: Cont<'_>")));
        format!("pub fn {name}({})", params.join(", "))
    }

    fn write_routine(
        &self,
        out: &mut String,
        name: &str,
        continuations: usize,
        templates: &[Template],
        runtime: &str,
    ) -> fmt::Result {
        if 2 + self.consts + self.externs.len() + continuations > 7 {
            writeln!(out, "#[allow(clippy::too_many_arguments)]")?;
        }
        writeln!(out, "{} {{", self.signature(name, continuations))?;
        writeln!(out, "    match num_int_regs_in_use {{")?;
        for (variant, template) in templates.iter().enumerate() {
            writeln!(out, "        {variant} => {{")?;
            for segment in template.segments() {
                match segment {
                    Segment::Bytes(bytes) => {
                        for chunk in bytes.chunks(BYTES_PER_LINE) {
                            let list: Vec<String> = chunk.iter().map(|b| format!("0x{b:02x}")).collect();
                            writeln!(out, "            buf.put(&[{}]);", list.join(", "))?;
                        }
                    }
                    Segment::Hole(hole) => {
                        let arg = self.operand_name(hole.operand);
                        let call = match (hole.operand, hole.kind) {
                            (Operand::Cont(_), RelocKind::Abs64) => "put_cont_abs64",
                            (Operand::Cont(_), RelocKind::Rel32) => "put_cont_rel32",
                            (Operand::Cont(_), RelocKind::Abs32) => "put_cont_abs32",
                            (_, RelocKind::Abs64) => "put_abs64",
                            (_, RelocKind::Rel32) => "put_rel32",
                            (_, RelocKind::Abs32) => "put_abs32",
                        };
                        writeln!(
                            out,
                            "            buf.{call}({arg}); // {} {} at {:#x}",
                            self.operand_symbol(hole.operand),
                            hole.kind,
                            hole.offset
                        )?;
                    }
                }
            }
            writeln!(out, "        }}")?;
        }
        writeln!(
            out,
            "        _ => {runtime}::unknown_variant({:?}, num_int_regs_in_use),",
            self.name
        )?;
        writeln!(out, "    }}")?;
        writeln!(out, "}}")
    }

    /// Rust source of this snippet's stamping routines.
    pub fn render(&self, config: &EmitConfig) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.render_into(&mut out, &config.runtime_path);
        out
    }

    fn render_into(&self, out: &mut String, runtime: &str) -> fmt::Result {
        writeln!(out, "/// Stamps `{}`.", self.name)?;
        writeln!(out, "///")?;
        writeln!(out, "/// ```c")?;
        for line in format_c(&self.source) {
            writeln!(out, "/// {line}")?;
        }
        writeln!(out, "/// ```")?;
        self.write_routine(out, &self.routine_name(), self.continuations, &self.variants, runtime)?;
        if let Some(fallthrough) = &self.fallthrough {
            writeln!(out)?;
            writeln!(
                out,
                "/// Stamps `{}` without its final jump; `$CONT0` must be placed next.",
                self.name
            )?;
            self.write_routine(out, &self.fallthrough_routine_name(), 0, fallthrough, runtime)?;
        }
        Ok(())
    }
}

/// Lay out a one-line C definition for a doc comment: the convention macro
/// is dropped and every statement and brace gets its own indented line.
fn format_c(source: &str) -> Vec<String> {
    let source = source.replace("SNIP_CC ", "");
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut parens = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    fn flush(lines: &mut Vec<String>, current: &mut String, depth: usize, suffix: &str) {
        let text = current.trim();
        if text.is_empty() && suffix.is_empty() {
            return;
        }
        let indent = "    ".repeat(depth);
        let line = match (text.is_empty(), suffix) {
            (true, _) => format!("{indent}{suffix}"),
            (false, "{") => format!("{indent}{text} {{"),
            (false, _) => format!("{indent}{text}{suffix}"),
        };
        lines.push(line);
        current.clear();
    }

    for c in source.chars() {
        if in_string {
            current.push(c);
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                current.push(c);
            }
            '(' => {
                parens += 1;
                current.push(c);
            }
            ')' => {
                parens = parens.saturating_sub(1);
                current.push(c);
            }
            ';' if parens == 0 => {
                current.push(';');
                flush(&mut lines, &mut current, depth, "");
            }
            '{' if parens == 0 => {
                // `} else {` stays on one line
                let joins = current.trim_start().starts_with("else")
                    && lines.last().is_some_and(|l| l.trim() == "}");
                if joins {
                    let text = current.trim().to_string();
                    current.clear();
                    if let Some(last) = lines.last_mut() {
                        last.push_str(&format!(" {text} {{"));
                    }
                } else {
                    flush(&mut lines, &mut current, depth, "{");
                }
                depth += 1;
            }
            '}' if parens == 0 => {
                flush(&mut lines, &mut current, depth, "");
                depth = depth.saturating_sub(1);
                flush(&mut lines, &mut current, depth, "}");
            }
            _ => current.push(c),
        }
    }
    flush(&mut lines, &mut current, depth, "");
    lines
}

/// Every variant must patch exactly the declared placeholders.
fn check_operands(def: &SnippetDef, template: &Template, at: &VariantKey) -> GenResult<()> {
    let used = template.operands();
    let declared = (0..def.consts)
        .map(Operand::Const)
        .chain((0..def.continuations).map(Operand::Cont))
        .chain((0..def.externs.len()).map(Operand::Extern));
    for operand in declared {
        if !used.contains(&operand) {
            let symbol = match operand {
                Operand::Const(k) => SnippetDef::const_symbol(k),
                Operand::Cont(k) => SnippetDef::cont_symbol(k),
                Operand::Extern(k) => def.externs[k].to_string(),
            };
            return Err(GenError::MalformedSnippetDefinition {
                at: at.clone(),
                reason: format!("declared `{symbol}` has no relocation in the compiled code"),
            });
        }
    }
    Ok(())
}

/// Render the complete generated file.
pub fn render_file(
    snippets: &[SnippetTemplates],
    config: &EmitConfig,
    target: TargetFormat,
    table: &GhcRegisterTable,
) -> String {
    let mut out = String::new();
    out.push_str("// This file is generated by snipgen, do not edit.\n");
    let _ = writeln!(
        out,
        "// target: {}, register table: {} ({})\n",
        target.triple(),
        table.name,
        table.toolchain
    );
    out.push_str("#[allow(unused_imports)]\n");
    let _ = writeln!(out, "use {}::{{CodeBuffer, Cont}};", config.runtime_path);
    for snippet in snippets {
        out.push('\n');
        out.push_str(&snippet.render(config));
    }
    log::info!("rendered {} snippets", snippets.len());
    out
}
