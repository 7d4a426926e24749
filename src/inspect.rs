// This module implements the object inspector. It reads one relocatable object produced for a
// snippet variant, locates the variant's function symbol, copies the function's bytes out of
// its code section and builds an offset-keyed table of the relocations that fall inside them.
// Parsing goes straight through the object crate's COFF and ELF readers and no text output is
// interpreted. COFF symbols carry no size, so there the function runs to the next symbol and the
// alignment padding before it is trimmed by decoding the captured bytes. Only three relocation kinds are meaningful to the
// emitter (absolute 64-bit, pc-relative 32-bit and absolute 32-bit) and each of them is only
// accepted with the addend the emitter's resolution rule assumes; anything else stops the run.
// Relocation targets must be the placeholder symbols or externals the snippet declared.

//! Object inspection: code bytes and relocation holes of one snippet variant.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use object::{
    elf, pe, Architecture, BinaryFormat, Object, ObjectSection, ObjectSymbol, RelocationFlags,
    RelocationTarget, SectionKind,
};

use crate::core::{GenError, GenResult, VariantKey};
use crate::snippet::SnippetDef;

/// The closed set of relocation kinds a template can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocKind {
    /// Full 64-bit address of the target.
    Abs64,
    /// `target - site - 4`, i.e. relative to the end of the hole.
    Rel32,
    /// Truncated 32-bit address of the target.
    Abs32,
}

impl RelocKind {
    /// Number of bytes the hole occupies.
    pub fn width(self) -> usize {
        match self {
            RelocKind::Abs64 => 8,
            RelocKind::Rel32 | RelocKind::Abs32 => 4,
        }
    }

    /// Addend the resolution rule assumes for explicit-addend formats.
    fn expected_addend(self) -> i64 {
        match self {
            RelocKind::Rel32 => -4,
            RelocKind::Abs64 | RelocKind::Abs32 => 0,
        }
    }

    fn from_flags(flags: RelocationFlags) -> Option<Self> {
        match flags {
            RelocationFlags::Coff { typ } => match typ {
                pe::IMAGE_REL_AMD64_ADDR64 => Some(RelocKind::Abs64),
                pe::IMAGE_REL_AMD64_REL32 => Some(RelocKind::Rel32),
                pe::IMAGE_REL_AMD64_ADDR32 => Some(RelocKind::Abs32),
                _ => None,
            },
            RelocationFlags::Elf { r_type } => match r_type {
                elf::R_X86_64_64 => Some(RelocKind::Abs64),
                elf::R_X86_64_PC32 | elf::R_X86_64_PLT32 => Some(RelocKind::Rel32),
                elf::R_X86_64_32 | elf::R_X86_64_32S => Some(RelocKind::Abs32),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for RelocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RelocKind::Abs64 => "ADDR64",
            RelocKind::Rel32 => "REL32",
            RelocKind::Abs32 => "ADDR32",
        })
    }
}

/// What a hole is patched with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelocTarget {
    Const(usize),
    Cont(usize),
    Extern(String),
}

impl RelocTarget {
    /// Symbol name the compiler saw.
    pub fn symbol(&self) -> String {
        match self {
            RelocTarget::Const(k) => SnippetDef::const_symbol(*k),
            RelocTarget::Cont(k) => SnippetDef::cont_symbol(*k),
            RelocTarget::Extern(name) => name.clone(),
        }
    }
}

/// One relocation hole inside a captured function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub offset: usize,
    pub kind: RelocKind,
    pub target: RelocTarget,
}

impl Relocation {
    pub fn end(&self) -> usize {
        self.offset + self.kind.width()
    }
}

/// The symbols a snippet declared; every relocation must resolve to one.
#[derive(Debug, Clone, Copy)]
pub struct Declarations<'a> {
    pub consts: usize,
    pub continuations: usize,
    pub externs: &'a [&'a str],
}

impl<'a> Declarations<'a> {
    pub fn of(def: &'a SnippetDef) -> Self {
        Self {
            consts: def.consts,
            continuations: def.continuations,
            externs: def.externs,
        }
    }

    fn classify(&self, name: &str) -> Option<RelocTarget> {
        let index = |prefix: &str| name.strip_prefix(prefix).and_then(|k| k.parse::<usize>().ok());
        if let Some(k) = index("$CONT") {
            return (k < self.continuations).then_some(RelocTarget::Cont(k));
        }
        if let Some(k) = index("$X") {
            return (k < self.consts).then_some(RelocTarget::Const(k));
        }
        self.externs
            .iter()
            .find(|ext| **ext == name)
            .map(|ext| RelocTarget::Extern(ext.to_string()))
    }
}

/// Bytes and relocation table of one variant's function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedCode {
    pub bytes: Vec<u8>,
    pub relocations: BTreeMap<usize, Relocation>,
}

impl CapturedCode {
    /// Total bytes covered by relocation holes.
    pub fn hole_bytes(&self) -> usize {
        self.relocations.values().map(|r| r.kind.width()).sum()
    }
}

/// Read and inspect the object at `path`.
pub fn inspect_file(path: &Path, at: &VariantKey, decls: &Declarations<'_>) -> GenResult<CapturedCode> {
    let data = std::fs::read(path).map_err(|source| GenError::Io {
        at: at.clone(),
        path: path.to_path_buf(),
        source,
    })?;
    inspect(&data, at, decls)
}

/// Extract the function of variant `at` from an in-memory object.
pub fn inspect(data: &[u8], at: &VariantKey, decls: &Declarations<'_>) -> GenResult<CapturedCode> {
    let parse_err = |reason: String| GenError::FormatParse {
        at: at.clone(),
        reason,
    };

    let file = object::File::parse(data).map_err(|e| parse_err(e.to_string()))?;
    match file.format() {
        BinaryFormat::Coff | BinaryFormat::Elf => {}
        other => return Err(parse_err(format!("unsupported container {other:?}"))),
    }
    if file.architecture() != Architecture::X86_64 {
        return Err(parse_err(format!(
            "expected an x86-64 object, found {:?}",
            file.architecture()
        )));
    }

    let symbol = file
        .symbols()
        .find(|sym| sym.is_definition() && sym.name().is_ok_and(|name| at.matches_symbol(name)))
        .ok_or_else(|| parse_err(format!("function symbol `{}` not found", at.function_name())))?;
    let section_index = symbol
        .section_index()
        .ok_or_else(|| parse_err("function symbol has no section".to_string()))?;
    let section = file
        .section_by_index(section_index)
        .map_err(|e| parse_err(e.to_string()))?;
    if section.kind() != SectionKind::Text {
        return Err(parse_err(format!(
            "function symbol lives in non-code section {}",
            section.name().unwrap_or("?")
        )));
    }
    let section_data = section.data().map_err(|e| parse_err(e.to_string()))?;

    let start = symbol
        .address()
        .checked_sub(section.address())
        .ok_or_else(|| parse_err("function starts before its section".to_string()))?
        as usize;
    let sized = symbol.size() > 0;
    let end = if sized {
        start + symbol.size() as usize
    } else {
        // COFF symbols carry no size: run to the next symbol in the section.
        file.symbols()
            .filter(|sym| sym.section_index() == Some(section_index))
            .map(|sym| sym.address().saturating_sub(section.address()) as usize)
            .filter(|addr| *addr > start)
            .min()
            .unwrap_or(section_data.len())
    };
    if start >= end || end > section_data.len() {
        return Err(parse_err(format!(
            "function range {start:#x}..{end:#x} outside code section of {:#x} bytes",
            section_data.len()
        )));
    }
    let mut bytes = section_data[start..end].to_vec();

    let mut relocations = BTreeMap::new();
    for (offset, reloc) in section.relocations() {
        let offset = offset as usize;
        if offset < start || offset >= end {
            continue;
        }
        let local = offset - start;
        let flags = reloc.flags();
        let kind = RelocKind::from_flags(flags).ok_or_else(|| GenError::UnsupportedRelocationKind {
            at: at.clone(),
            kind: format!("{flags:?}"),
            offset: local as u64,
        })?;
        if local + kind.width() > bytes.len() {
            return Err(parse_err(format!(
                "{kind} hole at {local:#x} runs past the end of the function"
            )));
        }

        let addend_ok = if reloc.has_implicit_addend() {
            bytes[local..local + kind.width()].iter().all(|b| *b == 0)
        } else {
            reloc.addend() == kind.expected_addend()
        };
        if !addend_ok {
            return Err(GenError::UnsupportedRelocationKind {
                at: at.clone(),
                kind: format!("{kind} with addend {}", reloc.addend()),
                offset: local as u64,
            });
        }

        let name = match reloc.target() {
            RelocationTarget::Symbol(index) => file
                .symbol_by_index(index)
                .and_then(|sym| sym.name().map(str::to_string))
                .map_err(|e| parse_err(e.to_string()))?,
            other => return Err(parse_err(format!("relocation against {other:?}"))),
        };
        let target = decls
            .classify(&name)
            .ok_or_else(|| GenError::MalformedSnippetDefinition {
                at: at.clone(),
                reason: format!("relocation at {local:#x} against undeclared symbol `{name}`"),
            })?;
        relocations.insert(
            local,
            Relocation {
                offset: local,
                kind,
                target,
            },
        );
    }

    let mut previous_end = 0;
    for reloc in relocations.values() {
        if reloc.offset < previous_end {
            return Err(parse_err(format!("overlapping holes at {:#x}", reloc.offset)));
        }
        previous_end = reloc.end();
    }
    if !sized {
        // the range ran up to the next symbol and may include alignment padding
        bytes.truncate(crate::x64::code_end(&bytes).max(previous_end));
    }

    log::debug!(
        "{at}: captured {} bytes with {} relocations",
        bytes.len(),
        relocations.len()
    );
    if log::log_enabled!(log::Level::Trace) {
        for line in crate::x64::disassemble(&bytes) {
            log::trace!("{at}:   {line}");
        }
    }
    Ok(CapturedCode { bytes, relocations })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths() {
        assert_eq!(RelocKind::Abs64.width(), 8);
        assert_eq!(RelocKind::Rel32.width(), 4);
        assert_eq!(RelocKind::Abs32.width(), 4);
    }

    #[test]
    fn classify_targets() {
        let decls = Declarations {
            consts: 1,
            continuations: 2,
            externs: &["exit"],
        };
        assert_eq!(decls.classify("$X0"), Some(RelocTarget::Const(0)));
        assert_eq!(decls.classify("$X1"), None);
        assert_eq!(decls.classify("$CONT1"), Some(RelocTarget::Cont(1)));
        assert_eq!(decls.classify("exit"), Some(RelocTarget::Extern("exit".into())));
        assert_eq!(decls.classify("abort"), None);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let decls = Declarations {
            consts: 0,
            continuations: 0,
            externs: &[],
        };
        let err = inspect(b"not an object", &VariantKey::new("x", 0), &decls).unwrap_err();
        assert!(matches!(err, GenError::FormatParse { .. }));
    }
}
