//! Shared helpers: relocatable objects built with `object::write`, code
//! bytes with iced-x86's assembler.

#![allow(dead_code)]

use iced_x86::code_asm::CodeAssembler;
use iced_x86::IcedError;
use object::write::{Object, Relocation, StandardSection, Symbol, SymbolSection};
use object::{
    elf, Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags,
    RelocationKind, SymbolFlags, SymbolKind, SymbolScope,
};
use snipgen::core::TargetFormat;

/// Relocation kinds as they are requested from the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Abs64,
    Rel32,
    Abs32,
}

impl Kind {
    fn flags(self, format: TargetFormat) -> RelocationFlags {
        match format {
            TargetFormat::Elf => RelocationFlags::Elf {
                r_type: match self {
                    Kind::Abs64 => elf::R_X86_64_64,
                    Kind::Rel32 => elf::R_X86_64_PLT32,
                    Kind::Abs32 => elf::R_X86_64_32,
                },
            },
            // the writer folds the -4 into the implicit addend for these
            TargetFormat::Coff => {
                let (kind, size) = match self {
                    Kind::Abs64 => (RelocationKind::Absolute, 64),
                    Kind::Rel32 => (RelocationKind::Relative, 32),
                    Kind::Abs32 => (RelocationKind::Absolute, 32),
                };
                RelocationFlags::Generic {
                    kind,
                    encoding: RelocationEncoding::Generic,
                    size,
                }
            }
        }
    }

    fn addend(self) -> i64 {
        match self {
            Kind::Rel32 => -4,
            Kind::Abs64 | Kind::Abs32 => 0,
        }
    }
}

/// Function bytes with symbolic relocation sites.
#[derive(Debug, Clone, Default)]
pub struct Code {
    pub bytes: Vec<u8>,
    pub relocs: Vec<(usize, Kind, String)>,
}

impl Code {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append instructions assembled by iced-x86.
    pub fn asm(mut self, f: impl FnOnce(&mut CodeAssembler) -> Result<(), IcedError>) -> Self {
        let mut a = CodeAssembler::new(64).unwrap();
        f(&mut a).unwrap();
        self.bytes.extend(a.assemble(0).unwrap());
        self
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    fn hole(mut self, opcode: &[u8], kind: Kind, symbol: &str, width: usize) -> Self {
        self.bytes.extend_from_slice(opcode);
        self.relocs.push((self.bytes.len(), kind, symbol.to_string()));
        self.bytes.extend(std::iter::repeat(0).take(width));
        self
    }

    /// `jmp rel32` to `symbol`.
    pub fn jmp(self, symbol: &str) -> Self {
        self.hole(&[0xe9], Kind::Rel32, symbol, 4)
    }

    /// `je rel32` to `symbol`.
    pub fn je(self, symbol: &str) -> Self {
        self.hole(&[0x0f, 0x84], Kind::Rel32, symbol, 4)
    }

    /// `movabs rax, symbol`.
    pub fn movabs_rax(self, symbol: &str) -> Self {
        self.hole(&[0x48, 0xb8], Kind::Abs64, symbol, 8)
    }

    /// `mov eax, symbol`.
    pub fn mov_eax(self, symbol: &str) -> Self {
        self.hole(&[0xb8], Kind::Abs32, symbol, 4)
    }

    /// `call rel32` to `symbol`.
    pub fn call(self, symbol: &str) -> Self {
        self.hole(&[0xe8], Kind::Rel32, symbol, 4)
    }
}

/// Relocatable x86-64 object holding `functions` in `.text`, in order.
pub fn build_object(format: TargetFormat, functions: &[(&str, &Code)]) -> Vec<u8> {
    let binary = match format {
        TargetFormat::Elf => BinaryFormat::Elf,
        TargetFormat::Coff => BinaryFormat::Coff,
    };
    let mut obj = Object::new(binary, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);

    let mut externs = std::collections::HashMap::new();
    for (name, code) in functions {
        let offset = obj.append_section_data(text, &code.bytes, 16);
        obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: offset,
            size: code.bytes.len() as u64,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        for (at, kind, symbol) in &code.relocs {
            let id = *externs.entry(symbol.clone()).or_insert_with(|| {
                obj.add_symbol(Symbol {
                    name: symbol.as_bytes().to_vec(),
                    value: 0,
                    size: 0,
                    kind: SymbolKind::Data,
                    scope: SymbolScope::Unknown,
                    weak: false,
                    section: SymbolSection::Undefined,
                    flags: SymbolFlags::None,
                })
            });
            obj.add_relocation(
                text,
                Relocation {
                    offset: offset + *at as u64,
                    symbol: id,
                    addend: kind.addend(),
                    flags: kind.flags(format),
                },
            )
            .unwrap();
        }
    }
    obj.write().unwrap()
}
