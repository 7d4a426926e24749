mod common;

use common::{build_object, Code};
use iced_x86::code_asm::*;
use object::write::{Object, Relocation, StandardSection, Symbol, SymbolSection};
use object::{elf, Architecture, BinaryFormat, Endianness, RelocationFlags, SymbolFlags, SymbolKind, SymbolScope};
use snipgen::core::{GenError, TargetFormat, VariantKey};
use snipgen::inspect::{inspect, Declarations, RelocKind, RelocTarget};

const DECLS: Declarations<'static> = Declarations {
    consts: 1,
    continuations: 2,
    externs: &["exit"],
};

fn branchy() -> Code {
    Code::new()
        .asm(|a| a.test(ebp, ebp))
        .je("$CONT1")
        .mov_eax("$X0")
        .jmp("$CONT0")
}

#[test]
fn elf_function_bytes_and_holes() {
    let code = branchy();
    let data = build_object(TargetFormat::Elf, &[("branch_i1", &code)]);
    let captured = inspect(&data, &VariantKey::new("branch", 1), &DECLS).unwrap();

    assert_eq!(captured.bytes, code.bytes);
    let kinds: Vec<_> = captured
        .relocations
        .values()
        .map(|r| (r.offset, r.kind, r.target.clone()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (4, RelocKind::Rel32, RelocTarget::Cont(1)),
            (9, RelocKind::Abs32, RelocTarget::Const(0)),
            (14, RelocKind::Rel32, RelocTarget::Cont(0)),
        ]
    );
    assert_eq!(captured.hole_bytes(), 12);
}

#[test]
fn coff_without_symbol_sizes() {
    let first = Code::new().asm(|a| a.nop()).jmp("$CONT0");
    let second = branchy();
    let data = build_object(
        TargetFormat::Coff,
        &[("other_i0", &first), ("branch_i0", &second), ("after_i0", &first)],
    );
    let captured = inspect(&data, &VariantKey::new("branch", 0), &DECLS).unwrap();

    // the padding up to the next 16-byte aligned symbol is dropped
    assert_eq!(captured.bytes, second.bytes);
    assert_eq!(captured.relocations.len(), 3);
    assert_eq!(captured.relocations[&9].kind, RelocKind::Abs32);
}

#[test]
fn large_model_external_call() {
    let code = Code::new().movabs_rax("exit").asm(|a| a.call(rax));
    let data = build_object(TargetFormat::Elf, &[("sysexit_i0", &code)]);
    let decls = Declarations {
        consts: 0,
        continuations: 0,
        externs: &["exit"],
    };
    let captured = inspect(&data, &VariantKey::new("sysexit", 0), &decls).unwrap();
    let reloc = &captured.relocations[&2];
    assert_eq!(reloc.kind, RelocKind::Abs64);
    assert_eq!(reloc.target, RelocTarget::Extern("exit".to_string()));
}

#[test]
fn missing_function_is_a_parse_error() {
    let data = build_object(TargetFormat::Elf, &[("add_i0", &branchy())]);
    let err = inspect(&data, &VariantKey::new("add", 1), &DECLS).unwrap_err();
    assert!(matches!(err, GenError::FormatParse { .. }));
    assert!(err.to_string().contains("`add_i1` not found"), "{err}");
}

#[test]
fn undeclared_target_is_malformed() {
    let code = Code::new().call("abort");
    let data = build_object(TargetFormat::Elf, &[("f_i0", &code)]);
    let err = inspect(&data, &VariantKey::new("f", 0), &DECLS).unwrap_err();
    assert!(matches!(err, GenError::MalformedSnippetDefinition { .. }));
    assert!(err.to_string().contains("`abort`"));
}

#[test]
fn coff_padding_keeps_the_trailing_jump() {
    let padded = Code::new()
        .asm(|a| a.add(ebp, esi))
        .jmp("$CONT0")
        .raw(&[0xcc, 0xcc, 0x0f, 0x1f, 0x00]);
    let next = Code::new().asm(|a| a.ret());
    let data = build_object(TargetFormat::Coff, &[("add_i0", &padded), ("next_i0", &next)]);
    let captured = inspect(&data, &VariantKey::new("add", 0), &DECLS).unwrap();

    assert_eq!(captured.bytes, &padded.bytes[..7]);
    assert_eq!(snipgen::x64::trailing_near_jump(&captured.bytes), Some(2));
}

fn object_with_flags(flags: RelocationFlags, addend: i64) -> Vec<u8> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let offset = obj.append_section_data(text, &[0x48, 0x8d, 0x05, 0, 0, 0, 0], 16);
    obj.add_symbol(Symbol {
        name: b"f_i0".to_vec(),
        value: offset,
        size: 7,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });
    let target = obj.add_symbol(Symbol {
        name: b"$X0".to_vec(),
        value: 0,
        size: 0,
        kind: SymbolKind::Data,
        scope: SymbolScope::Unknown,
        weak: false,
        section: SymbolSection::Undefined,
        flags: SymbolFlags::None,
    });
    obj.add_relocation(
        text,
        Relocation {
            offset: offset + 3,
            symbol: target,
            addend,
            flags,
        },
    )
    .unwrap();
    obj.write().unwrap()
}

#[test]
fn got_relocation_is_unsupported() {
    let data = object_with_flags(
        RelocationFlags::Elf {
            r_type: elf::R_X86_64_REX_GOTPCRELX,
        },
        -4,
    );
    let err = inspect(&data, &VariantKey::new("f", 0), &DECLS).unwrap_err();
    match err {
        GenError::UnsupportedRelocationKind { offset, at, .. } => {
            assert_eq!(offset, 3);
            assert_eq!(at, VariantKey::new("f", 0));
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn unexpected_addend_is_unsupported() {
    let data = object_with_flags(
        RelocationFlags::Elf {
            r_type: elf::R_X86_64_PC32,
        },
        4,
    );
    let err = inspect(&data, &VariantKey::new("f", 0), &DECLS).unwrap_err();
    assert!(matches!(err, GenError::UnsupportedRelocationKind { .. }));
    assert!(err.to_string().contains("addend 4"), "{err}");
}
