//! Decoding of captured templates with iced-x86.
//!
//! Relocation holes are still zero when a template is decoded, which iced
//! handles like any other displacement or immediate.

use iced_x86::{Code, Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter, Mnemonic};

/// Size of `jmp rel32` (`E9 xx xx xx xx`).
pub const NEAR_JMP_LEN: usize = 5;

/// Decode `bytes` into instructions, stopping at the first invalid one.
pub fn decode(bytes: &[u8]) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(64, bytes, 0, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut instr = Instruction::default();
    while decoder.can_decode() {
        decoder.decode_out(&mut instr);
        if instr.is_invalid() {
            break;
        }
        instructions.push(instr);
    }
    instructions
}

/// Offset of the trailing `jmp rel32`, if the code ends with one.
///
/// A raw `E9` five bytes from the end is not enough: it may be the tail of
/// an earlier instruction's immediate, so the whole sequence is decoded.
pub fn trailing_near_jump(bytes: &[u8]) -> Option<usize> {
    let instructions = decode(bytes);
    let last = instructions.last()?;
    let end = last.ip() as usize + last.len();
    if end == bytes.len() && last.code() == Code::Jmp_rel32_64 {
        Some(last.ip() as usize)
    } else {
        None
    }
}

/// Length of `bytes` without trailing alignment padding: `int3`, `nop` of
/// any width, or zero fill.
pub fn code_end(bytes: &[u8]) -> usize {
    decode(bytes)
        .iter()
        .rev()
        .find(|instr| {
            let start = instr.ip() as usize;
            let filler = bytes[start..start + instr.len()].iter().all(|b| *b == 0);
            !(filler || matches!(instr.mnemonic(), Mnemonic::Int3 | Mnemonic::Nop))
        })
        .map_or(0, |instr| instr.ip() as usize + instr.len())
}

/// Intel-syntax listing, one line per instruction, for logs.
pub fn disassemble(bytes: &[u8]) -> Vec<String> {
    let mut formatter = IntelFormatter::new();
    decode(bytes)
        .iter()
        .map(|instr| {
            let mut text = String::new();
            formatter.format(instr, &mut text);
            format!("{:04x}: {}", instr.ip(), text)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_trailing_jump() {
        // add ebp, esi; jmp rel32
        let bytes = [0x01, 0xf5, 0xe9, 0, 0, 0, 0];
        assert_eq!(trailing_near_jump(&bytes), Some(2));
    }

    #[test]
    fn e9_inside_immediate_is_not_a_jump() {
        // mov eax, imm32 whose bytes contain E9; then a one-byte ret
        let bytes = [0xb8, 0x00, 0xe9, 0x00, 0x00, 0xc3];
        assert_eq!(trailing_near_jump(&bytes), None);
        // movabs rax, imm64 ending in E9 00 00 00 00
        let bytes = [0x48, 0xb8, 0x11, 0x22, 0x33, 0xe9, 0, 0, 0, 0];
        assert_eq!(trailing_near_jump(&bytes), None);
    }

    #[test]
    fn short_jump_does_not_count() {
        let bytes = [0x90, 0xeb, 0x00];
        assert_eq!(trailing_near_jump(&bytes), None);
    }

    #[test]
    fn listing_is_intel_syntax() {
        let lines = disassemble(&[0x01, 0xf5, 0xc3]);
        assert_eq!(lines, vec!["0000: add ebp,esi".to_string(), "0002: ret".to_string()]);
    }

    #[test]
    fn padding_is_not_code() {
        // add ebp, esi; jmp rel32; int3 x2; nopw cs:[rax+rax]
        let mut bytes = vec![0x01, 0xf5, 0xe9, 0, 0, 0, 0, 0xcc, 0xcc];
        bytes.extend([0x66, 0x2e, 0x0f, 0x1f, 0x84, 0, 0, 0, 0, 0]);
        assert_eq!(code_end(&bytes), 7);
        // zero fill after a ret
        assert_eq!(code_end(&[0xc3, 0, 0, 0, 0, 0, 0, 0]), 1);
        assert_eq!(code_end(&[0xcc, 0x90]), 0);
    }
}
