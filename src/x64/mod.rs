//! x86-64 specific components.
//!
//! - The versioned GHC register table used to pin constant loads
//! - Decoding of captured templates using iced-x86

pub mod calling_convention;
pub mod decode;

pub use calling_convention::{ArgSlot, GhcRegisterTable};
pub use decode::{code_end, decode, disassemble, trailing_near_jump, NEAR_JMP_LEN};
