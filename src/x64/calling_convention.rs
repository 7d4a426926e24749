// This module pins the register assignment of the GHC calling convention that snippets are
// compiled with. LLVM passes the first integer arguments of a ghccc function in a fixed order
// of callee registers; snippet argument 0 is the $stack pointer and argument i+1 is live value
// i, so the register holding live slot n is simply the n-th entry of that order. The order is a
// property of a particular LLVM release rather than a portable ABI, which is why the table is a
// named, versioned constant: a toolchain upgrade that changes it needs a new table, not a
// silent reinterpretation of the old one. The transformer uses the table to retarget pinned
// constant loads to the first register past the live slots of the variant being compiled.

//! GHC convention register table for x86-64.

use iced_x86::Register;

use crate::snippet::PinWidth;

/// One integer argument slot of the convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSlot {
    pub reg64: Register,
    pub reg32: Register,
    name64: &'static str,
    name32: &'static str,
}

impl ArgSlot {
    const fn new(reg64: Register, reg32: Register, name64: &'static str, name32: &'static str) -> Self {
        Self {
            reg64,
            reg32,
            name64,
            name32,
        }
    }

    /// AT&T register name without the `%` prefix.
    pub fn name(&self, width: PinWidth) -> &'static str {
        match width {
            PinWidth::Bits32 => self.name32,
            PinWidth::Bits64 => self.name64,
        }
    }

    pub fn register(&self, width: PinWidth) -> Register {
        match width {
            PinWidth::Bits32 => self.reg32,
            PinWidth::Bits64 => self.reg64,
        }
    }
}

/// Argument-slot to register mapping for one toolchain release.
#[derive(Debug, Clone, Copy)]
pub struct GhcRegisterTable {
    pub name: &'static str,
    /// Toolchain release the order was verified against.
    pub toolchain: &'static str,
    slots: &'static [ArgSlot],
}

impl GhcRegisterTable {
    /// `CC_X86_64_GHC` integer argument order.
    pub const LLVM_19: GhcRegisterTable = GhcRegisterTable {
        name: "llvm-19",
        toolchain: "clang 19.1",
        slots: &[
            ArgSlot::new(Register::R13, Register::R13D, "r13", "r13d"),
            ArgSlot::new(Register::RBP, Register::EBP, "rbp", "ebp"),
            ArgSlot::new(Register::R12, Register::R12D, "r12", "r12d"),
            ArgSlot::new(Register::RBX, Register::EBX, "rbx", "ebx"),
            ArgSlot::new(Register::R14, Register::R14D, "r14", "r14d"),
            ArgSlot::new(Register::RSI, Register::ESI, "rsi", "esi"),
            ArgSlot::new(Register::RDI, Register::EDI, "rdi", "edi"),
            ArgSlot::new(Register::R8, Register::R8D, "r8", "r8d"),
            ArgSlot::new(Register::R9, Register::R9D, "r9", "r9d"),
            ArgSlot::new(Register::R15, Register::R15D, "r15", "r15d"),
        ],
    };

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> Option<&ArgSlot> {
        self.slots.get(index)
    }

    /// Slot index that is free for a pinned value in a variant with
    /// `live_values` live registers. Slot 0 carries `$stack`.
    pub fn free_slot_index(live_values: usize) -> usize {
        live_values + 1
    }

    /// Register a pinned constant should be loaded into for `live_values`.
    pub fn pinned_register(&self, live_values: usize) -> Option<&ArgSlot> {
        self.slot(Self::free_slot_index(live_values))
    }

    /// Largest variant count the table can pin registers for.
    pub fn max_variants(&self) -> usize {
        self.slots.len().saturating_sub(1)
    }
}

impl Default for GhcRegisterTable {
    fn default() -> Self {
        Self::LLVM_19
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_occupies_slot_zero() {
        let table = GhcRegisterTable::LLVM_19;
        assert_eq!(table.slot(0).map(|s| s.reg64), Some(Register::R13));
        assert_eq!(table.pinned_register(0).map(|s| s.reg64), Some(Register::RBP));
        assert_eq!(table.pinned_register(3).unwrap().name(PinWidth::Bits32), "r14d");
    }

    #[test]
    fn table_covers_default_variants() {
        let table = GhcRegisterTable::default();
        assert_eq!(table.max_variants(), crate::snippet::DEFAULT_VARIANTS);
        assert!(table.pinned_register(crate::snippet::DEFAULT_VARIANTS - 1).is_some());
        assert!(table.pinned_register(crate::snippet::DEFAULT_VARIANTS).is_none());
    }

    #[test]
    fn widths_agree() {
        let table = GhcRegisterTable::LLVM_19;
        for i in 0..table.len() {
            let slot = table.slot(i).unwrap();
            assert_eq!(slot.reg32.full_register(), slot.reg64);
        }
    }
}
