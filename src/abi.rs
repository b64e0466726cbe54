//! ABI description: which registers the allocator may use, and the implicit
//! register effects of instructions that use physical registers behind the
//! operand visitor's back.

use crate::ir::{regs, PhysReg, RegSet, Vinstr, Vop};

/// The register file as the allocator sees it.
///
/// Reserved registers are never allocated; they belong to the runtime (stack
/// pointer, frame pointer, and the scratch register the copy sequencer
/// claims). The status-flags register is its own one-element class.
#[derive(Clone, Debug)]
pub struct Abi {
    /// Allocatable general-purpose registers.
    pub gp_unreserved: RegSet,
    /// General-purpose registers the allocator must not touch.
    pub gp_reserved: RegSet,
    /// Allocatable SIMD registers.
    pub simd_unreserved: RegSet,
    /// SIMD registers the allocator must not touch.
    pub simd_reserved: RegSet,
    /// Callee-saved registers, preserved across calls.
    pub callee_saved: RegSet,
    /// The singleton status-flags class.
    pub sf: RegSet,
    /// Whether this unit may use spill space on the stack.
    pub can_spill: bool,
}

impl Abi {
    /// All general-purpose registers, reserved or not.
    pub fn gp(&self) -> RegSet {
        self.gp_unreserved | self.gp_reserved
    }

    /// All SIMD registers, reserved or not.
    pub fn simd(&self) -> RegSet {
        self.simd_unreserved | self.simd_reserved
    }

    /// Every register the allocator may hand out.
    pub fn unreserved(&self) -> RegSet {
        self.gp_unreserved | self.simd_unreserved | self.sf
    }

    /// Registers a call clobbers.
    pub fn caller_saved(&self) -> RegSet {
        (self.gp_unreserved | self.simd_unreserved) - self.callee_saved
    }

    /// The host ABI: rsp and rbp reserved, rbx and r12-r15 callee-saved,
    /// all SIMD registers allocatable and caller-saved.
    pub fn host() -> Abi {
        let mut gp_reserved = RegSet::empty();
        gp_reserved.add(regs::RSP);
        gp_reserved.add(regs::RBP);

        let mut callee_saved = RegSet::empty();
        callee_saved.add(PhysReg::gp(3)); // rbx
        for n in 12..16 {
            callee_saved.add(PhysReg::gp(n));
        }

        Abi {
            gp_unreserved: RegSet::all_gp() - gp_reserved,
            gp_reserved,
            simd_unreserved: RegSet::all_simd(),
            simd_reserved: RegSet::empty(),
            callee_saved,
            sf: RegSet::single(PhysReg::SF),
            can_spill: true,
        }
    }
}

/// Implicit physical-register usage of one instruction.
#[derive(Clone, Copy, Default, Debug)]
pub struct Effects {
    /// Registers read.
    pub uses: RegSet,
    /// Registers that must stay live across the instruction.
    pub across: RegSet,
    /// Registers written or clobbered.
    pub defs: RegSet,
}

/// The implicit register effects of `inst` under `abi`.
///
/// Only `call` has any: it reads its argument registers and clobbers
/// everything caller-saved. Explicit operands are the visitor's business.
pub fn get_effects(abi: &Abi, inst: &Vinstr) -> Effects {
    match &inst.op {
        Vop::Call { args, .. } => Effects {
            uses: *args,
            across: RegSet::empty(),
            defs: abi.caller_saved() | abi.sf,
        },
        _ => Effects::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Vinstr;

    #[test]
    fn host_abi_is_consistent() {
        let abi = Abi::host();
        assert!(!abi.gp_unreserved.contains(regs::RSP));
        assert!(!abi.gp_unreserved.contains(regs::RBP));
        assert!((abi.gp_unreserved & abi.gp_reserved).is_empty());
        assert!(abi.unreserved().contains(PhysReg::SF));
        assert!(abi.caller_saved().contains(PhysReg::gp(0)));
        assert!(!abi.caller_saved().contains(PhysReg::gp(3)));
    }

    #[test]
    fn call_clobbers_caller_saved() {
        let abi = Abi::host();
        let mut args = RegSet::empty();
        args.add(PhysReg::gp(7));
        let call = Vinstr::new(Vop::Call {
            target: 0x1000,
            args,
        });
        let fx = get_effects(&abi, &call);
        assert_eq!(fx.uses, args);
        assert!(fx.defs.contains(PhysReg::gp(0)));
        assert!(!fx.defs.contains(PhysReg::gp(3)));
        assert!(fx.defs.contains(PhysReg::SF));

        let nop = Vinstr::nop();
        assert!(get_effects(&abi, &nop).uses.is_empty());
    }
}
