//! The vasm instruction set and its operand visitors.
//!
//! `Vinstr` is a tagged record: an op with its payload, plus the linear
//! position assigned by the allocator's pre-analysis and the originating
//! source location. Every pass that needs to see register operands goes
//! through `visit_operands` (read-only, with each operand's role and class)
//! or `map_operands` (in-place rewrite), so the operand shape of each op is
//! written down exactly once.

use crate::ir::reg::{RegClass, RegSet, Vreg};
use crate::ir::unit::{Vlabel, Vtuple};
use cranelift_entity::entity_impl;

/// A linear code position. Instructions occupy even positions; odd positions
/// are the in-between points where copies and spills are placed.
pub type Position = u32;

/// A code address outside the unit (e.g. a jump target in already-compiled
/// code).
pub type Addr = u64;

/// An opaque id for a side-exit target outside the unit.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SideExit(u32);
entity_impl!(SideExit, "exit");

/// Source location tag carried from the IR this unit was lowered from.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct SrcLoc(u32);

impl SrcLoc {
    /// A source location with the given raw id.
    pub fn new(id: u32) -> SrcLoc {
        SrcLoc(id)
    }
}

/// Condition codes for conditional branches.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[allow(missing_docs)]
pub enum Cond {
    E,
    NE,
    L,
    LE,
    G,
    GE,
    B,
    BE,
    A,
    AE,
}

/// Memory segment override.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Segment {
    /// The default data segment.
    #[default]
    Ds,
    /// The thread-local segment.
    Fs,
}

/// A memory operand: `seg:[base + index*scale + disp]`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Vptr {
    /// Base register, if any.
    pub base: Option<Vreg>,
    /// Index register, if any.
    pub index: Option<Vreg>,
    /// Scale applied to the index register: 1, 2, 4, or 8.
    pub scale: u8,
    /// Constant displacement.
    pub disp: i32,
    /// Segment override.
    pub seg: Segment,
}

impl Vptr {
    /// `[base + disp]`.
    pub fn base_disp(base: impl Into<Vreg>, disp: i32) -> Vptr {
        Vptr {
            base: Some(base.into()),
            index: None,
            scale: 1,
            disp,
            seg: Segment::Ds,
        }
    }

    /// `seg:[disp]` with no registers.
    pub fn baseless(disp: i32, seg: Segment) -> Vptr {
        Vptr {
            base: None,
            index: None,
            scale: 1,
            disp,
            seg,
        }
    }
}

/// Instruction opcodes with their payloads.
#[derive(Clone, PartialEq, Debug)]
#[allow(missing_docs)]
pub enum Vop {
    /// No operation.
    Nop,
    /// Push a GP register; moves sp down by 8.
    Push { s: Vreg },
    /// Pop into a GP register; moves sp up by 8.
    Pop { d: Vreg },
    /// `d = s0 + s1`, setting flags.
    Addq { s0: Vreg, s1: Vreg, d: Vreg, sf: Vreg },
    /// `d = s1 + imm`, setting flags.
    Addqi { s0: i32, s1: Vreg, d: Vreg, sf: Vreg },
    /// `d = s1 - imm`, setting flags.
    Subqi { s0: i32, s1: Vreg, d: Vreg, sf: Vreg },
    /// `d = s1 << s0`, setting flags. The count must stay live across the
    /// write of `d`.
    Shlq { s0: Vreg, s1: Vreg, d: Vreg, sf: Vreg },
    /// Address computation; never touches flags.
    Lea { s: Vptr, d: Vreg },
    /// Register-to-register move.
    Copy { s: Vreg, d: Vreg },
    /// Two parallel moves; lowers to an exchange when they swap.
    Copy2 { s0: Vreg, s1: Vreg, d0: Vreg, d1: Vreg },
    /// Parallel move of a whole tuple.
    Copyargs { s: Vtuple, d: Vtuple },
    /// Phi destinations; must be the first instruction of its block.
    Phidef { defs: Vtuple },
    /// Jump carrying phi sources for the target's phidef.
    Phijmp { uses: Vtuple, target: Vlabel },
    /// Conditional jump carrying phi sources for both targets' phidefs.
    Phijcc { cc: Cond, sf: Vreg, uses: Vtuple, targets: [Vlabel; 2] },
    /// Unconditional in-unit jump.
    Jmp { target: Vlabel },
    /// Conditional in-unit jump: `targets[0]` if false, `targets[1]` if true.
    Jcc { cc: Cond, sf: Vreg, targets: [Vlabel; 2] },
    /// Conditional jump out of the unit to `taken`, else fall through to
    /// `target`.
    Jcci { cc: Cond, sf: Vreg, target: Vlabel, taken: Addr },
    /// Unconditional jump out of the unit.
    Jmpi { target: Addr },
    /// Call out of the unit; `args` are implicitly read, caller-saved
    /// registers implicitly clobbered.
    Call { target: Addr, args: RegSet },
    /// Unconditional side exit to the interpreter.
    Fallback { target: SideExit, args: RegSet },
    /// Conditional side exit; the taken edge leaves the unit and is not a
    /// CFG edge.
    Fallbackcc { cc: Cond, sf: Vreg, target: SideExit, args: RegSet },
    /// Unconditional exit to a retranslation stub.
    Bindjmp { target: SideExit, args: RegSet },
    /// Conditional exit to a retranslation stub; hidden edge like
    /// `Fallbackcc`.
    Bindjcc { cc: Cond, sf: Vreg, target: SideExit, args: RegSet },
    /// Load an 8-bit immediate.
    Ldimmb { val: u8, d: Vreg },
    /// Load a 32-bit immediate.
    Ldimml { val: i32, d: Vreg },
    /// Load a 64-bit immediate.
    Ldimmq { val: u64, d: Vreg },
    /// 8-bit xor, setting flags.
    Xorb { s0: Vreg, s1: Vreg, d: Vreg, sf: Vreg },
    /// 32-bit xor, setting flags.
    Xorl { s0: Vreg, s1: Vreg, d: Vreg, sf: Vreg },
    /// 64-bit load.
    Load { s: Vptr, d: Vreg },
    /// 128-bit unaligned SIMD load.
    Loadups { s: Vptr, d: Vreg },
    /// 64-bit store.
    Store { s: Vreg, d: Vptr },
    /// 128-bit unaligned SIMD store.
    Storeups { s: Vreg, d: Vptr },
    /// Undefined instruction; traps.
    Ud2,
}

/// One vasm instruction.
#[derive(Clone, PartialEq, Debug)]
pub struct Vinstr {
    /// The op and its payload.
    pub op: Vop,
    /// Linear position; assigned by the allocator's pre-analysis.
    pub pos: Position,
    /// Source location this instruction was lowered from.
    pub origin: SrcLoc,
}

impl Vinstr {
    /// Wrap an op with default position and origin.
    pub fn new(op: Vop) -> Vinstr {
        Vinstr {
            op,
            pos: 0,
            origin: SrcLoc::default(),
        }
    }

    /// A no-op instruction.
    pub fn nop() -> Vinstr {
        Vinstr::new(Vop::Nop)
    }
}

impl From<Vop> for Vinstr {
    fn from(op: Vop) -> Vinstr {
        Vinstr::new(op)
    }
}

/// Visitor over the register operands of one instruction.
///
/// `visit_operands` calls one method per operand, identifying its role (use,
/// def, use-across, hint pairs, tuple, implicit register set) and class. All
/// methods default to doing nothing, except that hinted and across operands
/// fall back to their plain variants, which is what most visitors want.
pub trait OperandVisitor {
    /// An immediate operand.
    fn imm(&mut self) {}
    /// A plain register use.
    fn use_reg(&mut self, r: Vreg, class: RegClass) {
        let _ = (r, class);
    }
    /// A register use that would like to share `hint`'s register.
    fn use_hint(&mut self, r: Vreg, class: RegClass, hint: Vreg) {
        let _ = hint;
        self.use_reg(r, class);
    }
    /// A use that must stay live across the instruction's defs.
    fn across(&mut self, r: Vreg, class: RegClass) {
        self.use_reg(r, class);
    }
    /// A plain register def.
    fn def_reg(&mut self, r: Vreg, class: RegClass) {
        let _ = (r, class);
    }
    /// A register def that would like to share `hint`'s register.
    fn def_hint(&mut self, r: Vreg, class: RegClass, hint: Vreg) {
        let _ = hint;
        self.def_reg(r, class);
    }
    /// A tuple of uses.
    fn use_tuple(&mut self, t: Vtuple) {
        let _ = t;
    }
    /// A tuple of uses hinted pairwise by another tuple.
    fn use_tuple_hint(&mut self, t: Vtuple, hints: Vtuple) {
        let _ = hints;
        self.use_tuple(t);
    }
    /// A tuple of defs.
    fn def_tuple(&mut self, t: Vtuple) {
        let _ = t;
    }
    /// A tuple of defs hinted pairwise by another tuple.
    fn def_tuple_hint(&mut self, t: Vtuple, hints: Vtuple) {
        let _ = hints;
        self.def_tuple(t);
    }
    /// A set of physical registers read by the instruction.
    fn use_regset(&mut self, rs: RegSet) {
        let _ = rs;
    }
    /// A memory operand; base and index are 64-bit GP uses.
    fn use_ptr(&mut self, p: &Vptr) {
        if let Some(b) = p.base {
            self.use_reg(b, RegClass::Gpr64);
        }
        if let Some(i) = p.index {
            self.use_reg(i, RegClass::Gpr64);
        }
    }
}

/// Dispatch `v` over every operand of `inst`.
pub fn visit_operands(inst: &Vinstr, v: &mut impl OperandVisitor) {
    use RegClass::*;
    match &inst.op {
        Vop::Nop | Vop::Ud2 => {}
        Vop::Push { s } => v.use_reg(*s, Gpr64),
        Vop::Pop { d } => v.def_reg(*d, Gpr64),
        Vop::Addq { s0, s1, d, sf } => {
            v.use_reg(*s0, Gpr64);
            v.use_hint(*s1, Gpr64, *d);
            v.def_hint(*d, Gpr64, *s1);
            v.def_reg(*sf, Sf);
        }
        Vop::Addqi { s1, d, sf, .. } | Vop::Subqi { s1, d, sf, .. } => {
            v.imm();
            v.use_hint(*s1, Gpr64, *d);
            v.def_hint(*d, Gpr64, *s1);
            v.def_reg(*sf, Sf);
        }
        Vop::Shlq { s0, s1, d, sf } => {
            v.across(*s0, Gpr64);
            v.use_hint(*s1, Gpr64, *d);
            v.def_hint(*d, Gpr64, *s1);
            v.def_reg(*sf, Sf);
        }
        Vop::Lea { s, d } => {
            v.use_ptr(s);
            v.def_reg(*d, Gpr64);
        }
        Vop::Copy { s, d } => {
            v.use_hint(*s, Any, *d);
            v.def_hint(*d, Any, *s);
        }
        Vop::Copy2 { s0, s1, d0, d1 } => {
            v.use_hint(*s0, Any, *d0);
            v.use_hint(*s1, Any, *d1);
            v.def_hint(*d0, Any, *s0);
            v.def_hint(*d1, Any, *s1);
        }
        Vop::Copyargs { s, d } => {
            v.use_tuple_hint(*s, *d);
            v.def_tuple_hint(*d, *s);
        }
        Vop::Phidef { defs } => v.def_tuple(*defs),
        Vop::Phijmp { uses, .. } => v.use_tuple(*uses),
        Vop::Phijcc { sf, uses, .. } => {
            v.use_reg(*sf, Sf);
            v.use_tuple(*uses);
        }
        Vop::Jmp { .. } | Vop::Jmpi { .. } => {}
        Vop::Jcc { sf, .. } | Vop::Jcci { sf, .. } => v.use_reg(*sf, Sf),
        Vop::Call { args, .. } => {
            v.imm();
            v.use_regset(*args);
        }
        Vop::Fallback { args, .. } | Vop::Bindjmp { args, .. } => v.use_regset(*args),
        Vop::Fallbackcc { sf, args, .. } | Vop::Bindjcc { sf, args, .. } => {
            v.use_reg(*sf, Sf);
            v.use_regset(*args);
        }
        Vop::Ldimmb { d, .. } => {
            v.imm();
            v.def_reg(*d, Gpr8);
        }
        Vop::Ldimml { d, .. } => {
            v.imm();
            v.def_reg(*d, Gpr32);
        }
        Vop::Ldimmq { d, .. } => {
            v.imm();
            v.def_reg(*d, Any);
        }
        Vop::Xorb { s0, s1, d, sf } => {
            v.use_reg(*s0, Gpr8);
            v.use_hint(*s1, Gpr8, *d);
            v.def_hint(*d, Gpr8, *s1);
            v.def_reg(*sf, Sf);
        }
        Vop::Xorl { s0, s1, d, sf } => {
            v.use_reg(*s0, Gpr32);
            v.use_hint(*s1, Gpr32, *d);
            v.def_hint(*d, Gpr32, *s1);
            v.def_reg(*sf, Sf);
        }
        Vop::Load { s, d } => {
            v.use_ptr(s);
            v.def_reg(*d, Any);
        }
        Vop::Loadups { s, d } => {
            v.use_ptr(s);
            v.def_reg(*d, Simd128);
        }
        Vop::Store { s, d } => {
            v.use_reg(*s, Any);
            v.use_ptr(d);
        }
        Vop::Storeups { s, d } => {
            v.use_reg(*s, Simd128);
            v.use_ptr(d);
        }
    }
}

/// Rewrite every explicit register operand of `inst` in place. Tuple
/// operands are not visited; callers that rewrite phi data flow do so
/// through the tuple table.
pub fn map_operands(inst: &mut Vinstr, f: &mut impl FnMut(&mut Vreg, RegClass)) {
    use RegClass::*;
    let mut ptr = |p: &mut Vptr, f: &mut dyn FnMut(&mut Vreg, RegClass)| {
        if let Some(b) = &mut p.base {
            f(b, Gpr64);
        }
        if let Some(i) = &mut p.index {
            f(i, Gpr64);
        }
    };
    match &mut inst.op {
        Vop::Nop
        | Vop::Ud2
        | Vop::Jmp { .. }
        | Vop::Jmpi { .. }
        | Vop::Call { .. }
        | Vop::Fallback { .. }
        | Vop::Bindjmp { .. }
        | Vop::Copyargs { .. }
        | Vop::Phidef { .. }
        | Vop::Phijmp { .. } => {}
        Vop::Push { s } => f(s, Gpr64),
        Vop::Pop { d } => f(d, Gpr64),
        Vop::Addq { s0, s1, d, sf } | Vop::Shlq { s0, s1, d, sf } => {
            f(s0, Gpr64);
            f(s1, Gpr64);
            f(d, Gpr64);
            f(sf, Sf);
        }
        Vop::Addqi { s1, d, sf, .. } | Vop::Subqi { s1, d, sf, .. } => {
            f(s1, Gpr64);
            f(d, Gpr64);
            f(sf, Sf);
        }
        Vop::Lea { s, d } => {
            ptr(s, &mut *f);
            f(d, Gpr64);
        }
        Vop::Copy { s, d } => {
            f(s, Any);
            f(d, Any);
        }
        Vop::Copy2 { s0, s1, d0, d1 } => {
            f(s0, Any);
            f(s1, Any);
            f(d0, Any);
            f(d1, Any);
        }
        Vop::Phijcc { sf, .. } => f(sf, Sf),
        Vop::Jcc { sf, .. } | Vop::Jcci { sf, .. } => f(sf, Sf),
        Vop::Fallbackcc { sf, .. } | Vop::Bindjcc { sf, .. } => f(sf, Sf),
        Vop::Ldimmb { d, .. } => f(d, Gpr8),
        Vop::Ldimml { d, .. } => f(d, Gpr32),
        Vop::Ldimmq { d, .. } => f(d, Any),
        Vop::Xorb { s0, s1, d, sf } => {
            f(s0, Gpr8);
            f(s1, Gpr8);
            f(d, Gpr8);
            f(sf, Sf);
        }
        Vop::Xorl { s0, s1, d, sf } => {
            f(s0, Gpr32);
            f(s1, Gpr32);
            f(d, Gpr32);
            f(sf, Sf);
        }
        Vop::Load { s, d } => {
            ptr(s, &mut *f);
            f(d, Any);
        }
        Vop::Loadups { s, d } => {
            ptr(s, &mut *f);
            f(d, Simd128);
        }
        Vop::Store { s, d } => {
            f(s, Any);
            ptr(d, &mut *f);
        }
        Vop::Storeups { s, d } => {
            f(s, Simd128);
            ptr(d, &mut *f);
        }
    }
}

/// In-unit successor labels of `inst`. Hidden edges (side exits) are not
/// CFG edges and do not appear here.
pub fn succs(inst: &Vinstr) -> &[Vlabel] {
    match &inst.op {
        Vop::Jmp { target } | Vop::Phijmp { target, .. } => core::slice::from_ref(target),
        Vop::Jcc { targets, .. } | Vop::Phijcc { targets, .. } => targets,
        Vop::Jcci { target, .. } => core::slice::from_ref(target),
        _ => &[],
    }
}

/// Mutable view of `inst`'s successor labels.
pub fn succs_mut(inst: &mut Vinstr) -> &mut [Vlabel] {
    match &mut inst.op {
        Vop::Jmp { target } | Vop::Phijmp { target, .. } => core::slice::from_mut(target),
        Vop::Jcc { targets, .. } | Vop::Phijcc { targets, .. } => targets,
        Vop::Jcci { target, .. } => core::slice::from_mut(target),
        _ => &mut [],
    }
}

/// Is `inst` a legal block-ending instruction?
pub fn is_block_end(inst: &Vinstr) -> bool {
    matches!(
        inst.op,
        Vop::Jmp { .. }
            | Vop::Jcc { .. }
            | Vop::Jcci { .. }
            | Vop::Jmpi { .. }
            | Vop::Phijmp { .. }
            | Vop::Phijcc { .. }
            | Vop::Fallback { .. }
            | Vop::Bindjmp { .. }
            | Vop::Ud2
    )
}

/// Is `inst` a nop once lowered, i.e. removable without effect?
pub fn is_trivial_nop(inst: &Vinstr) -> bool {
    match &inst.op {
        Vop::Nop => true,
        Vop::Copy { s, d } => s == d,
        Vop::Copy2 { s0, s1, d0, d1 } => s0 == d0 && s1 == d1,
        Vop::Lea { s, d } => s.disp == 0 && s.base == Some(*d) && s.index.is_none(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::reg::PhysReg;
    use cranelift_entity::EntityRef;

    #[derive(Default)]
    struct Collect {
        uses: Vec<Vreg>,
        across: Vec<Vreg>,
        defs: Vec<Vreg>,
        hints: Vec<(Vreg, Vreg)>,
    }

    impl OperandVisitor for Collect {
        fn use_reg(&mut self, r: Vreg, _: RegClass) {
            self.uses.push(r);
        }
        fn use_hint(&mut self, r: Vreg, class: RegClass, hint: Vreg) {
            self.hints.push((r, hint));
            self.use_reg(r, class);
        }
        fn across(&mut self, r: Vreg, class: RegClass) {
            self.across.push(r);
            self.use_reg(r, class);
        }
        fn def_reg(&mut self, r: Vreg, _: RegClass) {
            self.defs.push(r);
        }
    }

    fn v(n: usize) -> Vreg {
        Vreg::new(crate::ir::reg::VIRT_BASE as usize + n)
    }

    #[test]
    fn addq_roles() {
        let inst = Vinstr::new(Vop::Addq {
            s0: v(0),
            s1: v(1),
            d: v(2),
            sf: Vreg::from(PhysReg::SF),
        });
        let mut c = Collect::default();
        visit_operands(&inst, &mut c);
        assert_eq!(c.uses, vec![v(0), v(1)]);
        assert_eq!(c.defs, vec![v(2), Vreg::from(PhysReg::SF)]);
        assert_eq!(c.hints, vec![(v(1), v(2))]);
        assert!(c.across.is_empty());
    }

    #[test]
    fn shlq_count_is_across() {
        let inst = Vinstr::new(Vop::Shlq {
            s0: v(0),
            s1: v(1),
            d: v(2),
            sf: Vreg::from(PhysReg::SF),
        });
        let mut c = Collect::default();
        visit_operands(&inst, &mut c);
        assert_eq!(c.across, vec![v(0)]);
    }

    #[test]
    fn ptr_operands_are_uses() {
        let inst = Vinstr::new(Vop::Store {
            s: v(0),
            d: Vptr {
                base: Some(v(1)),
                index: Some(v(2)),
                scale: 8,
                disp: 16,
                seg: Segment::Ds,
            },
        });
        let mut c = Collect::default();
        visit_operands(&inst, &mut c);
        assert_eq!(c.uses, vec![v(0), v(1), v(2)]);
        assert!(c.defs.is_empty());
    }

    #[test]
    fn map_rewrites_ptr_regs() {
        let mut inst = Vinstr::new(Vop::Load {
            s: Vptr::base_disp(v(1), 8),
            d: v(2),
        });
        map_operands(&mut inst, &mut |r, _| *r = Vreg::from(PhysReg::gp(0)));
        match &inst.op {
            Vop::Load { s, d } => {
                assert_eq!(s.base, Some(Vreg::from(PhysReg::gp(0))));
                assert_eq!(*d, Vreg::from(PhysReg::gp(0)));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn trivial_nops() {
        assert!(is_trivial_nop(&Vinstr::nop()));
        assert!(is_trivial_nop(&Vinstr::new(Vop::Copy { s: v(0), d: v(0) })));
        assert!(!is_trivial_nop(&Vinstr::new(Vop::Copy { s: v(0), d: v(1) })));
        assert!(is_trivial_nop(&Vinstr::new(Vop::Lea {
            s: Vptr::base_disp(v(3), 0),
            d: v(3),
        })));
    }
}
