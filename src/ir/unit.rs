//! The unit of vasm code: a CFG of blocks of instructions.
//!
//! A `Vunit` owns everything an instruction can reference by id: blocks by
//! `Vlabel`, register tuples by `Vtuple`, and the constant pool. Instructions
//! themselves stay small by keeping variable-length operand lists in the
//! tuple side table.

use crate::ir::inst::{succs, Vinstr};
use crate::ir::reg::{Vreg, VIRT_BASE};
use cranelift_entity::{entity_impl, EntityRef, PrimaryMap};
use rustc_hash::FxHashMap;

/// A basic block label.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vlabel(u32);
entity_impl!(Vlabel, "B");

/// An id for a list of Vregs kept in the unit's side table.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vtuple(u32);
entity_impl!(Vtuple, "t");

/// Code layout area for a block. Cold blocks are laid out after all main
/// blocks so unlikely paths stay off the fast path.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Area {
    /// Hot, straight-line code.
    #[default]
    Main,
    /// Unlikely paths: side exits, deoptimization stubs.
    Cold,
}

/// A compile-time constant value.
///
/// Constants are interned per unit and bound to a Vreg; the allocator
/// rematerializes them at their uses instead of keeping them in registers.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Vconst {
    /// 64-bit immediate.
    Quad(u64),
    /// 32-bit immediate.
    Long(i32),
    /// 8-bit immediate.
    Byte(u8),
    /// Double, stored as raw bits.
    Double(u64),
    /// A thread-local slot at the given displacement off the segment base.
    ThreadLocal {
        /// Displacement off the thread-local segment base.
        disp: i32,
    },
    /// An undefined value; materializes as nothing.
    Undef,
}

impl Vconst {
    /// The raw bits of the constant, zero for the kinds that have none.
    pub fn bits(self) -> u64 {
        match self {
            Vconst::Quad(v) | Vconst::Double(v) => v,
            Vconst::Long(v) => v as u64,
            Vconst::Byte(v) => v as u64,
            Vconst::ThreadLocal { .. } | Vconst::Undef => 0,
        }
    }
}

/// A basic block.
#[derive(Clone, Default)]
pub struct Vblock {
    /// Layout area.
    pub area: Area,
    /// Instructions; the last one must be a block-end.
    pub code: Vec<Vinstr>,
}

/// A unit of vasm code.
pub struct Vunit {
    /// All blocks, reachable or not.
    pub blocks: PrimaryMap<Vlabel, Vblock>,
    /// Vreg list side table.
    pub tuples: PrimaryMap<Vtuple, Vec<Vreg>>,
    /// Interned constants.
    pub const_to_reg: FxHashMap<Vconst, Vreg>,
    /// The entry block.
    pub entry: Vlabel,
    /// Next unallocated virtual register number.
    pub next_vr: u32,
}

impl Vunit {
    /// Create a unit with an empty entry block.
    pub fn new() -> Vunit {
        let mut blocks = PrimaryMap::new();
        let entry = blocks.push(Vblock::default());
        Vunit {
            blocks,
            tuples: PrimaryMap::new(),
            const_to_reg: FxHashMap::default(),
            entry,
            next_vr: VIRT_BASE,
        }
    }

    /// Append a new empty block in `area`.
    pub fn make_block(&mut self, area: Area) -> Vlabel {
        self.blocks.push(Vblock {
            area,
            code: Vec::new(),
        })
    }

    /// Intern a Vreg list.
    pub fn make_tuple(&mut self, regs: Vec<Vreg>) -> Vtuple {
        self.tuples.push(regs)
    }

    /// Allocate a fresh virtual register.
    pub fn fresh_vreg(&mut self) -> Vreg {
        let r = Vreg::new(self.next_vr as usize);
        self.next_vr += 1;
        r
    }

    /// The Vreg bound to `c`, allocating one on first sight.
    pub fn make_const(&mut self, c: Vconst) -> Vreg {
        if let Some(&r) = self.const_to_reg.get(&c) {
            return r;
        }
        let r = self.fresh_vreg();
        self.const_to_reg.insert(c, r);
        r
    }

    /// In-unit successors of block `b`.
    pub fn succs(&self, b: Vlabel) -> &[Vlabel] {
        match self.blocks[b].code.last() {
            Some(inst) => succs(inst),
            None => &[],
        }
    }
}

impl Default for Vunit {
    fn default() -> Vunit {
        Vunit::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_interning() {
        let mut unit = Vunit::new();
        let a = unit.make_const(Vconst::Quad(7));
        let b = unit.make_const(Vconst::Quad(7));
        let c = unit.make_const(Vconst::Long(7));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.is_phys());
    }

    #[test]
    fn fresh_vregs_are_virtual() {
        let mut unit = Vunit::new();
        let v = unit.fresh_vreg();
        let w = unit.fresh_vreg();
        assert!(!v.is_phys());
        assert_ne!(v, w);
        assert_eq!(unit.next_vr, VIRT_BASE + 2);
    }
}
