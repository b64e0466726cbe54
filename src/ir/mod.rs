//! The vasm intermediate representation.
//!
//! vasm is a virtual assembly language: machine-shaped instructions over an
//! unbounded supply of virtual registers, organized as a CFG of basic
//! blocks. Register allocation turns a unit of vasm into executable form by
//! rewriting every virtual register to a physical one.

mod inst;
mod reg;
mod unit;

pub use self::inst::{
    is_block_end, is_trivial_nop, map_operands, succs, succs_mut, visit_operands, Addr, Cond,
    OperandVisitor, Position, Segment, SideExit, SrcLoc, Vinstr, Vop, Vptr,
};
pub use self::reg::{
    regs, PhysReg, RegClass, RegSet, RegSetIter, Vreg, NUM_GP, NUM_PHYS, NUM_SIMD, VIRT_BASE,
};
pub use self::unit::{Area, Vblock, Vconst, Vlabel, Vtuple, Vunit};
