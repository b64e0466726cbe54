//! Register allocation for the vasm virtual-assembly IR.
//!
//! A vasm unit arrives from instruction selection with operands drawn from
//! an unbounded supply of virtual registers. [`allocate_registers`]
//! rewrites every operand to a concrete physical register, inserting
//! spills, reloads, and parallel copies, and placing allocation and
//! freeing of the spill frame, so the result is executable machine code
//! with the original semantics.
//!
//! The allocator is an extended linear scan (XLS): lifetime intervals with
//! live-range holes are built by a backward walk over the liveness
//! analysis, split on demand during the scan, and reconnected afterwards
//! by a resolution pass that works in terms of parallel copies.

#![deny(missing_docs)]

pub mod abi;
pub mod cfg;
pub mod ir;
pub mod moves;
pub mod regalloc;

pub use crate::abi::Abi;
pub use crate::regalloc::{allocate_registers, RegAllocError};
