//! Extended linear scan (XLS) register allocation.
//!
//! The algorithm follows Wimmer & Franz, "Linear Scan Register Allocation
//! on SSA Form":
//!
//! 1. Sort blocks so all predecessors of a block come before it, except
//!    loop-edge predecessors.
//! 2. Assign an even-numbered position to every instruction. Odd positions
//!    between instructions take copies and spills; each block effectively
//!    starts with an imaginary label position that carries no uses.
//! 3. Build one lifetime interval per Vreg by walking blocks and
//!    instructions in reverse, tracking liveness. An interval is a sorted
//!    list of disjoint ranges covering the positions where the Vreg must
//!    be in a register or spill slot, plus its use positions.
//! 4. Process intervals in order of start position, maintaining active and
//!    inactive sets. Prefer the register available furthest into the
//!    future; split the current interval when no register covers all of
//!    it; when nothing is free, spill the current interval or a victim.
//! 5. Rewrite every Vreg operand to its assigned physical register.
//! 6. Insert resolving copies at split positions inside blocks and on
//!    control-flow edges, as parallel copies; spilled intervals get one
//!    store after their def.
//!
//! Flags-typed Vregs are eagerly renamed to the singleton flags register
//! throughout, on the assumption that only one can be live at a time.

mod allocate;
mod build;
mod insert;
mod interval;
mod liveness;
mod print;
mod resolve;
mod spill;

pub use self::interval::{Constraint, Interval, IntervalId, Intervals, LiveRange, Use, MAX_POS};
pub use self::liveness::LiveSet;

use crate::abi::Abi;
use crate::cfg::{sort_blocks, split_critical_edges};
use crate::ir::{regs, PhysReg, Position, Vlabel, Vunit};
use cranelift_entity::SecondaryMap;
use log::{debug, log_enabled, Level};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Spill slots available per unit. Exhausting them aborts the compilation.
pub const MAX_SPILL_SLOTS: usize = 128;

/// Byte offset of a spill slot from the base of the spill area.
pub fn slot_offset(slot: u32) -> i32 {
    (slot as i32) * 8
}

/// The allocator gave up on this unit; the caller may retry compilation
/// without it.
#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum RegAllocError {
    /// The spill slot pool ran out.
    #[error("too many spills: spill slot pool exhausted")]
    TooManySpills,
    /// Register pressure at a single position (typically a phi or call
    /// site) exceeded the available registers, and the interval could not
    /// be split before its first use.
    #[error("unable to split an interval before a use that requires a register")]
    RegSpill,
}

/// Spill statistics produced by the allocation phase and consumed by
/// spill-space placement.
#[derive(Copy, Clone, Default, Debug)]
pub struct SpillInfo {
    /// Number of intervals spilled.
    pub num_spills: u32,
    /// Number of spill slots used.
    pub used_spill_slots: u32,
}

/// Runtime toggles, read once per allocation from the environment.
#[derive(Clone, Debug)]
pub struct Options {
    /// Honor hints that name pre-colored (fixed) registers.
    pub pre_coloring: bool,
    /// Honor hints between virtual registers (copy coalescing).
    pub coalescing: bool,
    /// Add deterministic-random extra spill slots to exercise the frame.
    pub stress_spill: bool,
    /// Show reserved registers in interval dumps.
    pub show_reserved: bool,
    /// Show each fixed interval in interval dumps instead of one column.
    pub show_fixed: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            pre_coloring: true,
            coalescing: true,
            stress_spill: false,
            show_reserved: false,
            show_fixed: false,
        }
    }
}

impl Options {
    /// Read the toggles from the environment: `VXLS_PRE_COLORING` and
    /// `VXLS_COALESCING` default on ("0" or "false" disables),
    /// `VXLS_STRESS_SPILL` defaults off, and the `XLS_SHOW_*` variables
    /// widen the interval dumps.
    pub fn from_env() -> Options {
        fn enabled_default_on(name: &str) -> bool {
            match std::env::var(name) {
                Ok(v) => !matches!(v.as_str(), "0" | "false"),
                Err(_) => true,
            }
        }
        fn enabled_default_off(name: &str) -> bool {
            matches!(std::env::var(name), Ok(v) if !matches!(v.as_str(), "0" | "false"))
        }
        Options {
            pre_coloring: enabled_default_on("VXLS_PRE_COLORING"),
            coalescing: enabled_default_on("VXLS_COALESCING"),
            stress_spill: enabled_default_off("VXLS_STRESS_SPILL"),
            show_reserved: std::env::var_os("XLS_SHOW_RESERVED").is_some(),
            show_fixed: std::env::var_os("XLS_SHOW_FIXED").is_some(),
        }
    }
}

/// Inputs and pre-computed analysis shared by the allocation phases;
/// constant once built.
pub struct VxlsContext {
    /// The register file.
    pub abi: Abi,
    /// The stack pointer.
    pub sp: PhysReg,
    /// Scratch register reserved for breaking parallel-copy cycles.
    pub tmp: PhysReg,
    /// Sorted blocks.
    pub blocks: Vec<Vlabel>,
    /// `[start, end)` positions of each block.
    pub block_ranges: SecondaryMap<Vlabel, LiveRange>,
    /// Per-block offset from sp to the spill area.
    pub spill_offsets: SecondaryMap<Vlabel, i32>,
    /// Per-block live-in sets.
    pub livein: SecondaryMap<Vlabel, LiveSet>,
}

impl VxlsContext {
    /// Run the pre-analysis passes over `unit`.
    ///
    /// Reserves the cycle-breaking scratch out of the allocatable SIMD
    /// set, then computes block order, positions, sp offsets, and
    /// liveness.
    pub fn analyze(unit: &mut Vunit, abi: Abi) -> VxlsContext {
        let mut abi = abi;
        let sp = regs::RSP;
        let tmp = regs::XMM15;
        abi.simd_unreserved.remove(tmp);
        abi.simd_reserved.add(tmp);
        assert!(!abi.gp_unreserved.contains(sp));
        assert!(!abi.simd_unreserved.contains(tmp));

        let blocks = sort_blocks(unit);
        let block_ranges = liveness::compute_positions(unit, &blocks);
        let spill_offsets = liveness::analyze_sp(unit, &blocks, sp);
        let livein = liveness::compute_liveness(unit, &abi, &blocks);

        VxlsContext {
            abi,
            sp,
            tmp,
            blocks,
            block_ranges,
            spill_offsets,
            livein,
        }
    }

    /// The block enclosing position `pos`.
    pub fn block_for(&self, pos: Position) -> Vlabel {
        let mut lo = 0;
        let mut hi = self.blocks.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let r = self.block_ranges[self.blocks[mid]];
            if pos < r.start {
                hi = mid;
            } else if pos >= r.end {
                lo = mid + 1;
            } else {
                return self.blocks[mid];
            }
        }
        panic!("no block contains position {}", pos);
    }
}

// Invocation counter, used only to tell trace dumps apart.
static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Allocate physical registers for every virtual register in `unit`,
/// inserting spills, reloads, copies, and spill-frame management so the
/// result is executable with the original semantics.
///
/// On `Err`, the unit is in an unspecified intermediate state and must be
/// discarded; the caller may recompile without this pass.
pub fn allocate_registers(unit: &mut Vunit, abi: &Abi) -> Result<(), RegAllocError> {
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    let opts = Options::from_env();

    split_critical_edges(unit);

    // Analysis passes.
    let ctx = VxlsContext::analyze(unit, abi.clone());

    // Build lifetime intervals and run the linear scan.
    let mut intervals = build::build_intervals(unit, &ctx);
    if log_enabled!(Level::Debug) {
        print::print_intervals(
            &format!("after building intervals {}", counter),
            unit,
            &ctx,
            &intervals,
            &opts,
        );
    }
    let mut spill_info = allocate::assign_registers(&ctx, &mut intervals, &opts)?;
    if log_enabled!(Level::Debug) {
        print::dump_intervals(&intervals, spill_info.num_spills, &opts);
    }

    // Insert lifetime-resolving copies, spills, and rematerializations,
    // and rewrite Vreg operands to the assigned registers.
    let resolution = resolve::resolve_lifetimes(unit, &ctx, &intervals);
    resolve::rename_operands(unit, &ctx, &intervals);
    insert::insert_copies(unit, &ctx, &intervals, &resolution);

    // Cleanup, then place the spill frame.
    insert::peephole(unit, &ctx);
    spill::allocate_spill_space(unit, &ctx, &mut spill_info, &opts);

    debug!(
        "allocated unit {}: {} spills, {} slots",
        counter, spill_info.num_spills, spill_info.used_spill_slots
    );
    Ok(())
}
