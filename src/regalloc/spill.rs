//! Spill-space placement.
//!
//! If the unit used any spill slots, allocate and free the spill frame
//! where appropriate: allocation happens right before it is first needed,
//! freeing happens before any instruction that exits the unit. Side exits
//! with hidden edges (`fallbackcc`, `bindjcc`, `jcci`) that execute while
//! the frame is live must first be made explicit so the freeing `lea` has
//! an edge to live on; that deoptimization is why allocation is pushed as
//! late as possible.

use crate::cfg::DataflowWorklist;
use crate::ir::{
    visit_operands, Area, OperandVisitor, PhysReg, RegClass, RegSet, Vinstr, Vlabel, Vop, Vptr,
    Vreg, Vunit,
};
use crate::regalloc::{slot_offset, Options, SpillInfo, VxlsContext};
use cranelift_entity::packed_option::ReservedValue;
use cranelift_entity::SecondaryMap;
use log::trace;
use std::sync::atomic::{AtomicU64, Ordering};

/// State of the spill frame at a program point. Only transitions to higher
/// states are legal, and states merge with `max`, so the forward analysis
/// below converges.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
enum SpillState {
    /// Nothing known yet; all block in-states start here.
    #[default]
    Uninit,
    /// No frame needed yet; it is safe to allocate after this point.
    NoSpill,
    /// The frame is needed at or before this point.
    NeedSpill,
}
use SpillState::*;

/// In/out state per block.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
struct SpillStates {
    in_: SpillState,
    out: SpillState,
}

/// Must the spill frame exist before this instruction runs? Keeping it
/// simple: any instruction that reads, writes, pushes, or pops `sp`.
fn instr_needs_spill(inst: &Vinstr, sp: PhysReg) -> bool {
    if matches!(inst.op, Vop::Push { .. } | Vop::Pop { .. }) {
        return true;
    }
    struct SpFinder {
        sp: Vreg,
        found: bool,
    }
    impl OperandVisitor for SpFinder {
        fn use_reg(&mut self, r: Vreg, _: RegClass) {
            self.found |= r == self.sp;
        }
        fn def_reg(&mut self, r: Vreg, _: RegClass) {
            self.found |= r == self.sp;
        }
        fn use_regset(&mut self, rs: RegSet) {
            self.found |= rs.contains(self.sp.phys().unwrap());
        }
    }
    let mut f = SpFinder {
        sp: Vreg::from(sp),
        found: false,
    };
    visit_operands(inst, &mut f);
    f.found
}

/// The state required coming into `inst`, given the state before it.
fn instr_in_state(inst: &Vinstr, prev: SpillState, sp: PhysReg) -> SpillState {
    match prev {
        Uninit => unreachable!("state must be initialized before the walk"),
        NoSpill => {
            if instr_needs_spill(inst, sp) {
                NeedSpill
            } else {
                NoSpill
            }
        }
        NeedSpill => NeedSpill,
    }
}

/// Merge `src` into `dst`, returning whether `dst` changed.
fn merge_spill_states(dst: &mut SpillState, src: SpillState) -> bool {
    debug_assert!(src != Uninit);
    let old = *dst;
    *dst = (*dst).max(src);
    *dst != old
}

/// `process_spill_exits` can leave a `jcc` mid-block. Split the block after
/// each such jcc so the unit is well-formed again: the instructions after
/// it move to a fresh block that becomes the jcc's fallthrough target.
fn fixup_block_jumps(unit: &mut Vunit, label: Vlabel) {
    let orig = std::mem::take(&mut unit.blocks[label].code);
    let mut cur = label;
    for inst in orig {
        let needs_split = matches!(
            inst.op,
            Vop::Jcc { targets, .. } if targets[0] == Vlabel::reserved_value()
        );
        unit.blocks[cur].code.push(inst);
        if needs_split {
            let area = unit.blocks[cur].area;
            let next = unit.make_block(area);
            match &mut unit.blocks[cur].code.last_mut().unwrap().op {
                Vop::Jcc { targets, .. } => targets[0] = next,
                _ => unreachable!(),
            }
            cur = next;
        }
    }
}

/// Walk `label`, undoing side-exit fusions that happen while the spill
/// frame is live: each such exit becomes a `jcc` to a new cold block that
/// frees the frame and then performs the unconditional form of the exit.
fn process_spill_exits(
    unit: &mut Vunit,
    label: Vlabel,
    mut state: SpillState,
    free: &Vinstr,
    sp: PhysReg,
) {
    let mut need_fixup = false;

    let mut i = 0;
    while i < unit.blocks[label].code.len() {
        let inst = &unit.blocks[label].code[i];
        state = instr_in_state(inst, state, sp);

        if state < NeedSpill
            || !matches!(
                inst.op,
                Vop::Fallbackcc { .. } | Vop::Bindjcc { .. } | Vop::Jcci { .. }
            )
        {
            i += 1;
            continue;
        }

        trace!("breaking out side exit in {}", label);
        let origin = inst.origin;
        let op = inst.op.clone();
        let cold = unit.make_block(Area::Cold);

        let mut free_inst = free.clone();
        free_inst.origin = origin;
        unit.blocks[cold].code.push(free_inst);

        let new_op = match op {
            Vop::Fallbackcc {
                cc,
                sf,
                target,
                args,
            } => {
                unit.blocks[cold]
                    .code
                    .push(Vinstr::new(Vop::Fallback { target, args }));
                need_fixup = true;
                Vop::Jcc {
                    cc,
                    sf,
                    targets: [Vlabel::reserved_value(), cold],
                }
            }
            Vop::Bindjcc {
                cc,
                sf,
                target,
                args,
            } => {
                unit.blocks[cold]
                    .code
                    .push(Vinstr::new(Vop::Bindjmp { target, args }));
                need_fixup = true;
                Vop::Jcc {
                    cc,
                    sf,
                    targets: [Vlabel::reserved_value(), cold],
                }
            }
            Vop::Jcci {
                cc,
                sf,
                target,
                taken,
            } => {
                // jcci terminates its block with an in-unit fallthrough, so
                // the rewritten jcc keeps that target; no fixup needed.
                unit.blocks[cold]
                    .code
                    .push(Vinstr::new(Vop::Jmpi { target: taken }));
                Vop::Jcc {
                    cc,
                    sf,
                    targets: [target, cold],
                }
            }
            _ => unreachable!(),
        };
        unit.blocks[cold].code.last_mut().unwrap().origin = origin;

        let inst = &mut unit.blocks[label].code[i];
        inst.op = new_op;
        i += 1;
    }

    if need_fixup {
        fixup_block_jumps(unit, label);
    }
}

// Deterministic stress randomness: every compilation nudges the generator,
// but a fixed seed keeps whole-process runs reproducible.
static STRESS_RNG: AtomicU64 = AtomicU64::new(0xface_b00c);

fn stress_extra_slots() -> u32 {
    let mut x = STRESS_RNG.load(Ordering::Relaxed);
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    STRESS_RNG.store(x, Ordering::Relaxed);
    1 + (x % 7) as u32
}

/// Place spill-frame allocation and freeing.
pub fn allocate_spill_space(
    unit: &mut Vunit,
    ctx: &VxlsContext,
    info: &mut SpillInfo,
    opts: &Options,
) {
    if opts.stress_spill && ctx.abi.can_spill {
        let extra = stress_extra_slots();
        trace!("stress spill on; adding {} extra slots", extra);
        info.used_spill_slots += extra;
    }
    if info.used_spill_slots == 0 {
        return;
    }
    assert!(ctx.abi.can_spill);

    // Keep the frame a multiple of two slots so alignment stays trivial.
    if info.used_spill_slots % 2 == 1 {
        info.used_spill_slots += 1;
    }
    trace!("allocating {} spill slots", info.used_spill_slots);

    let spill_size = slot_offset(info.used_spill_slots);
    let spv = Vreg::from(ctx.sp);
    // Frame adjustment is done with lea, which is safe to insert even
    // where flags are live.
    let alloc = Vinstr::new(Vop::Lea {
        s: Vptr::base_disp(spv, -spill_size),
        d: spv,
    });
    let free = Vinstr::new(Vop::Lea {
        s: Vptr::base_disp(spv, spill_size),
        d: spv,
    });

    let mut rpo_ids = SecondaryMap::<Vlabel, u32>::new();
    for (i, &b) in ctx.blocks.iter().enumerate() {
        rpo_ids[b] = i as u32;
    }

    // Forward analysis to a fixpoint: out-states propagate to successor
    // in-states; states only ever increase.
    let mut states = SecondaryMap::<Vlabel, SpillStates>::new();
    states[unit.entry].in_ = NoSpill;
    let mut worklist = DataflowWorklist::new(ctx.blocks.len());
    worklist.push(0);

    while let Some(i) = worklist.pop() {
        let label = ctx.blocks[i as usize];
        let mut state = states[label].in_;

        if state < NeedSpill {
            for inst in &unit.blocks[label].code {
                state = instr_in_state(inst, state, ctx.sp);
                if state == NeedSpill {
                    break;
                }
            }
        }
        states[label].out = state;

        for &s in unit.succs(label) {
            let mut in_ = states[s].in_;
            if merge_spill_states(&mut in_, state) {
                states[s].in_ = in_;
                worklist.push(rpo_ids[s]);
            }
        }
    }

    // Single mutation pass.
    for &label in &ctx.blocks {
        let state = states[label];

        // NoSpill in, NeedSpill out: some instruction inside needs the
        // frame; allocate right before the first one that does.
        if state.in_ == NoSpill && state.out == NeedSpill {
            let mut walk = NoSpill;
            for i in 0..unit.blocks[label].code.len() {
                walk = instr_in_state(&unit.blocks[label].code[i], walk, ctx.sp);
                if walk == NeedSpill {
                    trace!("alloc spill inside {}", label);
                    let mut inst = alloc.clone();
                    inst.origin = unit.blocks[label].code[i].origin;
                    unit.blocks[label].code.insert(i, inst);
                    break;
                }
            }
        }

        // Allocate on edges from NoSpill out-states to NeedSpill
        // in-states, prepended to the terminator.
        if state.out == NoSpill {
            let succs: Vec<_> = unit.succs(label).to_vec();
            for s in succs {
                if states[s].in_ == NeedSpill {
                    trace!("alloc spill on edge {} -> {}", label, s);
                    let n = unit.blocks[label].code.len();
                    let mut inst = alloc.clone();
                    inst.origin = unit.blocks[label].code[n - 1].origin;
                    unit.blocks[label].code.insert(n - 1, inst);
                }
            }
        }

        // A NeedSpill out-state with no successors exits the unit: free the
        // frame before the terminator. ud2 keeps the frame so crash dumps
        // still see the slots.
        if state.out == NeedSpill && unit.succs(label).is_empty() {
            let n = unit.blocks[label].code.len();
            if !matches!(unit.blocks[label].code[n - 1].op, Vop::Ud2) {
                trace!("free spill before exit of {}", label);
                let mut inst = free.clone();
                inst.origin = unit.blocks[label].code[n - 1].origin;
                unit.blocks[label].code.insert(n - 1, inst);
            }
        }

        // Anything that ends non-NoSpill may hide side exits under a live
        // frame; deoptimize them.
        if state.out != NoSpill {
            process_spill_exits(unit, label, state.in_, &free, ctx.sp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lattice_merges_upward() {
        let mut s = NoSpill;
        assert!(!merge_spill_states(&mut s, NoSpill));
        assert!(merge_spill_states(&mut s, NeedSpill));
        assert_eq!(s, NeedSpill);
        assert!(!merge_spill_states(&mut s, NoSpill));
        assert_eq!(s, NeedSpill);
    }

    #[test]
    fn push_needs_spill_space() {
        let sp = crate::ir::regs::RSP;
        let push = Vinstr::new(Vop::Push {
            s: Vreg::from(PhysReg::gp(0)),
        });
        assert!(instr_needs_spill(&push, sp));
        let store = Vinstr::new(Vop::Store {
            s: Vreg::from(PhysReg::gp(0)),
            d: Vptr::base_disp(Vreg::from(sp), 8),
        });
        assert!(instr_needs_spill(&store, sp));
        let nop = Vinstr::nop();
        assert!(!instr_needs_spill(&nop, sp));
        let other = Vinstr::new(Vop::Store {
            s: Vreg::from(PhysReg::gp(0)),
            d: Vptr::base_disp(Vreg::from(PhysReg::gp(1)), 8),
        });
        assert!(!instr_needs_spill(&other, sp));
    }

    #[test]
    fn stress_slots_in_range() {
        for _ in 0..32 {
            let n = stress_extra_slots();
            assert!((1..=7).contains(&n));
        }
    }
}
