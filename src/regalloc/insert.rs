//! Materializing the resolution plan: spill stores, parallel-copy
//! schedules, constant loads, and reloads, placed between instructions and
//! on edges. Also the post-insertion peephole.

use crate::ir::{
    is_trivial_nop, PhysReg, Position, Segment, SrcLoc, Vconst, Vinstr, Vop, Vptr, Vreg, Vunit,
};
use crate::moves::{do_reg_moves, MoveKind, MovePlan};
use crate::regalloc::interval::{IntervalId, Intervals};
use crate::regalloc::liveness::{sf_vreg, sp_effect};
use crate::regalloc::resolve::{CopyPlan, ResolutionPlan};
use crate::regalloc::{slot_offset, VxlsContext};

/// Build the store for one spilled interval.
fn spill_store(
    ctx: &VxlsContext,
    intervals: &Intervals,
    src: PhysReg,
    id: IntervalId,
    sp_offset: i32,
) -> Vop {
    let slot = intervals.slot_of(id).expect("spill store without a slot");
    let ptr = Vptr::base_disp(
        Vreg::from(ctx.sp),
        sp_offset + slot_offset(slot),
    );
    if !intervals[id].wide {
        assert!(!src.is_sf(), "tried to spill flags");
        Vop::Store {
            s: Vreg::from(src),
            d: ptr,
        }
    } else {
        debug_assert!(src.is_simd());
        Vop::Storeups {
            s: Vreg::from(src),
            d: ptr,
        }
    }
}

/// Insert the stores of `spills` into `code` before `code[*j]`, stamped
/// with logical position `pos`. Advances `*j` past the insertions.
fn insert_spills_at(
    ctx: &VxlsContext,
    intervals: &Intervals,
    code: &mut Vec<Vinstr>,
    j: &mut usize,
    spills: &CopyPlan,
    sp_offset: i32,
    pos: Position,
) {
    let origin = code[*j].origin;
    let mut stores = Vec::new();
    for (src, id) in spills.iter() {
        let mut inst = Vinstr::new(spill_store(ctx, intervals, src, id, sp_offset));
        inst.pos = pos;
        inst.origin = origin;
        stores.push(inst);
    }
    let n = stores.len();
    code.splice(*j..*j, stores);
    *j += n;
}

/// Insert the moves, constant loads, and reloads of `copies` into `code`
/// before `code[*j]`, stamped with logical position `pos`. Reg-to-reg
/// moves go through the parallel-copy sequencer first. Advances `*j`.
fn insert_copies_at(
    ctx: &VxlsContext,
    intervals: &Intervals,
    code: &mut Vec<Vinstr>,
    j: &mut usize,
    copies: &CopyPlan,
    sp_offset: i32,
    pos: Position,
    sf_live: bool,
) {
    let mut moves = MovePlan::new();
    let mut loads = Vec::new();

    for (dst, id) in copies.iter() {
        let ivl = &intervals[id];
        if let Some(src) = ivl.reg {
            moves.insert(dst, src);
        } else if ivl.constant {
            let val = ivl.val.expect("constant interval without a value");
            if val == Vconst::Undef {
                continue;
            }
            let d = Vreg::from(dst);
            let use_xor = val.bits() == 0 && dst.is_gp() && !sf_live;
            let op = match val {
                Vconst::Quad(v) | Vconst::Double(v) => {
                    if use_xor {
                        // 32-bit ops zero the upper bits.
                        Vop::Xorl {
                            s0: d,
                            s1: d,
                            d,
                            sf: sf_vreg(),
                        }
                    } else {
                        Vop::Ldimmq { val: v, d }
                    }
                }
                Vconst::Long(v) => {
                    if use_xor {
                        Vop::Xorl {
                            s0: d,
                            s1: d,
                            d,
                            sf: sf_vreg(),
                        }
                    } else {
                        Vop::Ldimml { val: v, d }
                    }
                }
                Vconst::Byte(v) => {
                    if use_xor {
                        Vop::Xorb {
                            s0: d,
                            s1: d,
                            d,
                            sf: sf_vreg(),
                        }
                    } else {
                        Vop::Ldimmb { val: v, d }
                    }
                }
                Vconst::ThreadLocal { disp } => Vop::Load {
                    s: Vptr::baseless(disp, Segment::Fs),
                    d,
                },
                Vconst::Undef => unreachable!(),
            };
            loads.push(op);
        } else {
            let slot = intervals.slot_of(id).expect("reload without a slot");
            let ptr = Vptr::base_disp(Vreg::from(ctx.sp), sp_offset + slot_offset(slot));
            if !ivl.wide {
                loads.push(Vop::Load {
                    s: ptr,
                    d: Vreg::from(dst),
                });
            } else {
                debug_assert!(dst.is_simd());
                loads.push(Vop::Loadups {
                    s: ptr,
                    d: Vreg::from(dst),
                });
            }
        }
    }

    let schedule = do_reg_moves(&moves, ctx.tmp);

    let origin = code[*j].origin;
    let stamp = |op: Vop, origin: SrcLoc| {
        let mut inst = Vinstr::new(op);
        inst.pos = pos;
        inst.origin = origin;
        inst
    };

    let mut insts = Vec::with_capacity(schedule.len() + loads.len());
    for how in schedule {
        let (s, d) = (Vreg::from(how.src), Vreg::from(how.dst));
        let op = match how.kind {
            MoveKind::Xchg => Vop::Copy2 {
                s0: s,
                s1: d,
                d0: d,
                d1: s,
            },
            MoveKind::Copy => Vop::Copy { s, d },
        };
        insts.push(stamp(op, origin));
    }
    for op in loads {
        insts.push(stamp(op, origin));
    }
    let n = insts.len();
    code.splice(*j..*j, insts);
    *j += n;
}

/// Mutate the instruction stream by inserting all planned spills and
/// copies. Instruction positions are meaningless afterwards.
pub fn insert_copies(
    unit: &mut Vunit,
    ctx: &VxlsContext,
    intervals: &Intervals,
    plan: &ResolutionPlan,
) {
    // The flags register's interval tells us where `ldimm 0` may become an
    // xor: only while flags are dead.
    let sf_leader = intervals.leader_of(sf_vreg());
    let sf_live = |pos: Position| match sf_leader {
        Some(id) => {
            let ivl = &intervals[id];
            !ivl.ranges.is_empty() && ivl.covers(pos)
        }
        None => false,
    };

    // Copies inside blocks.
    for &b in &ctx.blocks {
        let mut pos = ctx.block_ranges[b].start;
        let mut offset = ctx.spill_offsets[b];
        let mut j = 0;

        // Iterate the original instructions; insertions advance `j` too.
        while j < unit.blocks[b].code.len() {
            // Stores were planned for the position after the def; insert
            // them before the instruction that follows it.
            if pos > 0 {
                if let Some(spills) = plan.spills.get(&(pos - 1)) {
                    insert_spills_at(
                        ctx,
                        intervals,
                        &mut unit.blocks[b].code,
                        &mut j,
                        spills,
                        offset,
                        pos - 1,
                    );
                }
                if let Some(copies) = plan.copies.get(&(pos - 1)) {
                    insert_copies_at(
                        ctx,
                        intervals,
                        &mut unit.blocks[b].code,
                        &mut j,
                        copies,
                        offset,
                        pos - 1,
                        sf_live(pos - 1),
                    );
                }
            }
            if let Some(copies) = plan.copies.get(&pos) {
                insert_copies_at(
                    ctx,
                    intervals,
                    &mut unit.blocks[b].code,
                    &mut j,
                    copies,
                    offset,
                    pos,
                    sf_live(pos),
                );
            }
            offset -= sp_effect(&unit.blocks[b].code[j], ctx.sp);
            j += 1;
            pos += 2;
        }
    }

    // Copies on edges.
    for &b in &ctx.blocks {
        let succs: Vec<_> = unit.succs(b).to_vec();
        if succs.len() == 1 {
            // The copies go at the end of `b`, before the terminator.
            if let Some(copies) = plan.edge_copies.get(&(b, 0)) {
                let pos = ctx.block_ranges[b].end - 1;
                let offset = ctx.spill_offsets[succs[0]];
                let mut j = unit.blocks[b].code.len() - 1;
                insert_copies_at(
                    ctx,
                    intervals,
                    &mut unit.blocks[b].code,
                    &mut j,
                    copies,
                    offset,
                    pos,
                    sf_live(pos),
                );
            }
        } else {
            // The copies go at the start of each successor, which has only
            // this predecessor because critical edges were split.
            for (i, &s) in succs.iter().enumerate() {
                if let Some(copies) = plan.edge_copies.get(&(b, i as u32)) {
                    let pos = ctx.block_ranges[s].start;
                    let offset = ctx.spill_offsets[s];
                    let mut j = 0;
                    insert_copies_at(
                        ctx,
                        intervals,
                        &mut unit.blocks[s].code,
                        &mut j,
                        copies,
                        offset,
                        pos,
                        sf_live(pos),
                    );
                }
            }
        }
    }
}

/// Peephole cleanup: cancel adjacent exchange pairs that swap the same two
/// registers, then drop trivial nops and the lowered phidef markers. Runs
/// before spill-space allocation, which may change the CFG.
pub fn peephole(unit: &mut Vunit, ctx: &VxlsContext) {
    // Is `inst` a register exchange, and of which pair?
    fn match_xchg(inst: &Vinstr) -> Option<(Vreg, Vreg)> {
        match inst.op {
            Vop::Copy2 { s0, s1, d0, d1 } if s0 == d1 && s1 == d0 => Some((s0, s1)),
            _ => None,
        }
    }

    for &b in &ctx.blocks {
        let code = &mut unit.blocks[b].code;
        let mut i = 0;
        while i + 1 < code.len() {
            if let (Some((r0, r1)), Some((r2, r3))) =
                (match_xchg(&code[i]), match_xchg(&code[i + 1]))
            {
                if (r0 == r2 && r1 == r3) || (r0 == r3 && r1 == r2) {
                    // Matched a pair of exchanges that cancel out.
                    code[i].op = Vop::Nop;
                    code[i + 1].op = Vop::Nop;
                    i += 1;
                }
            }
            i += 1;
        }
        code.retain(|inst| !is_trivial_nop(inst) && !matches!(inst.op, Vop::Phidef { .. }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Abi;
    use crate::ir::Vunit;
    use crate::regalloc::VxlsContext;

    fn xchg(a: Vreg, b: Vreg) -> Vinstr {
        Vinstr::new(Vop::Copy2 {
            s0: a,
            s1: b,
            d0: b,
            d1: a,
        })
    }

    #[test]
    fn adjacent_swap_pairs_cancel() {
        let mut unit = Vunit::new();
        let a = Vreg::from(PhysReg::gp(0));
        let b = Vreg::from(PhysReg::gp(1));
        let entry = unit.entry;
        unit.blocks[entry].code.push(xchg(a, b));
        unit.blocks[entry].code.push(xchg(a, b));
        unit.blocks[entry].code.push(Vinstr::new(Vop::Jmpi { target: 0 }));

        let ctx = VxlsContext::analyze(&mut unit, Abi::host());
        peephole(&mut unit, &ctx);
        assert!(unit.blocks[entry]
            .code
            .iter()
            .all(|i| !matches!(i.op, Vop::Copy2 { .. } | Vop::Nop)));
        assert_eq!(unit.blocks[entry].code.len(), 1); // only the jmpi remains
    }

    #[test]
    fn mirrored_swap_pair_cancels_too() {
        let mut unit = Vunit::new();
        let a = Vreg::from(PhysReg::gp(2));
        let b = Vreg::from(PhysReg::gp(3));
        let entry = unit.entry;
        unit.blocks[entry].code.push(xchg(a, b));
        unit.blocks[entry].code.push(xchg(b, a));
        unit.blocks[entry].code.push(Vinstr::new(Vop::Jmpi { target: 0 }));

        let ctx = VxlsContext::analyze(&mut unit, Abi::host());
        peephole(&mut unit, &ctx);
        assert_eq!(
            unit.blocks[entry]
                .code
                .iter()
                .filter(|i| matches!(i.op, Vop::Copy2 { .. }))
                .count(),
            0
        );
    }

    #[test]
    fn lone_swap_survives_and_peephole_is_idempotent() {
        let mut unit = Vunit::new();
        let a = Vreg::from(PhysReg::gp(0));
        let b = Vreg::from(PhysReg::gp(1));
        let entry = unit.entry;
        unit.blocks[entry].code.push(xchg(a, b));
        unit.blocks[entry].code.push(Vinstr::new(Vop::Jmpi { target: 0 }));

        let ctx = VxlsContext::analyze(&mut unit, Abi::host());
        peephole(&mut unit, &ctx);
        let once = unit.blocks[entry].code.clone();
        assert_eq!(
            once.iter()
                .filter(|i| matches!(i.op, Vop::Copy2 { .. }))
                .count(),
            1
        );
        peephole(&mut unit, &ctx);
        assert_eq!(unit.blocks[entry].code, once);
    }
}
