//! Lifetime continuity resolution.
//!
//! After allocation, a Vreg's lifetime may be split across several
//! intervals with different registers or spill locations. This pass builds
//! a `ResolutionPlan` saying where stores, reg-to-reg copies, reloads, and
//! rematerializations must go, both between instructions and on
//! control-flow edges, and rewrites copy and phi pseudo-instructions into
//! their plain forms. Operand renaming then substitutes the assigned
//! registers into every surviving instruction.

use crate::ir::{map_operands, PhysReg, Position, RegClass, Vlabel, Vop, Vreg, Vunit};
use crate::regalloc::interval::{IntervalId, Intervals};
use crate::regalloc::liveness::sf_vreg;
use crate::regalloc::VxlsContext;
use rustc_hash::FxHashMap;

/// Identifies an out-edge: source block and successor index.
pub type EdgeKey = (Vlabel, u32);

/// The copies required at one position or edge: destination register to
/// source interval. Executed as a parallel copy.
#[derive(Clone)]
pub struct CopyPlan {
    srcs: [Option<IntervalId>; PhysReg::COUNT],
}

impl CopyPlan {
    fn new() -> CopyPlan {
        CopyPlan {
            srcs: [None; PhysReg::COUNT],
        }
    }

    /// The source interval feeding `dst`, if any.
    pub fn get(&self, dst: PhysReg) -> Option<IntervalId> {
        self.srcs[dst.index()]
    }

    /// Record `dst <- src`; a destination is written at most once.
    pub fn set(&mut self, dst: PhysReg, src: IntervalId) {
        debug_assert!(self.srcs[dst.index()].is_none());
        self.srcs[dst.index()] = Some(src);
    }

    /// Iterate `(dst, src)` pairs in destination index order.
    pub fn iter(&self) -> impl Iterator<Item = (PhysReg, IntervalId)> + '_ {
        self.srcs
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|s| (PhysReg::from_index(i), s)))
    }
}

impl Default for CopyPlan {
    fn default() -> CopyPlan {
        CopyPlan::new()
    }
}

/// Copy and spill points for resolving split lifetimes and phis.
#[derive(Default)]
pub struct ResolutionPlan {
    /// Parallel copies to insert between instructions, keyed by position.
    pub copies: FxHashMap<Position, CopyPlan>,
    /// Spill stores to insert, keyed by position.
    pub spills: FxHashMap<Position, CopyPlan>,
    /// Parallel copies on CFG edges.
    pub edge_copies: FxHashMap<EdgeKey, CopyPlan>,
}

/// Record the single spill store of `leader`, right after its def.
fn insert_spill(
    ctx: &VxlsContext,
    intervals: &Intervals,
    plan: &mut ResolutionPlan,
    leader: IntervalId,
) {
    let ivl = &intervals[leader];
    let Some(reg) = ivl.reg else {
        // An interval with no uses holds no register; there is nothing to
        // store, and nothing will ever be reloaded.
        debug_assert!(ivl.uses.is_empty());
        return;
    };
    let pos = ivl.def_pos.expect("spilled interval without a def") + 1;
    debug_assert!(pos % 2 == 1);
    debug_assert!({
        let range = ctx.block_ranges[ctx.block_for(pos)];
        pos - 1 >= range.start && pos + 1 < range.end
    });
    plan.spills.entry(pos).or_default().set(reg, leader);
}

/// Insert spills and copies connecting adjacent sub-intervals split between
/// instructions.
fn resolve_splits(ctx: &VxlsContext, intervals: &Intervals, plan: &mut ResolutionPlan) {
    for leader in intervals.ids() {
        if intervals[leader].parent.is_some() {
            continue;
        }
        if intervals[leader].slot.is_some() {
            insert_spill(ctx, intervals, plan, leader);
        }

        let mut i1 = leader;
        while let Some(i2) = intervals[i1].next.expand() {
            let pos = intervals[i2].start();
            let connected = intervals[i1].end() == pos; // else: lifetime hole
            let load_needed = intervals[i2].reg.is_some();
            let distinct = intervals[i2].reg != intervals[i1].reg;
            if connected && load_needed && distinct {
                let range = ctx.block_ranges[ctx.block_for(pos)];
                if pos % 2 == 0 {
                    // An even position needing a copy must be a block edge;
                    // the edge resolution below handles it.
                    debug_assert!(range.start == pos);
                } else {
                    debug_assert!(pos > range.start);
                    if pos + 1 != range.end {
                        let reg = intervals[i2].reg.expect("checked above");
                        plan.copies.entry(pos).or_default().set(reg, i1);
                    }
                    // else: the copy belongs on the successor edge.
                }
            }
            i1 = i2;
        }
    }
}

/// Rewrite copy/copy2/copyargs into nops, recording their moves as
/// parallel copies at the same position.
fn lower_copies(
    unit: &mut Vunit,
    ctx: &VxlsContext,
    intervals: &Intervals,
    plan: &mut ResolutionPlan,
) {
    // Record a lifetime-resolving copy from `s` to `d` without touching
    // the instruction stream.
    let lower = |plan: &mut ResolutionPlan, pos: Position, s: Vreg, d: Vreg| {
        let mut i1 = intervals.leader_of(s).expect("copy source has an interval");
        let i2 = intervals.leader_of(d).expect("copy dest has an interval");
        debug_assert!(intervals[i2].parent.is_none());
        debug_assert!(intervals[i2].fixed() || intervals[i2].def_pos == Some(pos));

        if !intervals[i1].fixed() {
            i1 = intervals
                .child_at(i1, pos)
                .expect("copy source not live at copy");
        }

        if intervals[i2].reg != intervals[i1].reg {
            let dst = intervals[i2].reg.expect("copy dest without a register");
            debug_assert!(plan.copies.get(&pos).map_or(true, |p| p.get(dst).is_none()));
            plan.copies.entry(pos).or_default().set(dst, i1);
        }
    };

    for &b in &ctx.blocks {
        let mut pos = ctx.block_ranges[b].start;
        for inst in &mut unit.blocks[b].code {
            match inst.op.clone() {
                Vop::Copyargs { s, d } => {
                    let uses = &unit.tuples[s];
                    let defs = &unit.tuples[d];
                    debug_assert_eq!(uses.len(), defs.len());
                    for (&s, &d) in uses.iter().zip(defs.iter()) {
                        lower(&mut *plan, pos, s, d);
                    }
                    inst.op = Vop::Nop;
                }
                Vop::Copy2 { s0, s1, d0, d1 } => {
                    lower(&mut *plan, pos, s0, d0);
                    lower(&mut *plan, pos, s1, d1);
                    inst.op = Vop::Nop;
                }
                Vop::Copy { s, d } => {
                    lower(&mut *plan, pos, s, d);
                    inst.op = Vop::Nop;
                }
                _ => {}
            }
            pos += 2;
        }
    }
}

/// The dest tuple of the phidef heading block `b`.
fn find_phi_defs(unit: &Vunit, b: Vlabel) -> &[Vreg] {
    match unit.blocks[b].code.first() {
        Some(inst) => match &inst.op {
            Vop::Phidef { defs } => &unit.tuples[*defs],
            _ => panic!("phi target {} does not start with phidef", b),
        },
        None => panic!("phi target {} is empty", b),
    }
}

/// Register copy resolutions for phis and live-in sets on edges, rewriting
/// phi jumps to plain jumps.
fn resolve_edges(
    unit: &mut Vunit,
    ctx: &VxlsContext,
    intervals: &Intervals,
    plan: &mut ResolutionPlan,
) {
    let add_phi_edge_copies = |plan: &mut ResolutionPlan,
                               unit: &Vunit,
                               block: Vlabel,
                               target: Vlabel,
                               target_index: u32,
                               uses: &[Vreg]| {
        let p1 = ctx.block_ranges[block].end - 2;
        let defs = find_phi_defs(unit, target);
        debug_assert_eq!(uses.len(), defs.len());

        for (&s, &d) in uses.iter().zip(defs.iter()) {
            let mut i1 = intervals.leader_of(s).expect("phi source has an interval");
            let i2 = intervals.leader_of(d).expect("phi dest has an interval");
            debug_assert!(intervals[i2].parent.is_none());

            if !intervals[i1].fixed() {
                i1 = intervals
                    .child_at(i1, p1)
                    .expect("phi source not live at the jump");
            }

            if intervals[i2].reg != intervals[i1].reg {
                let dst = intervals[i2].reg.expect("phi dest without a register");
                let edge = plan.edge_copies.entry((block, target_index)).or_default();
                debug_assert!(edge.get(dst).is_none());
                edge.set(dst, i1);
            }
        }
    };

    for &b1 in &ctx.blocks {
        let p1 = ctx.block_ranges[b1].end - 2;

        // Phis become plain jumps; their data flow moves to the edges.
        let last = unit.blocks[b1]
            .code
            .last()
            .expect("sorted block with no terminator");
        match last.op.clone() {
            Vop::Phijmp { uses, target } => {
                let uses = unit.tuples[uses].clone();
                add_phi_edge_copies(&mut *plan, unit, b1, target, 0, &uses);
                unit.blocks[b1].code.last_mut().unwrap().op = Vop::Jmp { target };
            }
            Vop::Phijcc {
                cc,
                sf,
                uses,
                targets,
            } => {
                let uses = unit.tuples[uses].clone();
                add_phi_edge_copies(&mut *plan, unit, b1, targets[0], 0, &uses);
                add_phi_edge_copies(&mut *plan, unit, b1, targets[1], 1, &uses);
                unit.blocks[b1].code.last_mut().unwrap().op = Vop::Jcc { cc, sf, targets };
            }
            _ => {}
        }

        // Live-in values must arrive where the successor expects them.
        let succs: Vec<Vlabel> = unit.succs(b1).to_vec();
        for (i, &b2) in succs.iter().enumerate() {
            let p2 = ctx.block_ranges[b2].start;

            for vr in ctx.livein[b2].iter() {
                let leader = intervals.leader_of(vr).expect("live-in without interval");
                if intervals[leader].fixed() {
                    continue;
                }

                let mut i1 = None;
                let mut i2 = None;
                let mut next = Some(leader);
                while let Some(id) = next {
                    if i1.is_some() && i2.is_some() {
                        break;
                    }
                    let ivl = &intervals[id];
                    if ivl.covers(p1) {
                        i1 = Some(id);
                    }
                    if ivl.covers(p2) {
                        i2 = Some(id);
                    }
                    next = ivl.next.expand();
                }
                // i2 has no register if the value is spilled or constant
                // across the edge; reloads happen at its uses instead. In
                // that case i1 may not exist at all: a rematerializable
                // constant can have a lifetime hole at the edge.
                let i2 = i2.expect("live-in not covered in successor");
                if let Some(dst) = intervals[i2].reg {
                    let i1 = i1.expect("live-in not covered in predecessor");
                    if intervals[i1].reg != Some(dst) {
                        let edge = plan.edge_copies.entry((b1, i as u32)).or_default();
                        debug_assert!(edge.get(dst).is_none());
                        edge.set(dst, i1);
                    }
                }
            }
        }
    }
}

/// Account for every point where a copy or spill is needed to reconstruct
/// continuity across interval splits and control-flow edges.
pub fn resolve_lifetimes(
    unit: &mut Vunit,
    ctx: &VxlsContext,
    intervals: &Intervals,
) -> ResolutionPlan {
    let mut plan = ResolutionPlan::default();
    resolve_splits(ctx, intervals, &mut plan);
    lower_copies(unit, ctx, intervals, &mut plan);
    resolve_edges(unit, ctx, intervals, &mut plan);
    plan
}

/// Rewrite every virtual register operand to its assigned physical
/// register. Flags operands all become the singleton flags register; phi
/// and copy operands were already lowered by resolution.
pub fn rename_operands(unit: &mut Vunit, ctx: &VxlsContext, intervals: &Intervals) {
    for &b in &ctx.blocks {
        let mut pos = ctx.block_ranges[b].start;
        for inst in &mut unit.blocks[b].code {
            map_operands(inst, &mut |r, class| {
                if class == RegClass::Sf {
                    *r = sf_vreg();
                    return;
                }
                if r.is_phys() {
                    return;
                }
                let leader = intervals.leader_of(*r).expect("operand has an interval");
                let child = intervals
                    .child_at(leader, pos)
                    .expect("operand not used at its own position");
                let reg = intervals[child]
                    .reg
                    .expect("operand's interval has no register");
                debug_assert!(match class {
                    RegClass::Gpr8 | RegClass::Gpr16 | RegClass::Gpr32 | RegClass::Gpr64 =>
                        reg.is_gp(),
                    RegClass::SimdDbl | RegClass::Simd128 => reg.is_simd(),
                    RegClass::Sf => reg.is_sf(),
                    RegClass::Any => !reg.is_sf(),
                });
                *r = Vreg::from(reg);
            });
            pos += 2;
        }
    }
}
