//! Interval construction: a single bottom-up walk over the sorted blocks
//! that turns the liveness sets into precise lifetime intervals with
//! live-range holes, use positions, constraints, and hints.

use crate::abi::get_effects;
use crate::ir::{
    visit_operands, OperandVisitor, Position, RegClass, RegSet, Vop, Vreg, Vtuple, Vunit,
};
use crate::regalloc::interval::{add_range, Constraint, Intervals, LiveRange, Use};
use crate::regalloc::liveness::{sf_vreg, LiveSet};
use crate::regalloc::VxlsContext;
use cranelift_entity::PrimaryMap;
use log::trace;

/// Visits the defs of one instruction: ends the live range, records the def
/// site with its constraint and hint.
struct DefVisitor<'a> {
    intervals: &'a mut Intervals,
    tuples: &'a PrimaryMap<Vtuple, Vec<Vreg>>,
    live: &'a mut LiveSet,
    pos: Position,
}

impl DefVisitor<'_> {
    fn def(&mut self, r: Vreg, kind: Constraint, hint: Option<Vreg>, wide: bool) {
        let r = if kind == Constraint::Sf { sf_vreg() } else { r };
        let id = self.intervals.get_or_create(r);
        let ivl = &mut self.intervals[id];
        if self.live.contains(r) {
            self.live.remove(r);
            // The value was live below: the def truncates the front of the
            // range the block walk opened.
            ivl.ranges.last_mut().expect("live vreg with no range").start = self.pos;
        } else {
            // Dead def: a singleton range covering just the instruction.
            add_range(
                ivl,
                LiveRange {
                    start: self.pos,
                    end: self.pos + 1,
                },
            );
        }
        if !ivl.fixed() {
            ivl.uses.push(Use {
                kind,
                pos: self.pos,
                hint,
            });
            ivl.wide |= wide;
            ivl.def_pos = Some(self.pos);
        }
    }
}

impl OperandVisitor for DefVisitor<'_> {
    fn def_reg(&mut self, r: Vreg, class: RegClass) {
        self.def(r, Constraint::of(class), None, class.is_wide());
    }
    fn def_hint(&mut self, r: Vreg, class: RegClass, hint: Vreg) {
        self.def(r, Constraint::of(class), Some(hint), class.is_wide());
    }
    fn def_tuple(&mut self, t: Vtuple) {
        for i in 0..self.tuples[t].len() {
            let r = self.tuples[t][i];
            self.def(r, Constraint::Any, None, false);
        }
    }
    fn def_tuple_hint(&mut self, t: Vtuple, hints: Vtuple) {
        debug_assert_eq!(self.tuples[t].len(), self.tuples[hints].len());
        for i in 0..self.tuples[t].len() {
            let r = self.tuples[t][i];
            let h = self.tuples[hints][i];
            self.def(r, Constraint::Any, Some(h), false);
        }
    }
}

/// Visits the uses of one instruction: extends the live range up from the
/// block start and records the use site.
struct UseVisitor<'a> {
    intervals: &'a mut Intervals,
    tuples: &'a PrimaryMap<Vtuple, Vec<Vreg>>,
    live: &'a mut LiveSet,
    /// `[block.start, pos]`: the range a use keeps its value live over.
    range: LiveRange,
    /// The instruction lowers to a copy plan that can read constants and
    /// spill slots directly.
    copy_src: bool,
    /// phijcc sources are copy-plan sources too, except the flags operand.
    phijcc: bool,
}

impl UseVisitor<'_> {
    fn use_(&mut self, r: Vreg, mut kind: Constraint, end: Position, hint: Option<Vreg>) {
        let r = if kind == Constraint::Sf { sf_vreg() } else { r };
        self.live.insert(r);
        let id = self.intervals.get_or_create(r);
        let ivl = &mut self.intervals[id];
        add_range(
            ivl,
            LiveRange {
                start: self.range.start,
                end,
            },
        );
        if !ivl.fixed() {
            if self.copy_src || (self.phijcc && kind != Constraint::Sf) {
                kind = Constraint::CopySrc;
            }
            ivl.uses.push(Use {
                kind,
                pos: self.range.end,
                hint,
            });
        }
    }

    fn across_regset(&mut self, rs: RegSet) {
        for r in rs {
            self.use_(Vreg::from(r), Constraint::Any, self.range.end + 1, None);
        }
    }
}

impl OperandVisitor for UseVisitor<'_> {
    fn use_reg(&mut self, r: Vreg, class: RegClass) {
        self.use_(r, Constraint::of(class), self.range.end, None);
    }
    fn use_hint(&mut self, r: Vreg, class: RegClass, hint: Vreg) {
        self.use_(r, Constraint::of(class), self.range.end, Some(hint));
    }
    /// A use-across stays live through the instruction so it cannot share a
    /// register with any def of the same instruction. (Harmless, if
    /// pessimistic, when source and dest are the same Vreg.)
    fn across(&mut self, r: Vreg, class: RegClass) {
        debug_assert!(class != RegClass::Sf);
        self.use_(r, Constraint::of(class), self.range.end + 1, None);
    }
    fn use_tuple(&mut self, t: Vtuple) {
        for i in 0..self.tuples[t].len() {
            let r = self.tuples[t][i];
            self.use_(r, Constraint::Any, self.range.end, None);
        }
    }
    fn use_tuple_hint(&mut self, t: Vtuple, hints: Vtuple) {
        debug_assert_eq!(self.tuples[t].len(), self.tuples[hints].len());
        for i in 0..self.tuples[t].len() {
            let r = self.tuples[t][i];
            let h = self.tuples[hints][i];
            self.use_(r, Constraint::Any, self.range.end, Some(h));
        }
    }
    fn use_regset(&mut self, rs: RegSet) {
        for r in rs {
            self.use_(Vreg::from(r), Constraint::Any, self.range.end, None);
        }
    }
}

/// Compute the lifetime interval and use positions of every Vreg by walking
/// the code bottom-up once.
pub fn build_intervals(unit: &Vunit, ctx: &VxlsContext) -> Intervals {
    let mut intervals = Intervals::new();

    for &b in ctx.blocks.iter().rev() {
        let block = &unit.blocks[b];

        // The initial live set is the union of the successor live-ins.
        let mut live = LiveSet::with_capacity(unit.next_vr);
        for &s in unit.succs(b) {
            live.union_with(&ctx.livein[s]);
        }

        // Everything live out of the block gets a range covering the whole
        // block; defs found below will truncate it.
        let block_range = ctx.block_ranges[b];
        for r in live.iter() {
            let id = intervals.get_or_create(r);
            add_range(&mut intervals[id], block_range);
        }

        // Visit instructions bottom-up, adding uses and ranges.
        let mut pos = block_range.end;
        for inst in block.code.iter().rev() {
            pos -= 2;
            let fx = get_effects(&ctx.abi, inst);

            let mut dv = DefVisitor {
                intervals: &mut intervals,
                tuples: &unit.tuples,
                live: &mut live,
                pos,
            };
            visit_operands(inst, &mut dv);
            for r in fx.defs {
                dv.def(Vreg::from(r), Constraint::Any, None, false);
            }

            let copy_src = matches!(
                inst.op,
                Vop::Copy { .. } | Vop::Copy2 { .. } | Vop::Copyargs { .. } | Vop::Phijmp { .. }
            );
            let mut uv = UseVisitor {
                intervals: &mut intervals,
                tuples: &unit.tuples,
                live: &mut live,
                range: LiveRange {
                    start: block_range.start,
                    end: pos,
                },
                copy_src,
                phijcc: matches!(inst.op, Vop::Phijcc { .. }),
            };
            visit_operands(inst, &mut uv);
            for r in fx.uses {
                uv.use_(Vreg::from(r), Constraint::Any, pos, None);
            }
            uv.across_regset(fx.across);
        }

        // The backward walk must reproduce the dataflow's live-in set.
        assert!(
            live == ctx.livein[b],
            "liveness mismatch in {}: walked {:?}, dataflow {:?}",
            b,
            live,
            ctx.livein[b]
        );
    }

    // Ranges and uses were produced in reverse order; put them right.
    for id in intervals.ids() {
        let ivl = &mut intervals[id];
        debug_assert!(!ivl.ranges.is_empty());
        ivl.ranges.reverse();
        ivl.uses.reverse();
    }

    // Constants are defined "everywhere": snap the earliest range down to
    // position zero and mark the interval for rematerialization.
    for (&c, &r) in &unit.const_to_reg {
        if let Some(id) = intervals.leader_of(r) {
            let ivl = &mut intervals[id];
            ivl.ranges.first_mut().expect("constant with no range").start = 0;
            ivl.constant = true;
            ivl.val = Some(c);
        }
    }

    trace!("built intervals for {} vregs", intervals.ids().len());

    if cfg!(debug_assertions) {
        // Only constants and physical registers may be live into the entry.
        for r in ctx.livein[unit.entry].iter() {
            let id = intervals.leader_of(r).expect("live-in vreg with no interval");
            let ivl = &intervals[id];
            debug_assert!(ivl.constant || ivl.fixed(), "{} live into entry", r);
        }
        for id in intervals.ids() {
            let ivl = &intervals[id];
            for w in ivl.uses.windows(2) {
                debug_assert!(w[1].pos >= w[0].pos); // monotonic
            }
            for w in ivl.ranges.windows(2) {
                debug_assert!(w[0].end > w[0].start); // no empty ranges
                debug_assert!(w[1].start > w[0].end); // strictly separated
            }
            if let Some(last) = ivl.ranges.last() {
                debug_assert!(last.end > last.start);
            }
        }
    }

    intervals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Abi;
    use crate::ir::{Vconst, Vinstr};

    fn analyzed(mut unit: Vunit) -> (Vunit, VxlsContext) {
        let ctx = VxlsContext::analyze(&mut unit, Abi::host());
        (unit, ctx)
    }

    #[test]
    fn straight_line_intervals() {
        let mut unit = Vunit::new();
        let v0 = unit.fresh_vreg();
        let entry = unit.entry;
        unit.blocks[entry]
            .code
            .push(Vinstr::new(Vop::Ldimmq { val: 7, d: v0 })); // pos 0
        unit.blocks[entry]
            .code
            .push(Vinstr::new(Vop::Push { s: v0 })); // pos 2
        unit.blocks[entry]
            .code
            .push(Vinstr::new(Vop::Jmpi { target: 0 })); // pos 4
        let (unit, ctx) = analyzed(unit);
        let intervals = build_intervals(&unit, &ctx);

        let id = intervals.leader_of(v0).unwrap();
        let ivl = &intervals[id];
        assert_eq!(ivl.start(), 0);
        assert_eq!(ivl.end(), 2);
        assert_eq!(ivl.def_pos, Some(0));
        let poss: Vec<_> = ivl.uses.iter().map(|u| u.pos).collect();
        assert_eq!(poss, vec![0, 2]);
        assert!(!ivl.constant);
    }

    #[test]
    fn across_use_outlives_defs() {
        // shlq's count must extend one position past the instruction.
        let mut unit = Vunit::new();
        let count = unit.fresh_vreg();
        let val = unit.fresh_vreg();
        let d = unit.fresh_vreg();
        let entry = unit.entry;
        let code = &mut unit.blocks[entry].code;
        code.push(Vinstr::new(Vop::Ldimmq { val: 1, d: count })); // 0
        code.push(Vinstr::new(Vop::Ldimmq { val: 2, d: val })); // 2
        code.push(Vinstr::new(Vop::Shlq {
            s0: count,
            s1: val,
            d,
            sf: sf_vreg(),
        })); // 4
        code.push(Vinstr::new(Vop::Push { s: d })); // 6
        code.push(Vinstr::new(Vop::Jmpi { target: 0 })); // 8
        let (unit, ctx) = analyzed(unit);
        let intervals = build_intervals(&unit, &ctx);

        let count_ivl = &intervals[intervals.leader_of(count).unwrap()];
        let val_ivl = &intervals[intervals.leader_of(val).unwrap()];
        let d_ivl = &intervals[intervals.leader_of(d).unwrap()];
        // The across use reaches past the shlq at 4...
        assert_eq!(count_ivl.end(), 5);
        // ...while the plain use ends at the instruction.
        assert_eq!(val_ivl.end(), 4);
        assert_eq!(d_ivl.def_pos, Some(4));
        // The hint chain from the two-address form is recorded.
        assert_eq!(val_ivl.uses.last().unwrap().hint, Some(d));
    }

    #[test]
    fn copy_sources_are_downgraded() {
        let mut unit = Vunit::new();
        let v0 = unit.fresh_vreg();
        let v1 = unit.fresh_vreg();
        let entry = unit.entry;
        let code = &mut unit.blocks[entry].code;
        code.push(Vinstr::new(Vop::Ldimmq { val: 3, d: v0 })); // 0
        code.push(Vinstr::new(Vop::Copy { s: v0, d: v1 })); // 2
        code.push(Vinstr::new(Vop::Push { s: v1 })); // 4
        code.push(Vinstr::new(Vop::Jmpi { target: 0 })); // 6
        let (unit, ctx) = analyzed(unit);
        let intervals = build_intervals(&unit, &ctx);

        let v0_ivl = &intervals[intervals.leader_of(v0).unwrap()];
        assert_eq!(v0_ivl.uses[1].kind, Constraint::CopySrc);
        assert_eq!(v0_ivl.uses[1].hint, Some(v1));
        // The def itself keeps its class constraint.
        assert_eq!(v0_ivl.uses[0].kind, Constraint::Any);
    }

    #[test]
    fn constants_snap_to_zero() {
        let mut unit = Vunit::new();
        let c = unit.make_const(Vconst::Quad(0));
        let v1 = unit.fresh_vreg();
        let entry = unit.entry;
        let code = &mut unit.blocks[entry].code;
        code.push(Vinstr::new(Vop::Copy { s: c, d: v1 })); // 0 (nop-padded)
        code.push(Vinstr::new(Vop::Push { s: v1 }));
        code.push(Vinstr::new(Vop::Jmpi { target: 0 }));
        let (unit, ctx) = analyzed(unit);
        let intervals = build_intervals(&unit, &ctx);

        let ivl = &intervals[intervals.leader_of(c).unwrap()];
        assert!(ivl.constant);
        assert_eq!(ivl.val, Some(Vconst::Quad(0)));
        assert_eq!(ivl.start(), 0);
        assert_eq!(ivl.uses.len(), 1);
        assert_eq!(ivl.uses[0].kind, Constraint::CopySrc);
    }

    #[test]
    fn call_clobbers_build_fixed_intervals() {
        let mut unit = Vunit::new();
        let v0 = unit.fresh_vreg();
        let entry = unit.entry;
        let code = &mut unit.blocks[entry].code;
        code.push(Vinstr::new(Vop::Ldimmq { val: 1, d: v0 })); // 0
        code.push(Vinstr::new(Vop::Call {
            target: 0x100,
            args: RegSet::empty(),
        })); // 2
        code.push(Vinstr::new(Vop::Push { s: v0 })); // 4
        code.push(Vinstr::new(Vop::Jmpi { target: 0 })); // 6
        let (unit, ctx) = analyzed(unit);
        let intervals = build_intervals(&unit, &ctx);

        // v0 lives across the call.
        let ivl = &intervals[intervals.leader_of(v0).unwrap()];
        assert_eq!(ivl.start(), 0);
        assert_eq!(ivl.end(), 4);
        // rax is clobbered by the call: it has a fixed interval at the call.
        let rax = Vreg::from(crate::ir::PhysReg::gp(0));
        let rax_ivl = &intervals[intervals.leader_of(rax).unwrap()];
        assert!(rax_ivl.fixed());
        assert!(rax_ivl.covers(2));
        assert!(rax_ivl.uses.is_empty());
    }
}
