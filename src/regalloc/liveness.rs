//! Pre-analysis passes: position assignment, stack-pointer tracking, and
//! the iterative liveness dataflow.

use crate::abi::{get_effects, Abi};
use crate::cfg::{compute_preds, DataflowWorklist};
use crate::ir::{
    visit_operands, OperandVisitor, PhysReg, Position, RegClass, RegSet, Vinstr, Vlabel, Vop,
    Vreg, Vtuple, Vunit,
};
use crate::regalloc::interval::LiveRange;
use cranelift_bitset::CompoundBitSet;
use cranelift_entity::{EntityRef, PrimaryMap, SecondaryMap};
use log::trace;
use smallvec::SmallVec;

/// A set of live Vregs, indexed by Vreg number.
#[derive(Clone, Default)]
pub struct LiveSet(CompoundBitSet);

// Equality is over the members, not the backing storage: a set that grew
// for a high-numbered Vreg and shrank again must still equal its peers.
impl PartialEq for LiveSet {
    fn eq(&self, other: &LiveSet) -> bool {
        self.0.len() == other.0.len() && self.0.iter().zip(other.0.iter()).all(|(a, b)| a == b)
    }
}

impl Eq for LiveSet {}

impl LiveSet {
    /// An empty set.
    pub fn new() -> LiveSet {
        LiveSet(CompoundBitSet::new())
    }

    /// An empty set with room for `n` Vregs.
    pub fn with_capacity(n: u32) -> LiveSet {
        LiveSet(CompoundBitSet::with_capacity(n as usize))
    }

    /// Is `r` live?
    pub fn contains(&self, r: Vreg) -> bool {
        self.0.contains(r.index())
    }

    /// Mark `r` live.
    pub fn insert(&mut self, r: Vreg) {
        self.0.insert(r.index());
    }

    /// Mark `r` dead.
    pub fn remove(&mut self, r: Vreg) {
        self.0.remove(r.index());
    }

    /// Is the set empty?
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge every member of `other` into `self`.
    pub fn union_with(&mut self, other: &LiveSet) {
        for i in other.0.iter() {
            self.0.insert(i);
        }
    }

    /// Iterate the members in index order.
    pub fn iter(&self) -> impl Iterator<Item = Vreg> + '_ {
        self.0.iter().map(Vreg::new)
    }
}

impl std::fmt::Debug for LiveSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Does `inst` use any register at all? A block whose first instruction has
/// a use gets a leading nop, so the block-entry position never carries uses.
struct UseFinder {
    any: bool,
    tuples: SmallVec<[Vtuple; 2]>,
}

impl OperandVisitor for UseFinder {
    fn use_reg(&mut self, _: Vreg, _: RegClass) {
        self.any = true;
    }
    fn use_tuple(&mut self, t: Vtuple) {
        self.tuples.push(t);
    }
    fn use_regset(&mut self, rs: RegSet) {
        if !rs.is_empty() {
            self.any = true;
        }
    }
}

fn has_uses(unit: &Vunit, inst: &Vinstr) -> bool {
    let mut f = UseFinder {
        any: false,
        tuples: SmallVec::new(),
    };
    visit_operands(inst, &mut f);
    f.any || f.tuples.iter().any(|&t| !unit.tuples[t].is_empty())
}

/// Number every instruction with an even position and compute each block's
/// `[start, end)` range.
///
/// Blocks whose first instruction has a use get a leading nop first, so the
/// implicit "label" position at a block head is always free for edge
/// copies. This modifies the instructions in `unit` by setting `pos`.
pub fn compute_positions(
    unit: &mut Vunit,
    blocks: &[Vlabel],
) -> SecondaryMap<Vlabel, LiveRange> {
    let mut block_ranges = SecondaryMap::<Vlabel, LiveRange>::new();
    let mut pos: Position = 0;

    for &b in blocks {
        let front_uses = match unit.blocks[b].code.first() {
            Some(inst) => has_uses(unit, inst),
            None => false,
        };
        if front_uses {
            let origin = unit.blocks[b].code[0].origin;
            let mut nop = Vinstr::nop();
            nop.origin = origin;
            unit.blocks[b].code.insert(0, nop);
        }
        let start = pos;
        for inst in &mut unit.blocks[b].code {
            inst.pos = pos;
            pos += 2;
        }
        block_ranges[b] = LiveRange { start, end: pos };
    }
    block_ranges
}

/// The effect of `inst` on the value of `sp`, in bytes.
///
/// Asserts if an instruction mutates `sp` in an untrackable way.
pub fn sp_effect(inst: &Vinstr, sp: PhysReg) -> i32 {
    let sp = Vreg::from(sp);
    match &inst.op {
        Vop::Push { .. } => -8,
        Vop::Pop { .. } => 8,
        Vop::Addqi { s0, s1, d, .. } => {
            if *d == sp {
                debug_assert_eq!(*s1, sp);
                *s0
            } else {
                0
            }
        }
        Vop::Subqi { s0, s1, d, .. } => {
            if *d == sp {
                debug_assert_eq!(*s1, sp);
                -*s0
            } else {
                0
            }
        }
        Vop::Lea { s, d } => {
            if *d == sp {
                debug_assert!(s.base == Some(sp) && s.index.is_none());
                s.disp
            } else {
                0
            }
        }
        _ => {
            #[cfg(debug_assertions)]
            {
                struct NoSpDef {
                    sp: Vreg,
                }
                impl OperandVisitor for NoSpDef {
                    fn def_reg(&mut self, r: Vreg, _: RegClass) {
                        debug_assert!(r != self.sp, "untracked sp definition");
                    }
                }
                visit_operands(inst, &mut NoSpDef { sp });
            }
            0
        }
    }
}

/// Compute the offset from `sp` to the spill area at each block entry.
///
/// A single forward visit in block order suffices; when an already-visited
/// block is reached again, its recorded offset must agree, anything else is
/// a fatal inconsistency in the input.
pub fn analyze_sp(
    unit: &Vunit,
    blocks: &[Vlabel],
    sp: PhysReg,
) -> SecondaryMap<Vlabel, i32> {
    let mut visited = SecondaryMap::<Vlabel, bool>::new();
    let mut spill_offsets = SecondaryMap::<Vlabel, i32>::new();

    for &b in blocks {
        let mut offset = if visited[b] { spill_offsets[b] } else { 0 };
        for inst in &unit.blocks[b].code {
            offset -= sp_effect(inst, sp);
        }
        for &s in unit.succs(b) {
            if visited[s] {
                assert!(
                    offset == spill_offsets[s],
                    "sp mismatch on edge {}->{}, expected {} got {}",
                    b,
                    s,
                    spill_offsets[s],
                    offset
                );
            } else {
                spill_offsets[s] = offset;
                visited[s] = true;
            }
        }
    }
    spill_offsets
}

/// Def visitor for the liveness analysis: kills the defined Vregs.
struct LiveDefVisitor<'a> {
    tuples: &'a PrimaryMap<Vtuple, Vec<Vreg>>,
    live: &'a mut LiveSet,
}

impl LiveDefVisitor<'_> {
    fn def(&mut self, r: Vreg, class: RegClass) {
        // Eagerly rename all flags operands to the one flags register.
        let r = if class == RegClass::Sf {
            Vreg::from(PhysReg::SF)
        } else {
            r
        };
        self.live.remove(r);
    }
}

impl OperandVisitor for LiveDefVisitor<'_> {
    fn def_reg(&mut self, r: Vreg, class: RegClass) {
        self.def(r, class);
    }
    fn def_tuple(&mut self, t: Vtuple) {
        for &r in &self.tuples[t] {
            self.def(r, RegClass::Any);
        }
    }
}

/// Use visitor for the liveness analysis: makes the used Vregs live.
struct LiveUseVisitor<'a> {
    tuples: &'a PrimaryMap<Vtuple, Vec<Vreg>>,
    live: &'a mut LiveSet,
}

impl LiveUseVisitor<'_> {
    fn use_(&mut self, r: Vreg, class: RegClass) {
        let r = if class == RegClass::Sf {
            Vreg::from(PhysReg::SF)
        } else {
            r
        };
        self.live.insert(r);
    }
}

impl OperandVisitor for LiveUseVisitor<'_> {
    fn use_reg(&mut self, r: Vreg, class: RegClass) {
        self.use_(r, class);
    }
    fn use_tuple(&mut self, t: Vtuple) {
        for &r in &self.tuples[t] {
            self.use_(r, RegClass::Any);
        }
    }
    fn use_regset(&mut self, rs: RegSet) {
        for r in rs {
            self.use_(Vreg::from(r), RegClass::Any);
        }
    }
}

/// Compute the live-in set of every block by iterating a backward dataflow
/// to its fixpoint.
///
/// The interval build uses the sets for a single precise backward pass with
/// live-range holes, and edge resolution uses them to discover intervals
/// that need copies on control-flow edges.
pub fn compute_liveness(
    unit: &Vunit,
    abi: &Abi,
    blocks: &[Vlabel],
) -> SecondaryMap<Vlabel, LiveSet> {
    let mut livein = SecondaryMap::<Vlabel, LiveSet>::new();
    let preds = compute_preds(unit);

    let mut block_po = SecondaryMap::<Vlabel, u32>::new();
    let rev_blocks: Vec<Vlabel> = blocks.iter().rev().copied().collect();

    trace!("compute_liveness: {} blocks", rev_blocks.len());

    let mut wl = DataflowWorklist::new(rev_blocks.len());
    for (po, &b) in rev_blocks.iter().enumerate() {
        wl.push(po as u32);
        block_po[b] = po as u32;
    }

    while let Some(po) = wl.pop() {
        let b = rev_blocks[po as usize];

        // Start with the union of the successor live-ins.
        let mut live = LiveSet::with_capacity(unit.next_vr);
        for &s in unit.succs(b) {
            live.union_with(&livein[s]);
        }

        // Then walk the instructions backwards.
        for inst in unit.blocks[b].code.iter().rev() {
            let fx = get_effects(abi, inst);

            let mut dv = LiveDefVisitor {
                tuples: &unit.tuples,
                live: &mut live,
            };
            visit_operands(inst, &mut dv);
            for r in fx.defs {
                dv.def(Vreg::from(r), RegClass::Any);
            }

            let mut uv = LiveUseVisitor {
                tuples: &unit.tuples,
                live: &mut live,
            };
            visit_operands(inst, &mut uv);
            for r in fx.uses | fx.across {
                uv.use_(Vreg::from(r), RegClass::Any);
            }
        }

        if live != livein[b] {
            trace!("  live-in of {} changed: {:?}", b, live);
            livein[b] = live;
            for &p in &preds[b] {
                wl.push(block_po[p]);
            }
        }
    }

    livein
}

/// The flags register as a Vreg; what every `Sf` operand renames to.
pub fn sf_vreg() -> Vreg {
    Vreg::from(PhysReg::SF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::sort_blocks;
    use crate::ir::{regs, Area, Cond, Vptr};

    fn sf() -> Vreg {
        Vreg::from(PhysReg::SF)
    }

    #[test]
    fn positions_are_even_and_nop_padded() {
        let mut unit = Vunit::new();
        let v0 = unit.fresh_vreg();
        let entry = unit.entry;
        // First instruction uses v0, so a nop must be prepended.
        unit.blocks[entry]
            .code
            .push(Vinstr::new(Vop::Push { s: v0 }));
        unit.blocks[entry]
            .code
            .push(Vinstr::new(Vop::Jmpi { target: 0 }));

        let blocks = sort_blocks(&unit);
        let ranges = compute_positions(&mut unit, &blocks);
        let code = &unit.blocks[entry].code;
        assert!(matches!(code[0].op, Vop::Nop));
        assert_eq!(code[0].pos, 0);
        assert_eq!(code[1].pos, 2);
        assert_eq!(code[2].pos, 4);
        assert_eq!(ranges[entry], LiveRange { start: 0, end: 6 });
    }

    #[test]
    fn def_first_block_needs_no_nop() {
        let mut unit = Vunit::new();
        let v0 = unit.fresh_vreg();
        let entry = unit.entry;
        unit.blocks[entry]
            .code
            .push(Vinstr::new(Vop::Ldimmq { val: 1, d: v0 }));
        unit.blocks[entry]
            .code
            .push(Vinstr::new(Vop::Jmpi { target: 0 }));
        let blocks = sort_blocks(&unit);
        compute_positions(&mut unit, &blocks);
        assert!(matches!(
            unit.blocks[unit.entry].code[0].op,
            Vop::Ldimmq { .. }
        ));
    }

    #[test]
    fn sp_effects() {
        let sp = regs::RSP;
        let spv = Vreg::from(sp);
        assert_eq!(sp_effect(&Vinstr::new(Vop::Push { s: spv }), sp), -8);
        assert_eq!(sp_effect(&Vinstr::new(Vop::Pop { d: spv }), sp), 8);
        assert_eq!(
            sp_effect(
                &Vinstr::new(Vop::Lea {
                    s: Vptr::base_disp(spv, -32),
                    d: spv
                }),
                sp
            ),
            -32
        );
        assert_eq!(sp_effect(&Vinstr::nop(), sp), 0);
    }

    #[test]
    fn sp_offsets_propagate() {
        let mut unit = Vunit::new();
        let spv = Vreg::from(regs::RSP);
        let next = unit.make_block(Area::Main);
        let entry = unit.entry;
        unit.blocks[entry]
            .code
            .push(Vinstr::new(Vop::Push { s: spv }));
        unit.blocks[entry]
            .code
            .push(Vinstr::new(Vop::Jmp { target: next }));
        unit.blocks[next]
            .code
            .push(Vinstr::new(Vop::Jmpi { target: 0 }));

        let blocks = sort_blocks(&unit);
        let offsets = analyze_sp(&unit, &blocks, regs::RSP);
        assert_eq!(offsets[entry], 0);
        assert_eq!(offsets[next], 8);
    }

    #[test]
    fn liveness_through_diamond() {
        // v0 defined in entry, used in the join: live through both arms.
        let mut unit = Vunit::new();
        let v0 = unit.fresh_vreg();
        let left = unit.make_block(Area::Main);
        let right = unit.make_block(Area::Main);
        let join = unit.make_block(Area::Main);
        let entry = unit.entry;

        unit.blocks[entry]
            .code
            .push(Vinstr::new(Vop::Ldimmq { val: 1, d: v0 }));
        unit.blocks[entry].code.push(Vinstr::new(Vop::Jcc {
            cc: Cond::E,
            sf: sf(),
            targets: [left, right],
        }));
        unit.blocks[left]
            .code
            .push(Vinstr::new(Vop::Jmp { target: join }));
        unit.blocks[right]
            .code
            .push(Vinstr::new(Vop::Jmp { target: join }));
        unit.blocks[join]
            .code
            .push(Vinstr::new(Vop::Push { s: v0 }));
        unit.blocks[join]
            .code
            .push(Vinstr::new(Vop::Jmpi { target: 0 }));

        let blocks = sort_blocks(&unit);
        let livein = compute_liveness(&unit, &Abi::host(), &blocks);
        assert!(livein[join].contains(v0));
        assert!(livein[left].contains(v0));
        assert!(livein[right].contains(v0));
        assert!(!livein[entry].contains(v0));
    }

    #[test]
    fn liveness_on_loop_reaches_fixpoint() {
        // entry -> head; head jcc {body, exit}; body uses v0, jmp head.
        let mut unit = Vunit::new();
        let v0 = unit.fresh_vreg();
        let head = unit.make_block(Area::Main);
        let body = unit.make_block(Area::Main);
        let exit = unit.make_block(Area::Main);
        let entry = unit.entry;

        unit.blocks[entry]
            .code
            .push(Vinstr::new(Vop::Ldimmq { val: 1, d: v0 }));
        unit.blocks[entry]
            .code
            .push(Vinstr::new(Vop::Jmp { target: head }));
        unit.blocks[head].code.push(Vinstr::new(Vop::Jcc {
            cc: Cond::NE,
            sf: sf(),
            targets: [body, exit],
        }));
        unit.blocks[body]
            .code
            .push(Vinstr::new(Vop::Push { s: v0 }));
        unit.blocks[body]
            .code
            .push(Vinstr::new(Vop::Jmp { target: head }));
        unit.blocks[exit]
            .code
            .push(Vinstr::new(Vop::Jmpi { target: 0 }));

        let blocks = sort_blocks(&unit);
        let livein = compute_liveness(&unit, &Abi::host(), &blocks);
        // v0 is live around the whole loop.
        assert!(livein[head].contains(v0));
        assert!(livein[body].contains(v0));
        assert!(!livein[exit].contains(v0));
        // The head's jcc reads flags, so SF is live into the loop.
        assert!(livein[head].contains(sf()));
    }

    #[test]
    #[should_panic(expected = "sp mismatch")]
    fn sp_mismatch_is_fatal() {
        // One arm pushes, the other doesn't: the join sees two offsets.
        let mut unit = Vunit::new();
        let spv = Vreg::from(regs::RSP);
        let left = unit.make_block(Area::Main);
        let right = unit.make_block(Area::Main);
        let join = unit.make_block(Area::Main);
        let entry = unit.entry;
        unit.blocks[entry].code.push(Vinstr::new(Vop::Jcc {
            cc: Cond::E,
            sf: sf(),
            targets: [left, right],
        }));
        unit.blocks[left]
            .code
            .push(Vinstr::new(Vop::Push { s: spv }));
        unit.blocks[left]
            .code
            .push(Vinstr::new(Vop::Jmp { target: join }));
        unit.blocks[right]
            .code
            .push(Vinstr::new(Vop::Jmp { target: join }));
        unit.blocks[join]
            .code
            .push(Vinstr::new(Vop::Jmpi { target: 0 }));

        let blocks = sort_blocks(&unit);
        analyze_sp(&unit, &blocks, regs::RSP);
    }
}
