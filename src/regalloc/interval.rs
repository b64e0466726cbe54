//! Lifetime intervals.
//!
//! An `Interval` stores the lifetime of a Vreg as a sorted list of disjoint
//! live ranges and a sorted list of use positions. If an interval is split
//! (e.g. because the Vreg had to be spilled in some subrange), the first
//! interval is the "leader" and the rest are children, chained through
//! `next` in start order. All intervals live in one arena and refer to each
//! other by `IntervalId`, with the leader indexed per Vreg.
//!
//! Every use position lies inside one of the ranges, or exactly at the end
//! of the last range. A use at the very end is deliberately legal: an
//! instruction occupies a single position, so a use and a def at the same
//! position do not actually conflict, and allowing the use on the open end
//! keeps lifetimes splittable around instructions that clobber registers as
//! a side effect (e.g. calls).

use crate::ir::{PhysReg, Position, RegClass, Vconst, Vreg};
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{entity_impl, PrimaryMap, SecondaryMap};
use smallvec::SmallVec;
use std::ops::{Index, IndexMut};

/// "Infinity" use position.
pub const MAX_POS: Position = u32::MAX;

/// Register requirement of one use or def site.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Constraint {
    /// Any allocatable register.
    Any,
    /// Source of a copy or phi: the lowering can read straight from a
    /// constant or a spill slot, so no register is required here.
    CopySrc,
    /// A general-purpose register.
    Gpr,
    /// A SIMD register.
    Simd,
    /// The status-flags register.
    Sf,
}

impl Constraint {
    /// The constraint implied by an operand class.
    pub fn of(class: RegClass) -> Constraint {
        match class {
            RegClass::Any => Constraint::Any,
            RegClass::Gpr8 | RegClass::Gpr16 | RegClass::Gpr32 | RegClass::Gpr64 => {
                Constraint::Gpr
            }
            RegClass::SimdDbl | RegClass::Simd128 => Constraint::Simd,
            RegClass::Sf => Constraint::Sf,
        }
    }
}

/// A half-open range `[start, end)` of positions where an interval is live.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct LiveRange {
    /// First position in the range.
    pub start: Position,
    /// First position past the range.
    pub end: Position,
}

impl LiveRange {
    /// Does the range contain `pos`?
    pub fn contains(self, pos: Position) -> bool {
        pos >= self.start && pos < self.end
    }

    /// Does the range contain all of `r`?
    pub fn contains_range(self, r: LiveRange) -> bool {
        r.start >= self.start && r.end <= self.end
    }

    /// Do the ranges overlap?
    pub fn intersects(self, r: LiveRange) -> bool {
        r.start < self.end && self.start < r.end
    }
}

/// A position where an interval is used or defined.
#[derive(Copy, Clone, Debug)]
pub struct Use {
    /// Register requirement at this site.
    pub kind: Constraint,
    /// Linear position of the instruction.
    pub pos: Position,
    /// If set, try to use the same physical register as this Vreg.
    pub hint: Option<Vreg>,
}

/// Arena id of an interval.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntervalId(u32);
entity_impl!(IntervalId, "ivl");

/// The lifetime of one Vreg, or one split piece of it.
pub struct Interval {
    /// The owning Vreg; shared by every interval in a chain.
    pub vreg: Vreg,
    /// The leader, if this is a child.
    pub parent: PackedOption<IntervalId>,
    /// Next child in the chain, sorted by start.
    pub next: PackedOption<IntervalId>,
    /// Disjoint live ranges, sorted ascending.
    pub ranges: SmallVec<[LiveRange; 4]>,
    /// Use positions, sorted ascending.
    pub uses: SmallVec<[Use; 4]>,
    /// Assigned physical register.
    pub reg: Option<PhysReg>,
    /// Assigned spill slot; kept on the leader for the whole chain.
    pub slot: Option<u32>,
    /// Does the value occupy two spill slots?
    pub wide: bool,
    /// Is the Vreg a compile-time constant?
    pub constant: bool,
    /// The constant's value, if `constant`.
    pub val: Option<Vconst>,
    /// Position of the defining use.
    pub def_pos: Option<Position>,
}

impl Interval {
    fn new(vreg: Vreg) -> Interval {
        Interval {
            vreg,
            parent: None.into(),
            next: None.into(),
            ranges: SmallVec::new(),
            uses: SmallVec::new(),
            reg: None,
            slot: None,
            wide: false,
            constant: false,
            val: None,
            def_pos: None,
        }
    }

    /// First covered position.
    pub fn start(&self) -> Position {
        self.ranges.first().expect("empty interval").start
    }

    /// First position past the last range.
    pub fn end(&self) -> Position {
        self.ranges.last().expect("empty interval").end
    }

    /// Is this the lifetime of a physical register?
    pub fn fixed(&self) -> bool {
        self.vreg.is_phys()
    }

    /// Index of the first range containing `pos` or starting above it.
    pub fn find_range(&self, pos: Position) -> usize {
        let mut lo = 0;
        let mut hi = self.ranges.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let r = self.ranges[mid];
            if pos < r.start {
                hi = mid;
            } else if r.end <= pos {
                lo = mid + 1;
            } else {
                return mid;
            }
        }
        debug_assert!(lo == self.ranges.len() || pos < self.ranges[lo].start);
        lo
    }

    /// Index of the first use at `pos` or above it.
    pub fn find_use(&self, pos: Position) -> usize {
        let mut lo = 0;
        let mut hi = self.uses.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let u = self.uses[mid].pos;
            if pos < u {
                hi = mid;
            } else if u < pos {
                lo = mid + 1;
            } else {
                return mid;
            }
        }
        debug_assert!(lo == self.uses.len() || pos < self.uses[lo].pos);
        lo
    }

    /// Is `pos` inside one of the ranges?
    pub fn covers(&self, pos: Position) -> bool {
        if pos < self.start() || pos >= self.end() {
            return false;
        }
        match self.ranges.get(self.find_range(pos)) {
            Some(r) => r.contains(pos),
            None => false,
        }
    }

    /// Is there a use exactly at `pos`?
    pub fn used_at(&self, pos: Position) -> bool {
        if pos < self.start() || pos > self.end() {
            return false;
        }
        match self.uses.get(self.find_use(pos)) {
            Some(u) => u.pos == pos,
            None => false,
        }
    }

    /// The first register-requiring use at or after `pos`, or `MAX_POS`.
    /// CopySrc uses don't need a register and are ignored.
    pub fn first_use_after(&self, pos: Position) -> Position {
        for u in &self.uses {
            if u.kind == Constraint::CopySrc {
                continue;
            }
            if u.pos >= pos {
                return u.pos;
            }
        }
        MAX_POS
    }

    /// The last register-requiring use at or before `pos`, or 0 if the
    /// first such use is after `pos`.
    pub fn last_use_before(&self, pos: Position) -> Position {
        let mut prev = 0;
        for u in &self.uses {
            if u.kind == Constraint::CopySrc {
                continue;
            }
            if u.pos > pos {
                return prev;
            }
            prev = u.pos;
        }
        prev
    }

    /// The first register-requiring use, or `MAX_POS`.
    pub fn first_use(&self) -> Position {
        for u in &self.uses {
            if u.kind != Constraint::CopySrc {
                return u.pos;
            }
        }
        MAX_POS
    }
}

/// Add `r` to `ivl`, whose ranges are in *reverse* order while the interval
/// is being built bottom-up. `r` must precede or overlap the most recently
/// added (lowest) range; subsumed ranges are dropped, abutting ones merged.
pub fn add_range(ivl: &mut Interval, r: LiveRange) {
    while let Some(&last) = ivl.ranges.last() {
        if r.contains_range(last) {
            ivl.ranges.pop();
        } else {
            break;
        }
    }
    let Some(first) = ivl.ranges.last_mut() else {
        ivl.ranges.push(r);
        return;
    };
    if first.contains_range(r) {
        return;
    }
    if r.end >= first.start {
        first.start = r.start;
    } else {
        ivl.ranges.push(r);
    }
}

/// The next position contained in both `cur` and `other`, or `MAX_POS` if
/// they never intersect.
///
/// If two intervals intersect, the first intersection point is always the
/// start of one of them: under SSA a def dominates all its uses, hence all
/// live ranges too. Two unsplit non-fixed intervals cannot intersect at
/// all: `other` starts earlier and does not cover `cur`'s start (it is
/// inactive), and `cur` cannot cover `other`'s start.
pub fn next_intersect(cur: &Interval, other: &Interval) -> Position {
    debug_assert!(!cur.fixed());
    if cur.parent.is_none() && other.parent.is_none() && !other.fixed() {
        return MAX_POS;
    }
    if cur.end() <= other.start() {
        return MAX_POS;
    }
    let r1 = &cur.ranges[..];
    let r2 = &other.ranges[other.find_range(cur.start())..];
    let mut i1 = 0;
    let mut i2 = 0;
    while i1 < r1.len() && i2 < r2.len() {
        if r1[i1].start < r2[i2].start {
            if r2[i2].start < r1[i1].end {
                return r2[i2].start;
            }
            i1 += 1;
        } else {
            if r1[i1].start < r2[i2].end {
                return r1[i1].start;
            }
            i2 += 1;
        }
    }
    MAX_POS
}

/// The interval arena: every interval of the current allocation, plus the
/// leader index per Vreg.
pub struct Intervals {
    arena: PrimaryMap<IntervalId, Interval>,
    by_vreg: SecondaryMap<Vreg, PackedOption<IntervalId>>,
}

impl Intervals {
    /// An empty arena.
    pub fn new() -> Intervals {
        Intervals {
            arena: PrimaryMap::new(),
            by_vreg: SecondaryMap::new(),
        }
    }

    /// The leader interval of `vreg`, if it has one.
    pub fn leader_of(&self, vreg: Vreg) -> Option<IntervalId> {
        self.by_vreg[vreg].expand()
    }

    /// The leader of `vreg`, creating an empty interval on first sight.
    pub fn get_or_create(&mut self, vreg: Vreg) -> IntervalId {
        if let Some(id) = self.by_vreg[vreg].expand() {
            return id;
        }
        let id = self.arena.push(Interval::new(vreg));
        self.by_vreg[vreg] = id.into();
        id
    }

    /// The leader of the chain containing `id`.
    pub fn leader(&self, id: IntervalId) -> IntervalId {
        self.arena[id].parent.expand().unwrap_or(id)
    }

    /// The chain's spill slot, held by the leader.
    pub fn slot_of(&self, id: IntervalId) -> Option<u32> {
        self.arena[self.leader(id)].slot
    }

    /// Ids of every interval currently in the arena.
    pub fn ids(&self) -> Vec<IntervalId> {
        self.arena.keys().collect()
    }

    /// The child of `leader` with a use at `pos`, if any.
    pub fn child_at(&self, leader: IntervalId, pos: Position) -> Option<IntervalId> {
        debug_assert!(self.arena[leader].parent.is_none());
        let mut cur = Some(leader);
        while let Some(id) = cur {
            let ivl = &self.arena[id];
            if pos < ivl.start() {
                return None;
            }
            if ivl.used_at(pos) {
                return Some(id);
            }
            cur = ivl.next.expand();
        }
        None
    }

    /// Split the interval `id` at `pos`, producing a new child linked right
    /// after it; returns the child's id.
    ///
    /// If `keep_uses` is set, uses exactly at the end of the first part stay
    /// with the first part rather than moving to the second.
    ///
    /// Requires `start() < pos < end()` so both parts are non-empty.
    pub fn split(&mut self, id: IntervalId, pos: Position, keep_uses: bool) -> IntervalId {
        let leader = self.leader(id);
        let child = {
            let l = &self.arena[leader];
            Interval {
                vreg: l.vreg,
                wide: l.wide,
                constant: l.constant,
                val: l.val,
                ..Interval::new(l.vreg)
            }
        };
        let child_id = self.arena.push(child);
        self.arena[child_id].parent = leader.into();

        let ivl = &mut self.arena[id];
        debug_assert!(pos > ivl.start() && pos < ivl.end());
        let next = ivl.next;
        ivl.next = child_id.into();

        // Move the tail of the range list to the child, bisecting the range
        // containing `pos` if it straddles the split.
        let mut i = ivl.find_range(pos);
        let mut child_ranges: SmallVec<[LiveRange; 4]> = SmallVec::new();
        if i < ivl.ranges.len() && pos > ivl.ranges[i].start {
            child_ranges.push(LiveRange {
                start: pos,
                end: ivl.ranges[i].end,
            });
            ivl.ranges[i].end = pos;
            i += 1;
        }
        child_ranges.extend(ivl.ranges.drain(i..));

        // Move the tail of the use list to the child.
        let end = ivl.end();
        let child_start = child_ranges.first().expect("split produced no ranges").start;
        let mut u = ivl.find_use(end);
        if keep_uses {
            while u < ivl.uses.len() && ivl.uses[u].pos <= end {
                u += 1;
            }
        } else {
            while u < ivl.uses.len() && ivl.uses[u].pos < child_start {
                u += 1;
            }
        }
        let child_uses: SmallVec<[Use; 4]> = ivl.uses.drain(u..).collect();

        let c = &mut self.arena[child_id];
        c.next = next;
        c.ranges = child_ranges;
        c.uses = child_uses;
        child_id
    }
}

impl Default for Intervals {
    fn default() -> Intervals {
        Intervals::new()
    }
}

impl Index<IntervalId> for Intervals {
    type Output = Interval;
    fn index(&self, id: IntervalId) -> &Interval {
        &self.arena[id]
    }
}

impl IndexMut<IntervalId> for Intervals {
    fn index_mut(&mut self, id: IntervalId) -> &mut Interval {
        &mut self.arena[id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::EntityRef;

    fn v(n: usize) -> Vreg {
        Vreg::new(crate::ir::VIRT_BASE as usize + n)
    }

    fn ivl_with(ranges: &[(Position, Position)], uses: &[Position]) -> Interval {
        let mut ivl = Interval::new(v(0));
        ivl.ranges = ranges
            .iter()
            .map(|&(start, end)| LiveRange { start, end })
            .collect();
        ivl.uses = uses
            .iter()
            .map(|&pos| Use {
                kind: Constraint::Any,
                pos,
                hint: None,
            })
            .collect();
        ivl
    }

    #[test]
    fn range_queries() {
        let ivl = ivl_with(&[(2, 6), (10, 14)], &[2, 4, 12]);
        assert!(ivl.covers(2));
        assert!(ivl.covers(5));
        assert!(!ivl.covers(6));
        assert!(!ivl.covers(8));
        assert!(ivl.covers(10));
        assert!(!ivl.covers(14));
        assert!(ivl.used_at(4));
        assert!(!ivl.used_at(5));
        assert_eq!(ivl.find_range(8), 1);
        assert_eq!(ivl.find_range(3), 0);
    }

    #[test]
    fn use_queries_skip_copy_sources() {
        let mut ivl = ivl_with(&[(2, 20)], &[2, 8, 14]);
        ivl.uses[1].kind = Constraint::CopySrc;
        assert_eq!(ivl.first_use(), 2);
        assert_eq!(ivl.first_use_after(4), 14);
        assert_eq!(ivl.last_use_before(10), 2);
        assert_eq!(ivl.last_use_before(1), 0);
    }

    #[test]
    fn add_range_builds_in_reverse() {
        // Ranges arrive highest-first during the backward walk.
        let mut ivl = Interval::new(v(0));
        add_range(&mut ivl, LiveRange { start: 10, end: 14 });
        add_range(&mut ivl, LiveRange { start: 4, end: 6 });
        // Extends the lowest range by overlap.
        add_range(&mut ivl, LiveRange { start: 2, end: 5 });
        assert_eq!(
            &ivl.ranges[..],
            &[
                LiveRange { start: 10, end: 14 },
                LiveRange { start: 2, end: 6 }
            ]
        );
        // Subsumes both.
        add_range(&mut ivl, LiveRange { start: 0, end: 20 });
        assert_eq!(&ivl.ranges[..], &[LiveRange { start: 0, end: 20 }]);
    }

    fn arena_with(ranges: &[(Position, Position)], uses: &[Position]) -> (Intervals, IntervalId) {
        let mut intervals = Intervals::new();
        let id = intervals.get_or_create(v(0));
        let ivl = ivl_with(ranges, uses);
        intervals[id].ranges = ivl.ranges;
        intervals[id].uses = ivl.uses;
        (intervals, id)
    }

    #[test]
    fn split_mid_range_keep_uses() {
        // A use exactly at the split point stays with the first part when
        // `keep_uses` is set.
        let (mut intervals, id) = arena_with(&[(2, 20)], &[2, 9, 14]);
        let child = intervals.split(id, 9, true);
        assert_eq!(intervals[id].end(), 9);
        assert_eq!(intervals[child].start(), 9);
        let first: Vec<_> = intervals[id].uses.iter().map(|u| u.pos).collect();
        let second: Vec<_> = intervals[child].uses.iter().map(|u| u.pos).collect();
        assert_eq!(first, vec![2, 9]);
        assert_eq!(second, vec![14]);
        assert_eq!(intervals.leader(child), id);
        assert_eq!(intervals[id].next.expand(), Some(child));
    }

    #[test]
    fn split_mid_range_move_uses() {
        // Without `keep_uses`, a use at the split point moves to the child.
        let (mut intervals, id) = arena_with(&[(2, 20)], &[2, 9, 14]);
        let child = intervals.split(id, 9, false);
        let first: Vec<_> = intervals[id].uses.iter().map(|u| u.pos).collect();
        let second: Vec<_> = intervals[child].uses.iter().map(|u| u.pos).collect();
        assert_eq!(first, vec![2]);
        assert_eq!(second, vec![9, 14]);
    }

    #[test]
    fn split_at_range_boundary() {
        // Splitting in a lifetime hole: the first part keeps its use at its
        // own end under either policy.
        for keep_uses in [false, true] {
            let (mut intervals, id) = arena_with(&[(2, 6), (10, 14)], &[2, 6, 10]);
            let child = intervals.split(id, 10, keep_uses);
            assert_eq!(intervals[id].end(), 6);
            assert_eq!(intervals[child].start(), 10);
            let first: Vec<_> = intervals[id].uses.iter().map(|u| u.pos).collect();
            let second: Vec<_> = intervals[child].uses.iter().map(|u| u.pos).collect();
            assert_eq!(first, vec![2, 6], "keep_uses={}", keep_uses);
            assert_eq!(second, vec![10], "keep_uses={}", keep_uses);
        }
    }

    #[test]
    fn split_twice_chains_children() {
        let (mut intervals, id) = arena_with(&[(2, 30)], &[2, 11, 21]);
        let c1 = intervals.split(id, 11, false);
        let c2 = intervals.split(c1, 21, false);
        assert_eq!(intervals.leader(c2), id);
        assert_eq!(intervals[id].next.expand(), Some(c1));
        assert_eq!(intervals[c1].next.expand(), Some(c2));
        assert_eq!(intervals.child_at(id, 2), Some(id));
        assert_eq!(intervals.child_at(id, 11), Some(c1));
        assert_eq!(intervals.child_at(id, 21), Some(c2));
        assert_eq!(intervals.child_at(id, 5), None);
    }

    #[test]
    fn intersection() {
        let mut a = ivl_with(&[(2, 6), (10, 14)], &[]);
        let b = ivl_with(&[(6, 12)], &[]);
        // Two unsplit virtual intervals never intersect under SSA.
        assert_eq!(next_intersect(&a, &b), MAX_POS);
        // A fixed `other` is checked for real.
        let mut fixed = ivl_with(&[(6, 12)], &[]);
        fixed.vreg = Vreg::from(PhysReg::gp(0));
        assert_eq!(next_intersect(&a, &fixed), 10);
        let far = {
            let mut f = ivl_with(&[(20, 24)], &[]);
            f.vreg = Vreg::from(PhysReg::gp(0));
            f
        };
        assert_eq!(next_intersect(&a, &far), MAX_POS);
        // A child is also checked for real.
        a.parent = IntervalId::new(7).into();
        let b2 = ivl_with(&[(4, 5)], &[]);
        assert_eq!(next_intersect(&a, &b2), 4);
    }
}
