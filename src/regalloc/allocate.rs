//! The linear-scan allocator proper.
//!
//! Intervals are processed in order of start position, maintaining the set
//! of active (live here) and inactive (live later) intervals. The chosen
//! register is the one free furthest into the future; failing that, the
//! current interval is split so its first part gets a register, or a victim
//! is spilled. Split positions land on block boundaries or the odd
//! between-instruction positions, where the resolution pass can place
//! copies.

use crate::ir::{PhysReg, Position, RegSet};
use crate::regalloc::interval::{next_intersect, Constraint, IntervalId, Intervals, MAX_POS};
use crate::regalloc::{Options, RegAllocError, SpillInfo, VxlsContext, MAX_SPILL_SLOTS};
use log::trace;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::ops::{Index, IndexMut};

/// A map from physical register to a position.
struct PosMap([Position; PhysReg::COUNT]);

impl PosMap {
    fn new() -> PosMap {
        PosMap([0; PhysReg::COUNT])
    }

    /// The register with the highest position; the lowest such register
    /// index wins ties.
    fn find_farthest(&self) -> PhysReg {
        let mut best = PhysReg::from_index(0);
        let mut max = 0;
        for (i, &pos) in self.0.iter().enumerate() {
            if pos > max {
                max = pos;
                best = PhysReg::from_index(i);
            }
        }
        best
    }
}

impl Index<PhysReg> for PosMap {
    type Output = Position;
    fn index(&self, r: PhysReg) -> &Position {
        &self.0[r.index()]
    }
}

impl IndexMut<PhysReg> for PosMap {
    fn index_mut(&mut self, r: PhysReg) -> &mut Position {
        &mut self.0[r.index()]
    }
}

/// Run the allocation phase over the built intervals.
pub fn assign_registers(
    ctx: &VxlsContext,
    intervals: &mut Intervals,
    opts: &Options,
) -> Result<SpillInfo, RegAllocError> {
    Vxls {
        ctx,
        intervals,
        opts,
        pending: BinaryHeap::new(),
        active: Vec::new(),
        inactive: Vec::new(),
        spill_slots: [0; MAX_SPILL_SLOTS],
        info: SpillInfo::default(),
    }
    .go()
}

/// Working state of the allocation phase.
struct Vxls<'a> {
    ctx: &'a VxlsContext,
    intervals: &'a mut Intervals,
    opts: &'a Options,
    /// Intervals waiting for a register, earliest start first.
    pending: BinaryHeap<Reverse<(Position, IntervalId)>>,
    /// Intervals live at the current position, each holding a register.
    active: Vec<IntervalId>,
    /// Intervals with a register whose next range starts later.
    inactive: Vec<IntervalId>,
    /// Last position each spill slot was owned; `MAX_POS` means in use.
    spill_slots: [Position; MAX_SPILL_SLOTS],
    info: SpillInfo,
}

impl Vxls<'_> {
    fn go(mut self) -> Result<SpillInfo, RegAllocError> {
        for id in self.intervals.ids() {
            let ivl = &self.intervals[id];
            if ivl.fixed() {
                let r = ivl.vreg.phys().expect("fixed interval names a physreg");
                self.assign_reg(id, r)?;
            } else if ivl.constant {
                self.spill(id)?;
            } else {
                self.push_pending(id);
            }
        }
        while let Some(Reverse((_, cur))) = self.pending.pop() {
            self.update(cur);
            self.allocate(cur)?;
        }
        Ok(self.info)
    }

    fn push_pending(&mut self, id: IntervalId) {
        let start = self.intervals[id].start();
        self.pending.push(Reverse((start, id)));
    }

    /// Refresh `active`/`inactive` for the start of `cur`: expire finished
    /// intervals (releasing their spill slot at the last child) and flip
    /// intervals whose coverage changed.
    fn update(&mut self, cur: IntervalId) {
        let pos = self.intervals[cur].start();

        let mut active = std::mem::take(&mut self.active);
        let mut inactive = std::mem::take(&mut self.inactive);

        let mut i = 0;
        while i < active.len() {
            let id = active[i];
            let ivl = &self.intervals[id];
            if pos >= ivl.end() {
                active.swap_remove(i);
                if ivl.next.is_none() {
                    self.free_spill_slot(id);
                }
            } else if !ivl.covers(pos) {
                active.swap_remove(i);
                inactive.push(id);
            } else {
                i += 1;
            }
        }

        let mut i = 0;
        while i < inactive.len() {
            let id = inactive[i];
            let ivl = &self.intervals[id];
            if pos >= ivl.end() {
                inactive.swap_remove(i);
                if ivl.next.is_none() {
                    self.free_spill_slot(id);
                }
            } else if ivl.covers(pos) {
                inactive.swap_remove(i);
                active.push(id);
            } else {
                i += 1;
            }
        }

        self.active = active;
        self.inactive = inactive;
    }

    /// Release the chain's spill slot once its last child has expired. The
    /// slot records the expiry position so only lifetimes starting above it
    /// may reuse the slot.
    fn free_spill_slot(&mut self, id: IntervalId) {
        debug_assert!(self.intervals[id].next.is_none());
        if let Some(slot) = self.intervals.slot_of(id) {
            let slot = slot as usize;
            let end = self.intervals[id].end();
            if self.intervals[id].wide {
                debug_assert!(self.spill_slots[slot + 1] != 0);
                self.spill_slots[slot + 1] = end;
            }
            debug_assert!(self.spill_slots[slot] != 0);
            self.spill_slots[slot] = end;
        }
    }

    /// The closest legal split position at or before `pos`: a block start,
    /// or the nearest odd between-instruction position.
    fn nearest_split_before(&self, pos: Position) -> Position {
        let b = self.ctx.block_for(pos);
        let range = self.ctx.block_ranges[b];
        if pos == range.start {
            pos
        } else {
            (pos - 1) | 1
        }
    }

    /// Intersect the register classes demanded by the uses of `id`.
    ///
    /// Returns the allowed set together with the last position it is valid
    /// for: normally "forever", but if some use makes the intersection
    /// empty, the position just before that use. The off-by-one is real: a
    /// use is permitted at an interval's `end()`, and failing to satisfy a
    /// constraint there still forces a split and spill, whereas merely
    /// intersecting another interval at such a position is harmless (the
    /// conflict would be the other interval's def, and a use and a def at
    /// one position do not clash).
    fn constrain(&self, id: IntervalId) -> (RegSet, Position) {
        let abi = &self.ctx.abi;
        let any = abi.unreserved() - abi.sf; // Any, but never the flags
        let mut allow = abi.unreserved();
        for u in &self.intervals[id].uses {
            let need = match u.kind {
                Constraint::Simd => abi.simd_unreserved,
                Constraint::Gpr => abi.gp_unreserved,
                Constraint::Sf => abi.sf,
                Constraint::Any | Constraint::CopySrc => any,
            };
            if (allow & need).is_empty() {
                return (allow, u.pos - 1);
            }
            allow &= need;
        }
        (allow, MAX_POS)
    }

    /// The first hint among `cur`'s uses whose register is free for all of
    /// `cur`, else the usable hint that stays free the longest.
    fn find_hint(&self, cur: IntervalId, free_until: &PosMap, allow: RegSet) -> Option<PhysReg> {
        if !self.opts.pre_coloring && !self.opts.coalescing {
            return None;
        }
        let cur_ivl = &self.intervals[cur];
        let mut ret: Option<PhysReg> = None;

        for u in &cur_ivl.uses {
            let Some(hint_vreg) = u.hint else { continue };
            let Some(leader) = self.intervals.leader_of(hint_vreg) else {
                continue;
            };

            let hint = if self.intervals[leader].fixed() {
                self.intervals[leader].reg
            } else if Some(u.pos) == cur_ivl.def_pos {
                // This is the def and the hint names a source: take the
                // register of the hint's child that ends right here.
                let mut found = None;
                let mut next = Some(leader);
                while let Some(id) = next {
                    let ivl = &self.intervals[id];
                    if ivl.end() == u.pos && ivl.reg.is_some() {
                        found = ivl.reg;
                        break;
                    }
                    next = ivl.next.expand();
                }
                found
            } else {
                None
            };

            let Some(h) = hint else { continue };
            if !allow.contains(h) {
                continue;
            }
            if free_until[h] >= cur_ivl.end() {
                return Some(h);
            }
            match ret {
                Some(prev) if free_until[prev] >= free_until[h] => {}
                _ => ret = Some(h),
            }
        }
        ret
    }

    fn allocate(&mut self, cur: IntervalId) -> Result<(), RegAllocError> {
        let (allow, conflict) = self.constrain(cur);

        // First position at which each register becomes unavailable.
        // Registers outside our class stay at zero; active owners pin
        // theirs to zero; inactive owners cap theirs at the intersection.
        let mut free_until = PosMap::new();
        for r in allow {
            free_until[r] = conflict;
        }
        for &id in &self.active {
            let r = self.intervals[id].reg.expect("active interval without reg");
            free_until[r] = 0;
        }
        for &id in &self.inactive {
            let r = self.intervals[id].reg.expect("inactive interval without reg");
            if free_until[r] == 0 {
                continue;
            }
            let until = next_intersect(&self.intervals[cur], &self.intervals[id]);
            free_until[r] = free_until[r].min(until);
        }

        {
            let ivl = &self.intervals[cur];
            if ivl.ranges.len() > 1 {
                let blk_range = self.ctx.block_ranges[self.ctx.block_for(ivl.start())];
                if blk_range.end > ivl.ranges[0].end {
                    // Not live out of its first range, so there is no
                    // connection to the later ranges; breaking here can
                    // only help (e.g. it avoids carrying a value in a
                    // callee-saved register through lots of unrelated code
                    // between two unlikely exit blocks).
                    let second = self.intervals.split(cur, blk_range.end, false);
                    self.push_pending(second);
                } else if ivl.constant
                    && !ivl.uses.is_empty()
                    && ivl.uses[0].pos >= blk_range.end
                {
                    // Don't load a constant at the top of a block where it
                    // has no use.
                    return self.spill(cur);
                }
            }
        }

        // A hint that's free across the whole interval wins outright.
        let hint = self.find_hint(cur, &free_until, allow);
        if let Some(h) = hint {
            if free_until[h] >= self.intervals[cur].end() {
                return self.assign_reg(cur, h);
            }
        }

        // Otherwise take the register available furthest into the future.
        let r = free_until.find_farthest();
        let pos = free_until[r];
        if pos >= self.intervals[cur].end() {
            return self.assign_reg(cur, r);
        }

        if pos > self.intervals[cur].start() {
            // `r` is free for the first part of `cur`: split and keep it.
            let split_pos = {
                let ivl = &self.intervals[cur];
                let prev_use = ivl.last_use_before(pos);

                debug_assert!(prev_use.max(ivl.start() + 1) <= pos);

                let mut split_pos = self.nearest_split_before(pos);
                if split_pos > ivl.start() && prev_use != 0 && prev_use < split_pos {
                    // No use between the top of split_pos's block and
                    // split_pos itself: a reload on the edge into that
                    // block could never be used. Hoist the split to the
                    // previous block boundary instead.
                    let mut idx = ivl.find_range(prev_use);
                    if idx < ivl.ranges.len()
                        && ivl.ranges[idx].start <= prev_use
                        && ivl.ranges[idx].end < split_pos
                    {
                        idx += 1;
                    }
                    if idx < ivl.ranges.len()
                        && ivl.ranges[idx].start > prev_use
                        && ivl.ranges[idx].start < split_pos
                    {
                        split_pos = ivl.ranges[idx].start;
                    }
                }
                split_pos
            };

            if split_pos > self.intervals[cur].start() {
                // Keep uses at the end of the first part: `r` is known
                // free up to and including that position. Re-try the hint
                // against the shortened interval.
                let second = self.intervals.split(cur, split_pos, true);
                self.push_pending(second);
                let r = match hint {
                    Some(h) if free_until[h] >= self.intervals[cur].end() => h,
                    _ => r,
                };
                return self.assign_reg(cur, r);
            }
        }

        // Nothing is free: spill `cur` or a victim.
        self.alloc_blocked(cur)
    }

    /// All registers are occupied at `cur`'s start: find the best interval
    /// (possibly `cur` itself) to split and spill.
    fn alloc_blocked(&mut self, cur: IntervalId) -> Result<(), RegAllocError> {
        let cur_start = self.intervals[cur].start();
        let (allow, conflict) = self.constrain(cur);

        // Next position each register is used by its current owner, and
        // next position each register is blocked by a fixed interval.
        let mut used = PosMap::new();
        let mut blocked = PosMap::new();
        for r in allow {
            used[r] = conflict;
            blocked[r] = conflict;
        }

        for &id in &self.active {
            let ivl = &self.intervals[id];
            let r = ivl.reg.expect("active interval without reg");
            if ivl.fixed() {
                blocked[r] = 0;
                used[r] = 0;
            } else {
                used[r] = used[r].min(ivl.first_use_after(cur_start));
            }
        }

        for &id in &self.inactive {
            let ivl = &self.intervals[id];
            let r = ivl.reg.expect("inactive interval without reg");
            if blocked[r] == 0 {
                continue;
            }
            let intersect_pos = next_intersect(&self.intervals[cur], ivl);
            if intersect_pos == MAX_POS {
                continue;
            }
            if ivl.fixed() {
                blocked[r] = blocked[r].min(intersect_pos);
                used[r] = used[r].min(blocked[r]);
            } else {
                used[r] = used[r].min(ivl.first_use_after(cur_start));
            }
        }

        // The victim is the register whose first use is farthest away.
        let r = used.find_farthest();
        if used[r] < self.intervals[cur].first_use() {
            // Every register is needed before `cur` first needs one:
            // spill `cur` itself.
            return self.spill(cur);
        }

        let block_pos = blocked[r];
        if block_pos < self.intervals[cur].end() {
            // Every usable register meets a fixed interval before `cur`
            // ends, so `cur` must be split before that point.
            debug_assert!({
                let prev_use = self.intervals[cur].last_use_before(block_pos);
                prev_use.max(cur_start + 1) <= block_pos
            });

            let split_pos = self.nearest_split_before(block_pos);
            if split_pos > self.intervals[cur].start() {
                let second = self.intervals.split(cur, split_pos, true);
                self.push_pending(second);
            }
        }

        self.spill_others(cur, r)?;
        self.assign_reg(cur, r)
    }

    /// Split and spill every interval holding `r` that conflicts with
    /// `cur`, from `cur`'s start onward.
    fn spill_others(&mut self, cur: IntervalId, r: PhysReg) -> Result<(), RegAllocError> {
        let cur_start = self.intervals[cur].start();
        let cur_end = self.intervals[cur].end();

        let mut active = std::mem::take(&mut self.active);
        let mut i = 0;
        while i < active.len() {
            let other = active[i];
            let keep = {
                let ivl = &self.intervals[other];
                ivl.fixed() || ivl.reg != Some(r)
            };
            if keep {
                i += 1;
                continue;
            }
            active.swap_remove(i);
            self.spill_after(other, cur_start)?;
        }
        self.active = active;

        let mut inactive = std::mem::take(&mut self.inactive);
        let mut i = 0;
        while i < inactive.len() {
            let other = inactive[i];
            let keep = {
                let ivl = &self.intervals[other];
                ivl.fixed() || ivl.reg != Some(r)
            };
            if keep {
                i += 1;
                continue;
            }
            if next_intersect(&self.intervals[cur], &self.intervals[other]) >= cur_end {
                i += 1;
                continue;
            }
            inactive.swap_remove(i);
            self.spill_after(other, cur_start)?;
        }
        self.inactive = inactive;
        Ok(())
    }

    /// Split `ivl` at the nearest point before `cur_start` and spill the
    /// tail; if the split would land at or before its start, spill all of
    /// it.
    fn spill_after(&mut self, ivl: IntervalId, cur_start: Position) -> Result<(), RegAllocError> {
        let split_pos = self.nearest_split_before(cur_start);
        let tail = if split_pos <= self.intervals[ivl].start() {
            ivl
        } else {
            self.intervals.split(ivl, split_pos, false)
        };
        self.spill(tail)
    }

    /// Spill `id` from its start to its first register use: if there is
    /// such a use, split just before it and re-enqueue the rest.
    fn spill(&mut self, id: IntervalId) -> Result<(), RegAllocError> {
        let (first_use, end, start) = {
            let ivl = &self.intervals[id];
            (ivl.first_use(), ivl.end(), ivl.start())
        };
        if first_use <= end {
            let split_pos = self.nearest_split_before(first_use);
            if split_pos <= start {
                // More values need registers at one position than exist;
                // happens at phis and call argument setup.
                trace!("punt: cannot split {} before first use", self.intervals[id].vreg);
                return Err(RegAllocError::RegSpill);
            }
            let second = self.intervals.split(id, split_pos, false);
            self.push_pending(second);
        }
        self.intervals[id].reg = None;
        if !self.intervals[id].constant {
            self.assign_spill(id)?;
        }
        Ok(())
    }

    /// Give `id`'s chain a spill slot, if it doesn't have one yet.
    ///
    /// A slot tracks the highest position at which it was owned, and is
    /// only reassigned to a lifetime that starts strictly above that high
    /// water mark. Wide values take an aligned pair of slots.
    fn assign_spill(&mut self, id: IntervalId) -> Result<(), RegAllocError> {
        debug_assert!(!self.intervals[id].fixed());

        let leader = self.intervals.leader(id);
        if self.intervals[leader].slot.is_some() {
            return Ok(());
        }
        let start = self.intervals[leader].start();
        let wide = self.intervals[leader].wide;

        if !wide {
            for slot in 0..MAX_SPILL_SLOTS {
                if start >= self.spill_slots[slot] {
                    self.take_slot(leader, slot, wide);
                    return Ok(());
                }
            }
        } else {
            let mut slot = 0;
            while slot + 1 < MAX_SPILL_SLOTS {
                if start >= self.spill_slots[slot] && start >= self.spill_slots[slot + 1] {
                    self.take_slot(leader, slot, wide);
                    return Ok(());
                }
                slot += 2;
            }
        }

        trace!("punt: out of spill slots");
        Err(RegAllocError::TooManySpills)
    }

    fn take_slot(&mut self, leader: IntervalId, slot: usize, wide: bool) {
        self.intervals[leader].slot = Some(slot as u32);
        self.info.num_spills += 1;
        self.spill_slots[slot] = MAX_POS;
        if wide {
            self.spill_slots[slot + 1] = MAX_POS;
            self.info.used_spill_slots = self.info.used_spill_slots.max(slot as u32 + 2);
        } else {
            self.info.used_spill_slots = self.info.used_spill_slots.max(slot as u32 + 1);
        }
    }

    /// Record the assignment of `r` to `id` and activate it. An interval
    /// with no uses at all doesn't need a register; it is spilled directly.
    fn assign_reg(&mut self, id: IntervalId, r: PhysReg) -> Result<(), RegAllocError> {
        let ivl = &mut self.intervals[id];
        if !ivl.fixed() && ivl.uses.is_empty() {
            ivl.reg = None;
            if !ivl.constant {
                self.assign_spill(id)?;
            }
        } else {
            trace!("assign {} to {}", r, ivl.vreg);
            ivl.reg = Some(r);
            self.active.push(id);
        }
        Ok(())
    }
}
