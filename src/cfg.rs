//! CFG utilities: block ordering, predecessor tables, critical-edge
//! splitting, and the worklist driving the iterative dataflow passes.

use crate::ir::{succs, succs_mut, Area, Vinstr, Vlabel, Vop, Vunit};
use cranelift_entity::SecondaryMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Sort the reachable blocks of `unit` so that every predecessor comes
/// before its successors, except for loop back-edges. Within that order,
/// main-area blocks are laid out before cold ones, with the entry first.
pub fn sort_blocks(unit: &Vunit) -> Vec<Vlabel> {
    // Iterative DFS producing a postorder, then reverse it.
    let mut seen = SecondaryMap::<Vlabel, bool>::new();
    let mut postorder = Vec::new();
    let mut stack: Vec<(Vlabel, usize)> = vec![(unit.entry, 0)];
    seen[unit.entry] = true;

    while let Some(&(b, next)) = stack.last() {
        let ss = unit.succs(b);
        if next < ss.len() {
            stack.last_mut().unwrap().1 += 1;
            let s = ss[next];
            if !seen[s] {
                seen[s] = true;
                stack.push((s, 0));
            }
        } else {
            postorder.push(b);
            stack.pop();
        }
    }
    postorder.reverse();

    // Stable partition: main blocks first, cold blocks after. The entry is
    // a main block and stays first.
    let mut sorted = Vec::with_capacity(postorder.len());
    sorted.extend(
        postorder
            .iter()
            .copied()
            .filter(|&b| unit.blocks[b].area == Area::Main),
    );
    sorted.extend(
        postorder
            .iter()
            .copied()
            .filter(|&b| unit.blocks[b].area == Area::Cold),
    );
    debug_assert_eq!(sorted[0], unit.entry);
    sorted
}

/// Predecessor lists for every block of `unit`.
pub fn compute_preds(unit: &Vunit) -> SecondaryMap<Vlabel, Vec<Vlabel>> {
    let mut preds = SecondaryMap::<Vlabel, Vec<Vlabel>>::new();
    for (b, _) in unit.blocks.iter() {
        for &s in unit.succs(b) {
            preds[s].push(b);
        }
    }
    preds
}

/// Split every critical edge of `unit` by interposing an empty block, so
/// that edge copies always have a place of their own.
///
/// A `phijcc` with a critical out-edge cannot be split naively: its uses
/// feed the `phidef` of both targets. It is lowered to a plain `jcc` whose
/// targets are fresh blocks carrying `phijmp` with the same uses, which
/// keeps the phi data flow intact on every (now non-critical) edge.
///
/// Returns true if the CFG changed.
pub fn split_critical_edges(unit: &mut Vunit) -> bool {
    let mut npreds = SecondaryMap::<Vlabel, u32>::new();
    for (b, _) in unit.blocks.iter() {
        for &s in unit.succs(b) {
            npreds[s] += 1;
        }
    }

    let mut changed = false;
    let labels: Vec<Vlabel> = unit.blocks.keys().collect();
    for b in labels {
        let Some(last) = unit.blocks[b].code.last() else {
            continue;
        };
        let targets = succs(last);
        if targets.len() < 2 {
            continue;
        }
        let critical = targets.iter().any(|&s| npreds[s] > 1);
        if !critical {
            continue;
        }
        let area = unit.blocks[b].area;

        if let Vop::Phijcc {
            cc,
            sf,
            uses,
            targets,
        } = last.op.clone()
        {
            let origin = unit.blocks[b].code.last().unwrap().origin;
            let mut middles = [targets[0]; 2];
            for (i, &target) in targets.iter().enumerate() {
                let m = unit.make_block(area);
                let mut jmp = Vinstr::new(Vop::Phijmp { uses, target });
                jmp.origin = origin;
                unit.blocks[m].code.push(jmp);
                middles[i] = m;
            }
            let last = unit.blocks[b].code.last_mut().unwrap();
            last.op = Vop::Jcc {
                cc,
                sf,
                targets: middles,
            };
            changed = true;
            continue;
        }

        for i in 0..targets.len() {
            let target = succs(unit.blocks[b].code.last().unwrap())[i];
            if npreds[target] <= 1 {
                continue;
            }
            let origin = unit.blocks[b].code.last().unwrap().origin;
            let m = unit.make_block(area);
            let mut jmp = Vinstr::new(Vop::Jmp { target });
            jmp.origin = origin;
            unit.blocks[m].code.push(jmp);
            succs_mut(unit.blocks[b].code.last_mut().unwrap())[i] = m;
            changed = true;
        }
    }
    changed
}

/// A priority worklist over dense u32 ids, popping the smallest first.
/// Re-pushing an id already queued is a no-op, which is exactly what the
/// iterative dataflow passes want.
pub struct DataflowWorklist {
    heap: BinaryHeap<Reverse<u32>>,
    queued: Vec<bool>,
}

impl DataflowWorklist {
    /// An empty worklist for ids below `n`.
    pub fn new(n: usize) -> DataflowWorklist {
        DataflowWorklist {
            heap: BinaryHeap::with_capacity(n),
            queued: vec![false; n],
        }
    }

    /// Enqueue `id` unless it is already queued.
    pub fn push(&mut self, id: u32) {
        if !self.queued[id as usize] {
            self.queued[id as usize] = true;
            self.heap.push(Reverse(id));
        }
    }

    /// Pop the smallest queued id.
    pub fn pop(&mut self) -> Option<u32> {
        let Reverse(id) = self.heap.pop()?;
        self.queued[id as usize] = false;
        Some(id)
    }

    /// Is the worklist empty?
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Cond, PhysReg, Vreg};

    fn sf() -> Vreg {
        Vreg::from(PhysReg::SF)
    }

    /// entry -> {left, right} -> join -> exit
    fn diamond() -> (Vunit, Vlabel, Vlabel, Vlabel) {
        let mut unit = Vunit::new();
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
            .push(Vinstr::new(Vop::Jmp { target: join }));
        unit.blocks[right]
            .code
            .push(Vinstr::new(Vop::Jmp { target: join }));
        unit.blocks[join]
            .code
            .push(Vinstr::new(Vop::Jmpi { target: 0 }));
        (unit, left, right, join)
    }

    #[test]
    fn rpo_on_diamond() {
        let (unit, left, right, join) = diamond();
        let order = sort_blocks(&unit);
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], unit.entry);
        assert_eq!(order[3], join);
        assert!(order.contains(&left) && order.contains(&right));
    }

    #[test]
    fn cold_blocks_sort_last() {
        let mut unit = Vunit::new();
        let cold = unit.make_block(Area::Cold);
        let tail = unit.make_block(Area::Main);
        let entry = unit.entry;
        unit.blocks[entry].code.push(Vinstr::new(Vop::Jcc {
            cc: Cond::E,
            sf: sf(),
            targets: [cold, tail],
        }));
        unit.blocks[cold]
            .code
            .push(Vinstr::new(Vop::Jmpi { target: 0 }));
        unit.blocks[tail]
            .code
            .push(Vinstr::new(Vop::Jmpi { target: 0 }));
        let order = sort_blocks(&unit);
        assert_eq!(order, vec![entry, tail, cold]);
    }

    #[test]
    fn preds_of_join() {
        let (unit, left, right, join) = diamond();
        let preds = compute_preds(&unit);
        assert_eq!(preds[join].len(), 2);
        assert!(preds[join].contains(&left) && preds[join].contains(&right));
        assert!(preds[unit.entry].is_empty());
    }

    #[test]
    fn splits_critical_edge() {
        // entry jcc {side, join}; side jmp join: the entry->join edge is
        // critical (entry has 2 succs, join has 2 preds).
        let mut unit = Vunit::new();
        let side = unit.make_block(Area::Main);
        let join = unit.make_block(Area::Main);
        let entry = unit.entry;
        unit.blocks[entry].code.push(Vinstr::new(Vop::Jcc {
            cc: Cond::E,
            sf: sf(),
            targets: [side, join],
        }));
        unit.blocks[side]
            .code
            .push(Vinstr::new(Vop::Jmp { target: join }));
        unit.blocks[join]
            .code
            .push(Vinstr::new(Vop::Jmpi { target: 0 }));

        assert!(split_critical_edges(&mut unit));
        let entry_succs: Vec<_> = unit.succs(entry).to_vec();
        assert_eq!(entry_succs[0], side);
        let middle = entry_succs[1];
        assert_ne!(middle, join);
        assert_eq!(unit.succs(middle), &[join]);

        // No critical edges remain.
        assert!(!split_critical_edges(&mut unit));
    }

    #[test]
    fn worklist_dedups_and_orders() {
        let mut wl = DataflowWorklist::new(8);
        wl.push(5);
        wl.push(2);
        wl.push(5);
        assert_eq!(wl.pop(), Some(2));
        wl.push(1);
        assert_eq!(wl.pop(), Some(1));
        assert_eq!(wl.pop(), Some(5));
        assert_eq!(wl.pop(), None);
        assert!(wl.is_empty());
    }
}
