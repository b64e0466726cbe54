//! Parallel-copy sequencing.
//!
//! A parallel copy is a set of register-to-register moves whose sources are
//! all read before any destination is written. `do_reg_moves` lowers such a
//! set into an ordered schedule of plain copies and exchanges. Cycles
//! between general-purpose registers are broken with an exchange; any other
//! cycle goes through the reserved scratch register.

use crate::ir::PhysReg;

/// How one scheduled move should be emitted.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MoveKind {
    /// `dst = src`.
    Copy,
    /// Swap `src` and `dst`.
    Xchg,
}

/// One scheduled move.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct MoveInfo {
    /// Emission kind.
    pub kind: MoveKind,
    /// Source register.
    pub src: PhysReg,
    /// Destination register.
    pub dst: PhysReg,
}

/// A set of simultaneous moves, keyed by destination. At most one move per
/// destination; iteration is in register index order.
#[derive(Clone)]
pub struct MovePlan {
    srcs: [Option<PhysReg>; PhysReg::COUNT],
}

impl MovePlan {
    /// The empty plan.
    pub fn new() -> MovePlan {
        MovePlan {
            srcs: [None; PhysReg::COUNT],
        }
    }

    /// Schedule `dst = src`. A destination can be written at most once.
    pub fn insert(&mut self, dst: PhysReg, src: PhysReg) {
        debug_assert!(self.srcs[dst.index()].is_none());
        self.srcs[dst.index()] = Some(src);
    }

    /// The source for `dst`, if one is scheduled.
    pub fn get(&self, dst: PhysReg) -> Option<PhysReg> {
        self.srcs[dst.index()]
    }

    /// Iterate `(dst, src)` pairs in destination index order.
    pub fn iter(&self) -> impl Iterator<Item = (PhysReg, PhysReg)> + '_ {
        self.srcs
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|s| (PhysReg::from_index(i), s)))
    }

    /// Is the plan empty?
    pub fn is_empty(&self) -> bool {
        self.srcs.iter().all(|s| s.is_none())
    }
}

impl Default for MovePlan {
    fn default() -> MovePlan {
        MovePlan::new()
    }
}

/// Lower `plan` into an ordered schedule, using `tmp` to break cycles that
/// cannot be handled with an exchange.
pub fn do_reg_moves(plan: &MovePlan, tmp: PhysReg) -> Vec<MoveInfo> {
    let mut how_to = Vec::new();

    // Remaining moves, and how many pending moves read each register.
    let mut pending = plan.srcs;
    let mut readers = [0u32; PhysReg::COUNT];
    for (dst, src) in plan.iter() {
        if src == dst {
            pending[dst.index()] = None; // already in place
        } else {
            readers[src.index()] += 1;
        }
    }

    // Emit every move whose destination no pending move still reads. Each
    // emission may unblock the move that feeds its source.
    let mut ready: Vec<PhysReg> = plan
        .iter()
        .filter(|&(dst, src)| src != dst && readers[dst.index()] == 0)
        .map(|(dst, _)| dst)
        .collect();
    while let Some(dst) = ready.pop() {
        let src = pending[dst.index()].take().unwrap();
        how_to.push(MoveInfo {
            kind: MoveKind::Copy,
            src,
            dst,
        });
        readers[src.index()] -= 1;
        if readers[src.index()] == 0 && pending[src.index()].is_some() {
            ready.push(src);
        }
    }

    // Whatever remains forms disjoint cycles.
    for start in 0..PhysReg::COUNT {
        let start = PhysReg::from_index(start);
        if pending[start.index()].is_none() {
            continue;
        }
        let mut cycle = vec![start];
        let mut r = pending[start.index()].take().unwrap();
        while r != start {
            cycle.push(r);
            r = pending[r.index()].take().unwrap();
        }

        if cycle.len() == 2 && cycle[0].is_gp() && cycle[1].is_gp() {
            how_to.push(MoveInfo {
                kind: MoveKind::Xchg,
                src: cycle[1],
                dst: cycle[0],
            });
        } else {
            // cycle[i] receives cycle[i+1]'s value; save the head, shift
            // the rest up, then restore the tail from the scratch.
            debug_assert!(!cycle.contains(&tmp));
            how_to.push(MoveInfo {
                kind: MoveKind::Copy,
                src: cycle[0],
                dst: tmp,
            });
            for i in 0..cycle.len() - 1 {
                how_to.push(MoveInfo {
                    kind: MoveKind::Copy,
                    src: cycle[i + 1],
                    dst: cycle[i],
                });
            }
            how_to.push(MoveInfo {
                kind: MoveKind::Copy,
                src: tmp,
                dst: *cycle.last().unwrap(),
            });
        }
    }

    how_to
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::regs;

    // Simulate a schedule over a register file where each register initially
    // holds its own index, and return the final contents.
    fn run(how_to: &[MoveInfo]) -> Vec<usize> {
        let mut file: Vec<usize> = (0..PhysReg::COUNT).collect();
        for m in how_to {
            match m.kind {
                MoveKind::Copy => file[m.dst.index()] = file[m.src.index()],
                MoveKind::Xchg => file.swap(m.src.index(), m.dst.index()),
            }
        }
        file
    }

    #[test]
    fn straight_chain() {
        // r2 = r1, r1 = r0: must emit r2 first.
        let mut plan = MovePlan::new();
        plan.insert(PhysReg::gp(2), PhysReg::gp(1));
        plan.insert(PhysReg::gp(1), PhysReg::gp(0));
        let how = do_reg_moves(&plan, regs::XMM15);
        assert_eq!(how.len(), 2);
        let file = run(&how);
        assert_eq!(file[2], 1);
        assert_eq!(file[1], 0);
    }

    #[test]
    fn gp_swap_uses_xchg() {
        let mut plan = MovePlan::new();
        plan.insert(PhysReg::gp(0), PhysReg::gp(1));
        plan.insert(PhysReg::gp(1), PhysReg::gp(0));
        let how = do_reg_moves(&plan, regs::XMM15);
        assert_eq!(how.len(), 1);
        assert_eq!(how[0].kind, MoveKind::Xchg);
        let file = run(&how);
        assert_eq!(file[0], 1);
        assert_eq!(file[1], 0);
    }

    #[test]
    fn simd_cycle_uses_tmp() {
        let mut plan = MovePlan::new();
        plan.insert(PhysReg::simd(0), PhysReg::simd(1));
        plan.insert(PhysReg::simd(1), PhysReg::simd(0));
        let how = do_reg_moves(&plan, regs::XMM15);
        assert!(how.iter().all(|m| m.kind == MoveKind::Copy));
        assert!(how.iter().any(|m| m.dst == regs::XMM15));
        let file = run(&how);
        assert_eq!(file[PhysReg::simd(0).index()], PhysReg::simd(1).index());
        assert_eq!(file[PhysReg::simd(1).index()], PhysReg::simd(0).index());
    }

    #[test]
    fn three_cycle() {
        // r0 <- r1 <- r2 <- r0.
        let mut plan = MovePlan::new();
        plan.insert(PhysReg::gp(0), PhysReg::gp(1));
        plan.insert(PhysReg::gp(1), PhysReg::gp(2));
        plan.insert(PhysReg::gp(2), PhysReg::gp(0));
        let how = do_reg_moves(&plan, regs::XMM15);
        let file = run(&how);
        assert_eq!(file[0], 1);
        assert_eq!(file[1], 2);
        assert_eq!(file[2], 0);
    }

    #[test]
    fn mixed_chain_into_cycle() {
        // r3 = r0 (chain off a cycle r0 <-> r1).
        let mut plan = MovePlan::new();
        plan.insert(PhysReg::gp(3), PhysReg::gp(0));
        plan.insert(PhysReg::gp(0), PhysReg::gp(1));
        plan.insert(PhysReg::gp(1), PhysReg::gp(0));
        let how = do_reg_moves(&plan, regs::XMM15);
        // The chain copy must happen before the swap destroys r0.
        let file = run(&how);
        assert_eq!(file[3], 0);
        assert_eq!(file[0], 1);
        assert_eq!(file[1], 0);
    }

    #[test]
    fn self_move_elided() {
        let mut plan = MovePlan::new();
        plan.insert(PhysReg::gp(5), PhysReg::gp(5));
        assert!(do_reg_moves(&plan, regs::XMM15).is_empty());
    }
}
