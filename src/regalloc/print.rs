//! Trace-time rendering of intervals.
//!
//! `dump_intervals` prints one line per interval chain; `print_intervals`
//! renders a column per interval against the instruction stream, with a
//! light bar where the interval is live and a heavy bar at its use
//! positions. Fixed intervals collapse into one summary column unless
//! `XLS_SHOW_FIXED` asks otherwise.

use crate::ir::{Position, Vunit};
use crate::regalloc::interval::{Constraint, Interval, IntervalId, Intervals};
use crate::regalloc::{slot_offset, Options, VxlsContext};
use log::trace;
use std::fmt;
use std::fmt::Write as _;

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut delim = "";
        if let Some(reg) = self.reg {
            write!(f, "{}", reg)?;
            delim = " ";
        }
        if self.constant {
            write!(f, "{}#{:08x}", delim, self.val.map_or(0, |v| v.bits()))?;
            delim = " ";
        }
        if let Some(slot) = self.slot {
            write!(f, "{}[%sp+{}]", delim, slot_offset(slot))?;
        }
        write!(f, " [")?;
        let mut delim = "";
        for r in &self.ranges {
            write!(f, "{}{}-{}", delim, r.start, r.end)?;
            delim = ",";
        }
        write!(f, ") {{")?;
        let mut delim = "";
        for u in &self.uses {
            let marker = if Some(u.pos) == self.def_pos {
                "="
            } else if u.kind == Constraint::CopySrc {
                "=?"
            } else {
                "=@"
            };
            match u.hint {
                Some(h) => write!(f, "{}{}{}{}", delim, h, marker, u.pos)?,
                None => write!(f, "{}{}{}", delim, marker, u.pos)?,
            }
            delim = ",";
        }
        write!(f, "}}")
    }
}

/// Print each interval chain, leaders with their children indented.
pub fn dump_intervals(intervals: &Intervals, num_spills: u32, _opts: &Options) {
    trace!("spills {}", num_spills);
    for id in intervals.ids() {
        let ivl = &intervals[id];
        if ivl.parent.is_some() || ivl.fixed() {
            continue;
        }
        trace!("{:4} {}", ivl.vreg.to_string(), ivl);
        let mut next = ivl.next.expand();
        while let Some(child) = next {
            trace!("     {}", intervals[child]);
            next = intervals[child].next.expand();
        }
    }
}

enum Weight {
    Light,
    Heavy,
}

/// One column cell: does the chain cover/use this position, the next?
fn draw(
    intervals: &Intervals,
    leader: IntervalId,
    pos: Position,
    weight: Weight,
    covers: impl Fn(&Interval, Position) -> bool,
) -> &'static str {
    let f = |pos| {
        let mut next = Some(leader);
        while let Some(id) = next {
            if covers(&intervals[id], pos) {
                return true;
            }
            next = intervals[id].next.expand();
        }
        false
    };
    let top = f(pos);
    let bottom = if pos % 2 == 1 { top } else { f(pos + 1) };
    match (top, bottom, weight) {
        (true, false, Weight::Light) => "\u{2575}",
        (true, false, Weight::Heavy) => "\u{2579}",
        (true, true, Weight::Light) => "\u{2502}",
        (true, true, Weight::Heavy) => "\u{2503}",
        (false, true, Weight::Light) => "\u{2577}",
        (false, true, Weight::Heavy) => "\u{257B}",
        (false, false, _) => " ",
    }
}

/// Render the interval table against the code for tracing.
pub fn print_intervals(
    caption: &str,
    unit: &Vunit,
    ctx: &VxlsContext,
    intervals: &Intervals,
    opts: &Options,
) {
    let mut shown: Vec<IntervalId> = Vec::new();
    let mut fixed: Vec<IntervalId> = Vec::new();
    for id in intervals.ids() {
        let ivl = &intervals[id];
        if ivl.parent.is_some() {
            continue;
        }
        if ivl.fixed() {
            let r = ivl.vreg.phys().expect("fixed interval names a physreg");
            if !opts.show_reserved && !ctx.abi.unreserved().contains(r) {
                continue;
            }
            if !opts.show_fixed {
                fixed.push(id);
                continue;
            }
        }
        shown.push(id);
    }

    let mut out = String::new();
    let _ = writeln!(out, "intervals {}", caption);
    let mut header = String::new();
    for &id in &shown {
        let _ = write!(header, " {:2}", intervals[id].vreg.to_string());
    }
    let _ = writeln!(out, "{} FX", header);

    for &b in &ctx.blocks {
        for inst in &unit.blocks[b].code {
            let pos = inst.pos;
            let mut line = String::new();
            for &id in &shown {
                line.push(' ');
                line.push_str(draw(intervals, id, pos, Weight::Light, |ivl, p| {
                    ivl.covers(p)
                }));
                line.push_str(draw(intervals, id, pos, Weight::Heavy, |ivl, p| {
                    ivl.used_at(p)
                }));
            }
            let fixed_cell = if fixed.iter().any(|&id| intervals[id].covers(pos)) {
                "\u{2503}"
            } else {
                " "
            };
            line.push(' ');
            line.push_str(fixed_cell);
            if pos == ctx.block_ranges[b].start {
                let _ = write!(line, " {:4}", b.to_string());
            } else {
                let _ = write!(line, "     ");
            }
            let _ = writeln!(out, "{} {:3} {:?}", line, pos, inst.op);
        }
    }
    trace!("{}", out);
}
