//! Linear-scan register allocation.
//!
//! Runs per function over live intervals collected from the AST in
//! emission order. Only callee-saved registers are handed to named
//! locals, so variable lifetimes survive nested calls; caller-saved
//! registers stay free for expression scratch.
//!
//! The scan is the classic one: intervals sorted by start; active list
//! sorted by end; expired intervals release their registers; on
//! pressure, whichever of the new and the furthest-ending active
//! interval ends later is spilled to a deterministic stack slot.

use rustc_hash::FxHashMap;
use veld_asm::emit::Frame;
use veld_asm::CallConv;

/// A variable's live range, in driver positions.
#[derive(Debug, Clone)]
pub struct Interval {
    pub name: String,
    pub start: u32,
    pub end: u32,
    pub defs: Vec<u32>,
    pub uses: Vec<u32>,
}

/// Where a variable lives for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Home {
    /// A callee-saved register (hardware encoding).
    Reg(u8),
    /// An 8-byte spill slot index within the frame's spill area.
    Slot(u32),
}

/// The allocation result for one function.
#[derive(Debug, Default)]
pub struct Allocation {
    homes: FxHashMap<String, Home>,
    used_callee_saved: Vec<u8>,
    spill_slots: u32,
}

impl Allocation {
    pub fn home(&self, name: &str) -> Option<Home> {
        self.homes.get(name).copied()
    }

    /// Callee-saved registers the prologue must preserve, in
    /// allocation order.
    pub fn used_callee_saved(&self) -> &[u8] {
        &self.used_callee_saved
    }

    pub fn spill_slots(&self) -> u32 {
        self.spill_slots
    }

    /// The frame shape for prologue/epilogue synthesis.
    pub fn frame(&self) -> Frame {
        Frame {
            saved: self.used_callee_saved.clone(),
            spill_slots: self.spill_slots,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Home)> {
        self.homes.iter()
    }
}

/// Incrementally builds intervals as the driver walks the AST.
#[derive(Debug, Default)]
pub struct IntervalBuilder {
    position: u32,
    intervals: FxHashMap<String, Interval>,
    order: Vec<String>,
}

impl IntervalBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the monotonic position counter.
    pub fn step(&mut self) -> u32 {
        self.position += 1;
        self.position
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    /// A store to `name` at the current position.
    pub fn record_def(&mut self, name: &str) {
        let pos = self.position;
        let entry = self.entry(name, pos);
        entry.defs.push(pos);
        entry.end = entry.end.max(pos);
    }

    /// A load of `name` at the current position.
    pub fn record_use(&mut self, name: &str) {
        let pos = self.position;
        let entry = self.entry(name, pos);
        entry.uses.push(pos);
        entry.end = entry.end.max(pos);
    }

    /// Extend `name`'s interval to at least the current position
    /// (loop-carried variables stay live across the whole loop body).
    pub fn extend_to_here(&mut self, name: &str) {
        let pos = self.position;
        if let Some(entry) = self.intervals.get_mut(name) {
            entry.end = entry.end.max(pos);
        }
    }

    /// A loop body spanning `loop_start..now` closed: every interval
    /// that was live on entry and touched inside the body stays live
    /// to the bottom, so the back edge can re-read it.
    pub fn extend_live_across(&mut self, loop_start: u32) {
        let pos = self.position;
        for entry in self.intervals.values_mut() {
            if entry.start < loop_start && entry.end >= loop_start {
                entry.end = entry.end.max(pos);
            }
        }
    }

    fn entry(&mut self, name: &str, pos: u32) -> &mut Interval {
        if !self.intervals.contains_key(name) {
            self.order.push(name.to_string());
            self.intervals.insert(
                name.to_string(),
                Interval {
                    name: name.to_string(),
                    start: pos,
                    end: pos,
                    defs: Vec::new(),
                    uses: Vec::new(),
                },
            );
        }
        self.intervals.get_mut(name).unwrap()
    }

    /// Intervals in first-touch order.
    pub fn finish(self) -> Vec<Interval> {
        let mut intervals = self.intervals;
        self.order
            .iter()
            .map(|n| intervals.remove(n).unwrap())
            .collect()
    }
}

/// Allocate homes for every interval against a target's callee-saved
/// register set.
pub fn allocate(mut intervals: Vec<Interval>, cc: &CallConv) -> Allocation {
    intervals.sort_by_key(|i| (i.start, i.end));

    struct Active {
        end: u32,
        reg: u8,
        name: String,
    }

    let mut free: Vec<u8> = cc.callee_saved.to_vec();
    free.reverse(); // pop from the front of the allocation order
    let mut active: Vec<Active> = Vec::new();
    let mut alloc = Allocation::default();
    let mut next_slot = 0u32;

    for interval in intervals {
        // Expire intervals that ended before this one starts.
        let mut i = 0;
        while i < active.len() {
            if active[i].end < interval.start {
                let done = active.remove(i);
                free.push(done.reg);
            } else {
                i += 1;
            }
        }

        if let Some(reg) = free.pop() {
            if !alloc.used_callee_saved.contains(&reg) {
                alloc.used_callee_saved.push(reg);
            }
            alloc.homes.insert(interval.name.clone(), Home::Reg(reg));
            let pos = active
                .binary_search_by_key(&interval.end, |a| a.end)
                .unwrap_or_else(|p| p);
            active.insert(
                pos,
                Active {
                    end: interval.end,
                    reg,
                    name: interval.name,
                },
            );
            continue;
        }

        // Spill: evict whichever of the new interval and the furthest
        // active interval lives longer.
        let last = active.last().expect("no free registers means non-empty active list");
        if last.end > interval.end {
            let evicted = active.pop().unwrap();
            alloc
                .homes
                .insert(evicted.name, Home::Slot(next_slot));
            alloc
                .homes
                .insert(interval.name.clone(), Home::Reg(evicted.reg));
            let pos = active
                .binary_search_by_key(&interval.end, |a| a.end)
                .unwrap_or_else(|p| p);
            active.insert(
                pos,
                Active {
                    end: interval.end,
                    reg: evicted.reg,
                    name: interval.name,
                },
            );
        } else {
            alloc.homes.insert(interval.name.clone(), Home::Slot(next_slot));
        }
        next_slot += 1;
    }

    alloc.spill_slots = next_slot;
    alloc
}
