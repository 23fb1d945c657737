use std::sync::Arc;

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// One concrete occurrence of an availability entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerInterval {
    pub entry_id: Ulid,
    pub window: Window,
    pub kind: EntryKind,
}

/// Per-provider record of declared availability, breaks and time off.
///
/// Entries never overlap each other: `check_declaration` rejects a new entry
/// if any of its occurrences touches an existing one, whatever the kinds.
/// Recurring entries are expanded into their occurrences on insert, so every
/// lookup is a range scan over one sorted vector.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    entries: Vec<AvailabilityEntry>,
    /// Occurrences of every entry, sorted by `window.start`.
    intervals: Vec<LedgerInterval>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[AvailabilityEntry] {
        &self.entries
    }

    pub fn entry(&self, id: &Ulid) -> Option<&AvailabilityEntry> {
        self.entries.iter().find(|e| e.id == *id)
    }

    pub fn interval_count(&self) -> usize {
        self.intervals.len()
    }

    /// Occurrences whose window overlaps `query`, in start order.
    pub fn overlapping(&self, query: &Window) -> impl Iterator<Item = &LedgerInterval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.window.start() < query.end());
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.window.end() > query.start())
    }

    /// Reject `entry` if it overlaps anything already declared, or itself.
    pub fn check_declaration(&self, entry: &AvailabilityEntry) -> Result<(), EngineError> {
        let mut previous: Option<Window> = None;
        for occurrence in entry.occurrences() {
            if let Some(prev) = previous
                && prev.overlaps(&occurrence)
            {
                return Err(EngineError::OverlapConflict(entry.id));
            }
            if let Some(existing) = self.overlapping(&occurrence).next() {
                return Err(EngineError::OverlapConflict(existing.entry_id));
            }
            previous = Some(occurrence);
        }
        Ok(())
    }

    /// Insert without checking. Callers run `check_declaration` first; replay does not.
    pub fn insert(&mut self, entry: AvailabilityEntry) {
        for window in entry.occurrences() {
            let pos = self
                .intervals
                .partition_point(|i| i.window.start() <= window.start());
            self.intervals.insert(
                pos,
                LedgerInterval {
                    entry_id: entry.id,
                    window,
                    kind: entry.kind,
                },
            );
        }
        self.entries.push(entry);
    }

    pub fn remove(&mut self, id: &Ulid) -> Option<AvailabilityEntry> {
        let pos = self.entries.iter().position(|e| e.id == *id)?;
        self.intervals.retain(|i| i.entry_id != *id);
        Some(self.entries.remove(pos))
    }

    /// True iff `window` lies inside the union of AVAILABLE occurrences and touches
    /// no blocking one. Back-to-back AVAILABLE occurrences count as continuous.
    pub fn is_available(&self, window: &Window) -> bool {
        let mut covered_until = window.start();
        for interval in self.overlapping(window) {
            if interval.kind.is_blocking() {
                return false;
            }
            if interval.window.start() > covered_until {
                // Gap before this occurrence.
                return false;
            }
            covered_until = covered_until.max(interval.window.end());
        }
        covered_until >= window.end()
    }

    /// Bookable time inside `range`: AVAILABLE occurrences minus blocking ones.
    pub fn slots(&self, range: &Window) -> Slots {
        let mut open = Vec::new();
        let mut blocked = Vec::new();
        for interval in self.overlapping(range) {
            let Some(clamped) = interval.window.clamp_to(range) else {
                continue;
            };
            if interval.kind.is_blocking() {
                blocked.push(clamped);
            } else {
                open.push(clamped);
            }
        }
        Slots::new(merge_overlapping(&open), merge_overlapping(&blocked))
    }
}

/// Lazy `open - blocked` over two sorted, disjoint window lists.
///
/// Each call to `next` does only the subtraction work needed for the next
/// free window. Clone it (or call `rewind`) to walk the sequence again.
#[derive(Debug, Clone)]
pub struct Slots {
    open: Arc<[Window]>,
    blocked: Arc<[Window]>,
    next_open: usize,
    next_block: usize,
    /// Unconsumed tail of the open window currently being cut.
    remainder: Option<Window>,
}

impl Slots {
    pub fn new(open: Vec<Window>, blocked: Vec<Window>) -> Self {
        Self {
            open: open.into(),
            blocked: blocked.into(),
            next_open: 0,
            next_block: 0,
            remainder: None,
        }
    }

    pub fn rewind(&mut self) {
        self.next_open = 0;
        self.next_block = 0;
        self.remainder = None;
    }
}

impl Iterator for Slots {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        loop {
            let current = match self.remainder.take() {
                Some(w) => w,
                None => {
                    let w = *self.open.get(self.next_open)?;
                    self.next_open += 1;
                    w
                }
            };

            while self
                .blocked
                .get(self.next_block)
                .is_some_and(|b| b.end() <= current.start())
            {
                self.next_block += 1;
            }

            let Some(block) = self.blocked.get(self.next_block) else {
                return Some(current);
            };
            if block.start() >= current.end() {
                return Some(current);
            }

            if block.end() < current.end() {
                self.remainder = Some(Window::span(block.end(), current.end()));
            }
            if block.start() > current.start() {
                return Some(Window::span(current.start(), block.start()));
            }
        }
    }
}

/// Merge sorted overlapping/adjacent windows into disjoint windows.
pub fn merge_overlapping(sorted: &[Window]) -> Vec<Window> {
    let mut merged: Vec<Window> = Vec::new();
    for &window in sorted {
        if let Some(last) = merged.last_mut()
            && window.start() <= last.end()
        {
            *last = Window::span(last.start(), last.end().max(window.end()));
            continue;
        }
        merged.push(window);
    }
    merged
}

/// `base - to_remove`, both sorted by start.
pub fn subtract_windows(base: &[Window], to_remove: &[Window]) -> Vec<Window> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start();

        while ri < to_remove.len() && to_remove[ri].end() <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start() < b.end() {
            let r = to_remove[j];
            if r.start() > current_start {
                result.push(Window::span(current_start, r.start()));
            }
            current_start = current_start.max(r.end());
            j += 1;
        }

        if current_start < b.end() {
            result.push(Window::span(current_start, b.end()));
        }
    }

    result
}
