//! Bounded trace of executed instructions and the replay cursor that moves
//! over it. The call-stack reconstruction built on top lives in [`callstack`].

pub mod callstack;
pub mod opcode;

use crate::error::Error;
use crate::registers::Z80Registers;
use std::collections::VecDeque;

/// Snapshot of one executed instruction. Immutable once recorded.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HistoryEntry {
    /// Register file before the instruction executed.
    pub regs: Z80Registers,
    /// Raw opcode bytes at PC.
    pub opcode: [u8; 4],
    /// The two bytes at (SP), recorded only by full ("true") history.
    pub sp_word: Option<u16>,
}

impl HistoryEntry {
    pub fn new(regs: Z80Registers, opcode: [u8; 4], sp_word: Option<u16>) -> Self {
        HistoryEntry {
            regs,
            opcode,
            sp_word,
        }
    }
}

/// Storage strategy for the instruction trace. The two implementations are
/// functionally equivalent; they differ in what they are optimized for.
pub trait InstructionTrace {
    /// Append a snapshot, evicting the oldest entry when full.
    fn record(&mut self, entry: HistoryEntry);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;

    /// Entry counted back from the most recent one (0 = newest).
    fn entry_back(&self, index: usize) -> Option<&HistoryEntry>;

    fn clear(&mut self);
}

/// Append-with-size-cap list. Natural fit for on-demand remote-fetched
/// history where entries arrive in batches and eviction is rare.
pub struct CappedTrace {
    entries: VecDeque<HistoryEntry>,
    cap: usize,
}

impl CappedTrace {
    pub fn new(cap: usize) -> Self {
        CappedTrace {
            entries: VecDeque::with_capacity(cap.min(4096)),
            cap,
        }
    }
}

impl InstructionTrace for CappedTrace {
    fn record(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn capacity(&self) -> usize {
        self.cap
    }

    fn entry_back(&self, index: usize) -> Option<&HistoryEntry> {
        self.entries.len().checked_sub(index + 1).map(|i| &self.entries[i])
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Fixed-capacity ring buffer. Built for a locally-simulated CPU that
/// records an entry per executed instruction: overwriting the oldest slot is
/// O(1) with no shifting. The store owns the write cursor; the read side is
/// the replay cursor of [`HistoryEngine`].
pub struct RingTrace {
    slots: Box<[Option<HistoryEntry>]>,
    /// Next slot to write.
    write: usize,
    len: usize,
}

impl RingTrace {
    pub fn new(cap: usize) -> Self {
        RingTrace {
            slots: vec![None; cap.max(1)].into_boxed_slice(),
            write: 0,
            len: 0,
        }
    }
}

impl InstructionTrace for RingTrace {
    fn record(&mut self, entry: HistoryEntry) {
        self.slots[self.write] = Some(entry);
        self.write = (self.write + 1) % self.slots.len();
        self.len = (self.len + 1).min(self.slots.len());
    }

    fn len(&self) -> usize {
        self.len
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn entry_back(&self, index: usize) -> Option<&HistoryEntry> {
        if index >= self.len {
            return None;
        }
        let cap = self.slots.len();
        let slot = (self.write + cap - 1 - index) % cap;
        self.slots[slot].as_ref()
    }

    fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.write = 0;
        self.len = 0;
    }
}

/// Trace plus replay cursor. Cursor `None` means "live" (not replaying);
/// `Some(k)` means the debugger currently sits at the k-th entry counted
/// back from the present.
pub struct HistoryEngine {
    trace: Box<dyn InstructionTrace + Send + Sync>,
    cursor: Option<usize>,
}

impl HistoryEngine {
    pub fn new(trace: Box<dyn InstructionTrace + Send + Sync>) -> Self {
        HistoryEngine {
            trace,
            cursor: None,
        }
    }

    pub fn capped(cap: usize) -> Self {
        Self::new(Box::new(CappedTrace::new(cap)))
    }

    pub fn ring(cap: usize) -> Self {
        Self::new(Box::new(RingTrace::new(cap)))
    }

    pub fn is_replaying(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.trace.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trace.is_empty()
    }

    pub fn entry(&self, back_index: usize) -> Option<HistoryEntry> {
        self.trace.entry_back(back_index).copied()
    }

    /// Record a snapshot. Recording is only meaningful while live; a replayed
    /// past must stay immutable.
    pub fn record(&mut self, entry: HistoryEntry) {
        if self.is_replaying() {
            log::warn!(target: "history", "snapshot recorded while replaying, dropped");
            return;
        }
        self.trace.record(entry);
    }

    /// Move the cursor one entry into the past. Returns the new cursor
    /// position, or [`Error::HistoryExhausted`] at the window edge.
    pub fn move_back(&mut self) -> Result<usize, Error> {
        let next = match self.cursor {
            None => 0,
            Some(k) => k + 1,
        };
        if next >= self.trace.len() {
            return Err(Error::HistoryExhausted);
        }
        self.cursor = Some(next);
        Ok(next)
    }

    /// Move the cursor one entry toward the present. Returns the new cursor,
    /// `Ok(None)` meaning the live position has been reached.
    pub fn move_forward(&mut self) -> Result<Option<usize>, Error> {
        match self.cursor {
            None => Err(Error::NotReplaying),
            Some(0) => {
                self.cursor = None;
                Ok(None)
            }
            Some(k) => {
                self.cursor = Some(k - 1);
                Ok(Some(k - 1))
            }
        }
    }

    /// Drop the replay position without touching recorded entries.
    pub fn return_to_live(&mut self) {
        self.cursor = None;
    }

    pub fn clear(&mut self) {
        self.trace.clear();
        self.cursor = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pc: u16) -> HistoryEntry {
        let regs = Z80Registers {
            pc,
            ..Default::default()
        };
        HistoryEntry::new(regs, [0; 4], None)
    }

    fn check_store(mut store: Box<dyn InstructionTrace + Send + Sync>) {
        assert_eq!(store.capacity(), 3);
        assert!(store.is_empty());
        assert_eq!(store.entry_back(0), None);

        for pc in 1..=3 {
            store.record(entry(pc));
        }
        assert_eq!(store.len(), 3);
        assert_eq!(store.entry_back(0).unwrap().regs.pc, 3);
        assert_eq!(store.entry_back(2).unwrap().regs.pc, 1);

        // capacity reached: 1 is evicted
        store.record(entry(4));
        assert_eq!(store.len(), 3);
        assert_eq!(store.entry_back(0).unwrap().regs.pc, 4);
        assert_eq!(store.entry_back(2).unwrap().regs.pc, 2);
        assert_eq!(store.entry_back(3), None);

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn capped_store() {
        check_store(Box::new(CappedTrace::new(3)));
    }

    #[test]
    fn ring_store() {
        check_store(Box::new(RingTrace::new(3)));
    }

    #[test]
    fn cursor_navigation() {
        let mut engine = HistoryEngine::ring(8);
        assert!(matches!(engine.move_back(), Err(Error::HistoryExhausted)));

        for pc in 1..=3 {
            engine.record(entry(pc));
        }

        assert_eq!(engine.move_back().unwrap(), 0);
        assert!(engine.is_replaying());
        assert_eq!(engine.move_back().unwrap(), 1);
        assert_eq!(engine.move_back().unwrap(), 2);
        assert!(matches!(engine.move_back(), Err(Error::HistoryExhausted)));

        assert_eq!(engine.move_forward().unwrap(), Some(1));
        assert_eq!(engine.move_forward().unwrap(), Some(0));
        assert_eq!(engine.move_forward().unwrap(), None);
        assert!(!engine.is_replaying());
        assert!(matches!(engine.move_forward(), Err(Error::NotReplaying)));
    }

    #[test]
    fn no_recording_while_replaying() {
        let mut engine = HistoryEngine::capped(8);
        engine.record(entry(1));
        engine.record(entry(2));
        engine.move_back().unwrap();
        engine.record(entry(3));
        assert_eq!(engine.len(), 2);
    }
}
