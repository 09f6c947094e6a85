use fnv::FnvHashMap as HashMap;
use log::{debug, warn};
use nix::unistd::Pid;

use crate::arch::{Word, TRAP_BYTE};
use crate::util::{peek, poke};

/// Replaces the low byte of a text word with the trap instruction.
fn armed(word: Word) -> Word {
    (word & !0xFF) | TRAP_BYTE as Word
}

/// Restores the original low byte into the word currently in memory,
/// leaving the upper seven bytes as they are now.
fn restored(current: Word, original: Word) -> Word {
    (current & !0xFF) | (original & 0xFF)
}

/// The set of installed traps: original text words keyed by address,
/// plus the function-entry addresses mapped to their spec index.
///
/// Callers serialize access through the engine's reader-writer lock;
/// every mutating operation here expects the unique writer side.
#[derive(Debug, Default)]
pub struct BreakpointTable {
    originals: HashMap<Word, Word>,
    functions: HashMap<Word, usize>,
    min: Word,
    max: Word,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.originals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.originals.is_empty()
    }

    pub fn contains(&self, addr: Word) -> bool {
        self.originals.contains_key(&addr)
    }

    /// Lowest and highest installed addresses, used to bound repair
    /// scans after an overlapping mmap.
    pub fn watermarks(&self) -> (Word, Word) {
        (self.min, self.max)
    }

    /// The trap leaves rip one past the trap byte; an installed
    /// breakpoint covers `rip` iff it lives at `rip - 1`.
    pub fn covers(&self, rip: Word) -> Option<Word> {
        let addr = rip.wrapping_sub(1);
        self.contains(addr).then_some(addr)
    }

    /// Function-entry lookup for a trap at `rip`.
    pub fn function_at(&self, rip: Word) -> Option<(Word, usize)> {
        let addr = rip.wrapping_sub(1);
        self.functions.get(&addr).map(|&index| (addr, index))
    }

    pub fn map_function(&mut self, addr: Word, index: usize) {
        self.functions.insert(addr, index);
    }

    fn remember(&mut self, addr: Word, original: Word) {
        self.originals.insert(addr, original);
        if self.originals.len() == 1 {
            self.min = addr;
            self.max = addr;
        } else {
            self.min = self.min.min(addr);
            self.max = self.max.max(addr);
        }
    }

    /// Reads and saves the original text word at `addr`, then arms the
    /// trap byte.
    pub fn install(&mut self, tid: Pid, addr: Word) -> nix::Result<()> {
        let original = peek(tid, addr)?;
        self.remember(addr, original);
        self.enable(tid, addr)
    }

    /// Re-arms the trap byte, preserving whatever the upper bytes hold
    /// now.
    pub fn enable(&mut self, tid: Pid, addr: Word) -> nix::Result<()> {
        let current = peek(tid, addr)?;
        poke(tid, addr, armed(current))
    }

    /// Restores the original low byte. Idempotent: a missing trap byte
    /// only warns, since a concurrent repair or a loader rewrite may
    /// already have cleared it.
    pub fn disable(&mut self, tid: Pid, addr: Word) -> nix::Result<()> {
        let current = peek(tid, addr)?;
        if current & 0xFF != TRAP_BYTE as Word {
            warn!(
                "[{}] breakpoint already disabled: {:#x} at {:#x}",
                tid, current, addr
            );
            return Ok(());
        }
        let original = self.originals[&addr];
        poke(tid, addr, restored(current, original))
    }

    /// Re-installs every breakpoint in `[lo, hi]` whose trap byte was
    /// overwritten, re-reading the original word since the text itself
    /// may have changed.
    pub fn range_repair(&mut self, tid: Pid, lo: Word, hi: Word) -> nix::Result<()> {
        let stale = self
            .originals
            .keys()
            .copied()
            .filter(|&addr| addr >= lo && addr <= hi)
            .collect::<Vec<_>>();
        for addr in stale {
            let current = peek(tid, addr)?;
            if current & 0xFF != TRAP_BYTE as Word {
                debug!("[{}] repairing breakpoint at {:#x}", tid, addr);
                self.install(tid, addr)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arming_replaces_only_the_low_byte() {
        let word = 0x1122_3344_5566_7788u64;
        assert_eq!(armed(word), 0x1122_3344_5566_77CC);
        assert_eq!(armed(word) & !0xFF, word & !0xFF);
    }

    #[test]
    fn restore_preserves_current_upper_bytes() {
        let original = 0x1122_3344_5566_7788u64;
        // another breakpoint was armed in the same word meanwhile
        let current = 0xCC22_3344_5566_77CCu64;
        assert_eq!(restored(current, original), 0xCC22_3344_5566_7788);
    }

    #[test]
    fn covers_is_off_by_one() {
        let mut table = BreakpointTable::new();
        table.remember(0x1000, 0);
        assert_eq!(table.covers(0x1001), Some(0x1000));
        assert_eq!(table.covers(0x1000), None);
    }

    #[test]
    fn function_lookup_is_off_by_one() {
        let mut table = BreakpointTable::new();
        table.map_function(0x2000, 7);
        assert_eq!(table.function_at(0x2001), Some((0x2000, 7)));
        assert_eq!(table.function_at(0x2002), None);
    }

    #[test]
    fn watermarks_track_min_and_max() {
        let mut table = BreakpointTable::new();
        table.remember(0x5000, 0);
        assert_eq!(table.watermarks(), (0x5000, 0x5000));
        table.remember(0x1000, 0);
        table.remember(0x9000, 0);
        assert_eq!(table.watermarks(), (0x1000, 0x9000));
    }
}
