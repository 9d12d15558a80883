//! Snapshot capture and restore.
//!
//! A [`Snapshot`] pairs the concrete register file of the suspended debuggee with an
//! O(1) copy of the [`SymbolicState`] at the same instruction boundary. Memory is
//! not copied at capture time. Instead the [`SnapshotManager`] keeps a write journal
//! per snapshot: every memory write observed before the instruction executes
//! records the first pre-image of each byte. Restoring writes those pre-images back,
//! which returns memory to its state at capture.
//!
//! Writes performed by a restore are themselves journaled into every other live
//! snapshot, so restoring one snapshot never corrupts another.
//!
//! A snapshot belongs to the process it was captured in. Once that process has
//! exited, or a new process has started, restoring fails with
//! [`Error::StaleSnapshot`].

use std::{fmt, sync::Arc};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    engine::{Architecture, SymbolicState},
    host::{Debuggee, ProcessState},
    instruction::Register,
    Error, Result,
};

/// Opaque identifier of a captured snapshot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SnapshotHandle(u32);

impl SnapshotHandle {
    /// Numeric value of the handle.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SnapshotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot#{}", self.0)
    }
}

/// Immutable capture of the debuggee and the symbolic state at one instruction boundary.
#[derive(Debug, Clone)]
pub struct Snapshot {
    handle: SnapshotHandle,
    process_id: u32,
    pc: u64,
    registers: Vec<(Register, u64)>,
    state: SymbolicState,
}

impl Snapshot {
    /// Handle of this snapshot.
    #[must_use]
    pub fn handle(&self) -> SnapshotHandle {
        self.handle
    }

    /// Process the snapshot was captured in.
    #[must_use]
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Instruction pointer at capture.
    #[must_use]
    pub fn pc(&self) -> u64 {
        self.pc
    }

    /// Number of instructions the engine had seen at capture.
    #[must_use]
    pub fn instruction_index(&self) -> u64 {
        self.state.instruction_count()
    }

    /// Concrete register file at capture.
    #[must_use]
    pub fn registers(&self) -> &[(Register, u64)] {
        &self.registers
    }

    /// Symbolic state at capture.
    #[must_use]
    pub fn state(&self) -> &SymbolicState {
        &self.state
    }
}

#[derive(Debug)]
struct Entry {
    snapshot: Snapshot,
    journal: FxHashMap<u64, u8>,
}

/// Captures, journals and restores snapshots of one debuggee.
pub struct SnapshotManager {
    debuggee: Arc<dyn Debuggee>,
    arch: Architecture,
    entries: FxHashMap<SnapshotHandle, Entry>,
    next: u32,
}

impl SnapshotManager {
    /// Creates a manager for `debuggee`.
    #[must_use]
    pub fn new(debuggee: Arc<dyn Debuggee>, arch: Architecture) -> Self {
        Self {
            debuggee,
            arch,
            entries: FxHashMap::default(),
            next: 0,
        }
    }

    fn ensure_suspended(&self, action: &str) -> Result<u32> {
        match self.debuggee.state() {
            ProcessState::Suspended => {}
            state => {
                return Err(Error::InvalidState(format!(
                    "cannot {action} while the debuggee is {state}"
                )))
            }
        }
        self.debuggee
            .process_id()
            .ok_or_else(|| Error::InvalidState(format!("cannot {action} without a process")))
    }

    /// Captures the debuggee registers together with `state`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the debuggee is not suspended, or the error
    /// of a failing register read.
    pub fn capture(&mut self, state: &SymbolicState) -> Result<SnapshotHandle> {
        let process_id = self.ensure_suspended("capture a snapshot")?;
        let registers = self
            .arch
            .general_registers()
            .iter()
            .map(|reg| Ok((*reg, self.debuggee.read_register(*reg)?)))
            .collect::<Result<Vec<_>>>()?;
        let ip = self.arch.instruction_pointer();
        let pc = registers
            .iter()
            .find(|(reg, _)| *reg == ip)
            .map_or(0, |(_, value)| *value);

        let handle = SnapshotHandle(self.next);
        self.next += 1;
        self.entries.insert(
            handle,
            Entry {
                snapshot: Snapshot {
                    handle,
                    process_id,
                    pc,
                    registers,
                    state: state.clone(),
                },
                journal: FxHashMap::default(),
            },
        );
        log::info!("captured {handle} at {pc:#x} (pid {process_id})");
        Ok(handle)
    }

    /// Journals the current content of `[address, address + size)` before it is overwritten.
    ///
    /// Only the first pre-image of each byte is kept per snapshot. Snapshots of
    /// another process are left alone.
    ///
    /// # Errors
    ///
    /// Returns the error of the concrete memory read.
    pub fn record_write(&mut self, address: u64, size: usize) -> Result<()> {
        self.journal(address, size, None)
    }

    fn journal(&mut self, address: u64, size: usize, except: Option<SnapshotHandle>) -> Result<()> {
        let pid = self.debuggee.process_id();
        let needs_journal = |handle: &SnapshotHandle, entry: &Entry| {
            Some(*handle) != except
                && Some(entry.snapshot.process_id) == pid
                && (0..size as u64).any(|i| !entry.journal.contains_key(&address.wrapping_add(i)))
        };
        if !self.entries.iter().any(|(h, e)| needs_journal(h, e)) {
            return Ok(());
        }

        let current = self.debuggee.read_memory(address, size)?;
        for (handle, entry) in &mut self.entries {
            if Some(*handle) == except || Some(entry.snapshot.process_id) != pid {
                continue;
            }
            for (i, byte) in current.iter().enumerate() {
                entry
                    .journal
                    .entry(address.wrapping_add(i as u64))
                    .or_insert(*byte);
            }
        }
        Ok(())
    }

    /// Restores memory and registers to `handle` and returns its symbolic state.
    ///
    /// The snapshot stays valid and can be restored again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSnapshot`] for a released or foreign handle,
    /// [`Error::StaleSnapshot`] if the snapshot's process is gone, and
    /// [`Error::InvalidState`] if the debuggee is not suspended.
    pub fn restore(&mut self, handle: SnapshotHandle) -> Result<SymbolicState> {
        let entry = self
            .entries
            .get(&handle)
            .ok_or(Error::UnknownSnapshot(handle))?;
        if self.debuggee.process_id() != Some(entry.snapshot.process_id) {
            return Err(Error::StaleSnapshot(handle));
        }
        self.ensure_suspended("restore a snapshot")?;

        let runs = contiguous_runs(&entry.journal);
        for (address, bytes) in &runs {
            self.journal(*address, bytes.len(), Some(handle))?;
        }
        for (address, bytes) in &runs {
            self.debuggee.write_memory(*address, bytes)?;
        }

        let entry = self
            .entries
            .get_mut(&handle)
            .ok_or(Error::UnknownSnapshot(handle))?;
        for (register, value) in &entry.snapshot.registers {
            self.debuggee.write_register(*register, *value)?;
        }
        entry.journal.clear();
        log::info!(
            "restored {handle} ({} byte run(s) rewritten)",
            runs.len()
        );
        Ok(entry.snapshot.state.clone())
    }

    /// Forgets `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSnapshot`] if the handle is not live.
    pub fn release(&mut self, handle: SnapshotHandle) -> Result<()> {
        self.entries
            .remove(&handle)
            .map(|_| log::debug!("released {handle}"))
            .ok_or(Error::UnknownSnapshot(handle))
    }

    /// Forgets every snapshot.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Looks up a live snapshot.
    #[must_use]
    pub fn get(&self, handle: SnapshotHandle) -> Option<&Snapshot> {
        self.entries.get(&handle).map(|e| &e.snapshot)
    }

    /// Number of live snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no snapshot is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live handles in capture order.
    #[must_use]
    pub fn handles(&self) -> Vec<SnapshotHandle> {
        let mut handles: Vec<SnapshotHandle> = self.entries.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Number of journaled bytes for `handle`.
    #[must_use]
    pub fn journaled_bytes(&self, handle: SnapshotHandle) -> usize {
        self.entries.get(&handle).map_or(0, |e| e.journal.len())
    }
}

impl fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("arch", &self.arch)
            .field("handles", &self.handles())
            .finish_non_exhaustive()
    }
}

fn contiguous_runs(journal: &FxHashMap<u64, u8>) -> Vec<(u64, Vec<u8>)> {
    let mut bytes: Vec<(u64, u8)> = journal.iter().map(|(a, b)| (*a, *b)).collect();
    bytes.sort_unstable_by_key(|(address, _)| *address);

    let mut runs: Vec<(u64, Vec<u8>)> = Vec::new();
    for (address, byte) in bytes {
        match runs.last_mut() {
            Some((start, run)) if start.wrapping_add(run.len() as u64) == address => run.push(byte),
            _ => runs.push((address, vec![byte])),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{host::SimulatedDebuggee, instruction::Condition};

    fn manager() -> (Arc<SimulatedDebuggee>, SnapshotManager) {
        let debuggee = Arc::new(SimulatedDebuggee::new(Architecture::X86_64));
        debuggee.map(0x4000, 0x1000).unwrap();
        debuggee.set_register(Register::Rip, 0x1000).unwrap();
        let manager = SnapshotManager::new(debuggee.clone(), Architecture::X86_64);
        (debuggee, manager)
    }

    #[test]
    fn test_capture_restore_roundtrip() {
        let (debuggee, mut manager) = manager();
        debuggee.load(0x4000, &[1, 2, 3, 4]).unwrap();
        debuggee.set_register(Register::Rax, 7).unwrap();
        let handle = manager.capture(&SymbolicState::new()).unwrap();
        assert_eq!(manager.get(handle).unwrap().pc(), 0x1000);

        manager.record_write(0x4001, 2).unwrap();
        debuggee.write_memory(0x4001, &[0xaa, 0xbb]).unwrap();
        manager.record_write(0x4001, 2).unwrap();
        debuggee.write_memory(0x4001, &[0xcc, 0xdd]).unwrap();
        debuggee.set_register(Register::Rax, 9).unwrap();
        debuggee.set_register(Register::Rip, 0x1010).unwrap();
        assert_eq!(manager.journaled_bytes(handle), 2);

        manager.restore(handle).unwrap();
        assert_eq!(debuggee.read_memory(0x4000, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(debuggee.register(Register::Rax).unwrap(), 7);
        assert_eq!(debuggee.register(Register::Rip).unwrap(), 0x1000);

        // Reusable.
        manager.record_write(0x4000, 1).unwrap();
        debuggee.write_memory(0x4000, &[0xff]).unwrap();
        manager.restore(handle).unwrap();
        assert_eq!(debuggee.read_memory(0x4000, 1).unwrap(), vec![1]);
    }

    #[test]
    fn test_restore_brings_back_flags() {
        let (debuggee, mut manager) = manager();
        // ZF | PF
        debuggee.set_register(Register::Rflags, 0x246).unwrap();
        let handle = manager.capture(&SymbolicState::new()).unwrap();

        // CF | SF | OF
        debuggee.set_register(Register::Rflags, 0xa83).unwrap();
        manager.restore(handle).unwrap();
        assert_eq!(debuggee.register(Register::Rflags).unwrap(), 0x246);
        assert!(Condition::E.holds(0x246));
    }

    #[test]
    fn test_restore_brings_back_flags_x86() {
        let debuggee = Arc::new(SimulatedDebuggee::new(Architecture::X86));
        debuggee.set_register(Register::Eflags, 0x202).unwrap();
        let mut manager = SnapshotManager::new(debuggee.clone(), Architecture::X86);
        let handle = manager.capture(&SymbolicState::new()).unwrap();

        debuggee.set_register(Register::Eflags, 0x2c3).unwrap();
        manager.restore(handle).unwrap();
        assert_eq!(debuggee.register(Register::Eflags).unwrap(), 0x202);
    }

    #[test]
    fn test_restore_does_not_contaminate_other_snapshots() {
        let (debuggee, mut manager) = manager();
        debuggee.load(0x4000, &[1]).unwrap();
        let first = manager.capture(&SymbolicState::new()).unwrap();

        manager.record_write(0x4000, 1).unwrap();
        debuggee.write_memory(0x4000, &[2]).unwrap();
        let second = manager.capture(&SymbolicState::new()).unwrap();

        manager.restore(first).unwrap();
        assert_eq!(debuggee.read_memory(0x4000, 1).unwrap(), vec![1]);
        manager.restore(second).unwrap();
        assert_eq!(debuggee.read_memory(0x4000, 1).unwrap(), vec![2]);
        manager.restore(first).unwrap();
        assert_eq!(debuggee.read_memory(0x4000, 1).unwrap(), vec![1]);
    }

    #[test]
    fn test_stale_and_unknown() {
        let (debuggee, mut manager) = manager();
        let handle = manager.capture(&SymbolicState::new()).unwrap();
        debuggee.restart(2000);
        assert!(matches!(
            manager.restore(handle),
            Err(Error::StaleSnapshot(h)) if h == handle
        ));

        manager.release(handle).unwrap();
        assert!(manager.is_empty());
        assert!(matches!(
            manager.release(handle),
            Err(Error::UnknownSnapshot(_))
        ));
        assert!(matches!(
            manager.restore(handle),
            Err(Error::UnknownSnapshot(_))
        ));
    }

    #[test]
    fn test_capture_requires_suspension() {
        let (debuggee, mut manager) = manager();
        debuggee.set_state(ProcessState::Running);
        assert!(matches!(
            manager.capture(&SymbolicState::new()),
            Err(Error::InvalidState(_))
        ));
        debuggee.exit();
        assert!(manager.capture(&SymbolicState::new()).is_err());
    }

    #[test]
    fn test_handles_in_capture_order() {
        let (_debuggee, mut manager) = manager();
        let a = manager.capture(&SymbolicState::new()).unwrap();
        let b = manager.capture(&SymbolicState::new()).unwrap();
        assert_eq!(manager.handles(), vec![a, b]);
        assert_eq!(manager.len(), 2);
        assert_eq!(a.to_string(), "snapshot#0");
    }

    #[test]
    fn test_contiguous_runs() {
        let mut journal = FxHashMap::default();
        for (address, byte) in [(0x10, 1), (0x11, 2), (0x13, 3)] {
            journal.insert(address, byte);
        }
        assert_eq!(
            contiguous_runs(&journal),
            vec![(0x10, vec![1, 2]), (0x13, vec![3])]
        );
    }
}
