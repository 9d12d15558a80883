//! In-memory host implementations.
//!
//! These stand in for a real debugger: a register file and paged memory that can be
//! scripted from tests or from a recorded trace, plus recording versions of the
//! notification source, operator and configuration store.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Mutex, RwLock,
};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    config::CoordinatorConfig,
    engine::Architecture,
    host::{
        memory::PagedMemory, ConfigurationStore, Debuggee, InstructionDecoder,
        NotificationPoint, NotificationSource, Operator, ProcessState, SnapshotDecision,
    },
    instruction::{Instruction, Location, Register},
    Error, Result,
};

/// A scriptable debuggee with a full register file and sparse memory.
///
/// Starts suspended with process id 1000. Sub-register writes through
/// [`set_register`](SimulatedDebuggee::set_register) are merged into the full
/// register the way the hardware does it.
#[derive(Debug)]
pub struct SimulatedDebuggee {
    arch: Architecture,
    state: RwLock<ProcessState>,
    pid: AtomicU32,
    registers: RwLock<FxHashMap<Register, u64>>,
    memory: PagedMemory,
}

impl SimulatedDebuggee {
    /// Creates a suspended debuggee for `arch` with all registers zero and no memory.
    #[must_use]
    pub fn new(arch: Architecture) -> Self {
        Self {
            arch,
            state: RwLock::new(ProcessState::Suspended),
            pid: AtomicU32::new(1000),
            registers: RwLock::new(FxHashMap::default()),
            memory: PagedMemory::new(),
        }
    }

    /// Maps zero-filled memory covering `[address, address + len)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockPoisoned`] if the page table lock is poisoned.
    pub fn map(&self, address: u64, len: usize) -> Result<()> {
        self.memory.map(address, len)
    }

    /// Maps memory for `data` and copies it in.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockPoisoned`] if the page table lock is poisoned.
    pub fn load(&self, address: u64, data: &[u8]) -> Result<()> {
        self.memory.map(address, data.len())?;
        self.memory.write(address, data)
    }

    /// Sets a register of any width.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the register does not exist on this
    /// architecture.
    pub fn set_register(&self, register: Register, value: u64) -> Result<()> {
        let full = self.full(register)?;
        let mut registers = self
            .registers
            .write()
            .map_err(|_| Error::LockPoisoned("register file"))?;
        let current = registers.get(&full).copied().unwrap_or(0);
        let merged = if full == register {
            value & crate::instruction::mask(full.bits())
        } else {
            register.insert(current, value, self.arch)
        };
        registers.insert(full, merged);
        Ok(())
    }

    /// Reads a register of any width.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the register does not exist on this
    /// architecture.
    pub fn register(&self, register: Register) -> Result<u64> {
        let full = self.full(register)?;
        let registers = self
            .registers
            .read()
            .map_err(|_| Error::LockPoisoned("register file"))?;
        Ok(register.extract(registers.get(&full).copied().unwrap_or(0)))
    }

    /// Sets the execution state.
    pub fn set_state(&self, state: ProcessState) {
        if let Ok(mut current) = self.state.write() {
            *current = state;
        }
    }

    /// Terminates the process.
    pub fn exit(&self) {
        self.set_state(ProcessState::Exited);
    }

    /// Starts a new process with `pid`, keeping memory and registers.
    pub fn restart(&self, pid: u32) {
        self.pid.store(pid, Ordering::Relaxed);
        self.set_state(ProcessState::Suspended);
    }

    /// Returns the underlying memory.
    #[must_use]
    pub fn memory(&self) -> &PagedMemory {
        &self.memory
    }

    fn full(&self, register: Register) -> Result<Register> {
        register.full(self.arch).ok_or_else(|| {
            Error::InvalidState(format!("{register} does not exist on {}", self.arch))
        })
    }
}

impl Debuggee for SimulatedDebuggee {
    fn architecture(&self) -> Architecture {
        self.arch
    }

    fn state(&self) -> ProcessState {
        self.state
            .read()
            .map_or(ProcessState::Exited, |state| *state)
    }

    fn process_id(&self) -> Option<u32> {
        match self.state() {
            ProcessState::Exited | ProcessState::NotStarted => None,
            ProcessState::Running | ProcessState::Suspended => {
                Some(self.pid.load(Ordering::Relaxed))
            }
        }
    }

    fn read_register(&self, register: Register) -> Result<u64> {
        self.register(register).map_err(|e| Error::InaccessibleState {
            location: Location::Register(register),
            reason: e.to_string(),
        })
    }

    fn write_register(&self, register: Register, value: u64) -> Result<()> {
        self.set_register(register, value)
    }

    fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        self.memory.read(address, size)
    }

    fn write_memory(&self, address: u64, data: &[u8]) -> Result<()> {
        self.memory.write(address, data)
    }
}

/// Notification source that records registrations and can be told to refuse one.
#[derive(Debug, Default)]
pub struct RecordingNotificationSource {
    hooked: RwLock<FxHashSet<NotificationPoint>>,
    refused: RwLock<FxHashSet<NotificationPoint>>,
    hook_calls: Mutex<Vec<NotificationPoint>>,
}

impl RecordingNotificationSource {
    /// Creates a source that accepts every registration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes future registrations of `point` fail.
    pub fn refuse(&self, point: NotificationPoint) {
        if let Ok(mut refused) = self.refused.write() {
            refused.insert(point);
        }
    }

    /// Accepts registrations of `point` again.
    pub fn accept(&self, point: NotificationPoint) {
        if let Ok(mut refused) = self.refused.write() {
            refused.remove(&point);
        }
    }

    /// Returns true if `point` is currently hooked.
    #[must_use]
    pub fn is_hooked(&self, point: NotificationPoint) -> bool {
        self.hooked
            .read()
            .is_ok_and(|hooked| hooked.contains(&point))
    }

    /// Number of successful or failed `hook` calls for `point`.
    #[must_use]
    pub fn hook_calls(&self, point: NotificationPoint) -> usize {
        self.hook_calls
            .lock()
            .map_or(0, |calls| calls.iter().filter(|p| **p == point).count())
    }
}

impl NotificationSource for RecordingNotificationSource {
    fn hook(&self, point: NotificationPoint) -> Result<()> {
        if let Ok(mut calls) = self.hook_calls.lock() {
            calls.push(point);
        }
        let refused = self
            .refused
            .read()
            .map_err(|_| Error::LockPoisoned("refused notification points"))?
            .contains(&point);
        if refused {
            return Err(Error::HookInstallation {
                point,
                reason: "registration refused by host".to_string(),
            });
        }
        self.hooked
            .write()
            .map_err(|_| Error::LockPoisoned("hooked notification points"))?
            .insert(point);
        Ok(())
    }

    fn unhook(&self, point: NotificationPoint) {
        if let Ok(mut hooked) = self.hooked.write() {
            hooked.remove(&point);
        }
    }
}

/// Decoder that returns pre-registered instructions by program counter.
#[derive(Debug, Default)]
pub struct ScriptedDecoder {
    instructions: RwLock<FxHashMap<u64, (Instruction, usize)>>,
}

impl ScriptedDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the instruction found at `pc` and its length.
    pub fn insert(&self, pc: u64, instruction: Instruction, len: usize) {
        if let Ok(mut instructions) = self.instructions.write() {
            instructions.insert(pc, (instruction, len));
        }
    }
}

impl InstructionDecoder for ScriptedDecoder {
    fn decode(&self, _arch: Architecture, pc: u64, bytes: &[u8]) -> Option<(Instruction, usize)> {
        let instructions = self.instructions.read().ok()?;
        let (instruction, len) = instructions.get(&pc)?;
        (*len <= bytes.len()).then(|| (instruction.clone(), *len))
    }
}

/// Operator with scripted answers that records every warning.
#[derive(Debug)]
pub struct ScriptedOperator {
    decision: RwLock<SnapshotDecision>,
    configuration: RwLock<Option<CoordinatorConfig>>,
    warnings: Mutex<Vec<String>>,
    prompts: AtomicU32,
}

impl ScriptedOperator {
    /// Creates an operator that answers the snapshot prompt with `decision`.
    #[must_use]
    pub fn new(decision: SnapshotDecision) -> Self {
        Self {
            decision: RwLock::new(decision),
            configuration: RwLock::new(None),
            warnings: Mutex::new(Vec::new()),
            prompts: AtomicU32::new(0),
        }
    }

    /// Sets the configuration returned from the configuration prompt.
    #[must_use]
    pub fn with_configuration(self, configuration: CoordinatorConfig) -> Self {
        if let Ok(mut current) = self.configuration.write() {
            *current = Some(configuration);
        }
        self
    }

    /// Changes the answer to the snapshot prompt.
    pub fn set_decision(&self, decision: SnapshotDecision) {
        if let Ok(mut current) = self.decision.write() {
            *current = decision;
        }
    }

    /// Warnings shown so far.
    #[must_use]
    pub fn warnings(&self) -> Vec<String> {
        self.warnings
            .lock()
            .map(|warnings| warnings.clone())
            .unwrap_or_default()
    }

    /// Number of configuration prompts shown so far.
    #[must_use]
    pub fn configuration_prompts(&self) -> u32 {
        self.prompts.load(Ordering::Relaxed)
    }
}

impl Operator for ScriptedOperator {
    fn confirm_initial_snapshot(&self) -> SnapshotDecision {
        self.decision
            .read()
            .map_or(SnapshotDecision::Cancel, |decision| *decision)
    }

    fn prompt_configuration(&self) -> Option<CoordinatorConfig> {
        self.prompts.fetch_add(1, Ordering::Relaxed);
        self.configuration.read().ok()?.clone()
    }

    fn warn(&self, message: &str) {
        if let Ok(mut warnings) = self.warnings.lock() {
            warnings.push(message.to_string());
        }
    }
}

/// Configuration store holding an optional configuration in memory.
#[derive(Debug, Default)]
pub struct MemoryConfigurationStore {
    configuration: RwLock<Option<CoordinatorConfig>>,
}

impl MemoryConfigurationStore {
    /// Creates a store holding `configuration`.
    #[must_use]
    pub fn new(configuration: Option<CoordinatorConfig>) -> Self {
        Self {
            configuration: RwLock::new(configuration),
        }
    }
}

impl ConfigurationStore for MemoryConfigurationStore {
    fn load(&self) -> Option<CoordinatorConfig> {
        self.configuration.read().ok()?.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subregister_writes_merge() {
        let debuggee = SimulatedDebuggee::new(Architecture::X86_64);
        debuggee.set_register(Register::Rax, 0xffff_ffff_ffff_ffff).unwrap();
        debuggee.set_register(Register::Al, 0x12).unwrap();
        assert_eq!(debuggee.register(Register::Rax).unwrap(), 0xffff_ffff_ffff_ff12);
        debuggee.set_register(Register::Eax, 1).unwrap();
        assert_eq!(debuggee.register(Register::Rax).unwrap(), 1);

        let x86 = SimulatedDebuggee::new(Architecture::X86);
        assert!(x86.set_register(Register::R8, 0).is_err());
        x86.set_register(Register::Eax, 0x1_0000_0001).unwrap();
        assert_eq!(x86.register(Register::Eax).unwrap(), 1);
    }

    #[test]
    fn test_process_lifecycle() {
        let debuggee = SimulatedDebuggee::new(Architecture::X86);
        assert_eq!(debuggee.process_id(), Some(1000));
        debuggee.exit();
        assert_eq!(debuggee.state(), ProcessState::Exited);
        assert_eq!(debuggee.process_id(), None);
        debuggee.restart(1001);
        assert_eq!(debuggee.process_id(), Some(1001));
    }

    #[test]
    fn test_notification_source_refusal() {
        let source = RecordingNotificationSource::new();
        source.refuse(NotificationPoint::Debugger);
        assert!(source.hook(NotificationPoint::Ui).is_ok());
        assert!(source.hook(NotificationPoint::Debugger).is_err());
        assert!(source.is_hooked(NotificationPoint::Ui));
        assert!(!source.is_hooked(NotificationPoint::Debugger));

        source.unhook(NotificationPoint::Ui);
        source.unhook(NotificationPoint::Ui);
        assert!(!source.is_hooked(NotificationPoint::Ui));
        assert_eq!(source.hook_calls(NotificationPoint::Debugger), 1);
    }

    #[test]
    fn test_scripted_decoder() {
        let decoder = ScriptedDecoder::new();
        decoder.insert(0x10, Instruction::Nop, 1);
        assert_eq!(
            decoder.decode(Architecture::X86, 0x10, &[0x90]),
            Some((Instruction::Nop, 1))
        );
        assert_eq!(decoder.decode(Architecture::X86, 0x11, &[0x90]), None);
    }
}
