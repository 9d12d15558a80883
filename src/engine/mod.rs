//! Symbolic and taint engine adapter.
//!
//! The [`EngineAdapter`] owns the [`SymbolicState`] of the traced process and
//! advances it one [`InstructionEvent`] at a time. It never holds concrete values:
//! anything it cannot answer symbolically is pulled through the injected
//! [`ConcreteStateSource`] at the moment it is needed.
//!
//! # Processing model
//!
//! Processing is all-or-nothing per instruction. The semantics stage every write
//! against an immutable view of the state; only when the whole instruction was
//! evaluated are the writes committed and a [`SymbolicDelta`] returned. If a
//! concrete value cannot be obtained the state is untouched apart from the failing
//! location being marked unresolved, and [`Error::InaccessibleState`] is returned.
//!
//! # Optimizations
//!
//! [`SymbolicOptimization`] selects which instructions are processed at all:
//!
//! - `ONLY_ON_SYMBOLIZED` skips instructions that touch no symbolic location
//! - `ONLY_ON_TAINTED` skips instructions that touch no tainted location
//! - `ALIGNED_MEMORY` keeps naturally aligned memory values as one cell
//!
//! An instruction is processed only if no enabled flag skips it. Skipping an
//! instruction that touches nothing symbolic loses nothing, since every location
//! it writes is already concrete.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use symtrace::prelude::*;
//!
//! let debuggee = Arc::new(SimulatedDebuggee::new(Architecture::X86_64));
//! let bridge = Arc::new(DebuggeeBridge::new(debuggee));
//! let mut engine = EngineAdapter::new(bridge);
//! engine.initialize(Architecture::X86_64, SymbolicOptimization::default())?;
//! engine.symbolize_register(Register::Eax, true)?;
//! # Ok::<(), symtrace::Error>(())
//! ```

mod expr;
mod semantics;
mod state;

pub use expr::{sign_extend, BinaryOp, CompareOp, Expr, ExprKind, UnaryOp, VarId};
pub use semantics::condition_predicate;
pub use state::{
    FlagsCell, FlagsProducer, PathConstraint, SymbolicCell, SymbolicState, SymbolicVariable,
};

use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    bridge::ConcreteStateSource,
    instruction::{Condition, InstructionEvent, Location, Register, X86_64_REGISTERS, X86_REGISTERS},
    Error, Result,
};

use semantics::{compose_register, little_endian, Transaction};

/// Target architecture of the debuggee.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum Architecture {
    /// 32-bit x86
    #[strum(serialize = "x86")]
    #[serde(rename = "x86")]
    X86,
    /// 64-bit x86
    #[strum(serialize = "x86_64", serialize = "x64")]
    #[serde(rename = "x86_64", alias = "x64")]
    X86_64,
    /// 64-bit ARM (declared, not supported)
    #[strum(serialize = "aarch64")]
    #[serde(rename = "aarch64")]
    AArch64,
    /// 32-bit ARM (declared, not supported)
    #[strum(serialize = "arm32")]
    #[serde(rename = "arm32")]
    Arm32,
}

impl Architecture {
    /// Returns true if the engine can trace this architecture.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        matches!(self, Architecture::X86 | Architecture::X86_64)
    }

    /// Pointer width in bytes.
    #[must_use]
    pub fn pointer_size(&self) -> u8 {
        match self {
            Architecture::X86 | Architecture::Arm32 => 4,
            Architecture::X86_64 | Architecture::AArch64 => 8,
        }
    }

    /// Mask applied to computed addresses.
    #[must_use]
    pub fn address_mask(&self) -> u64 {
        crate::instruction::mask(u32::from(self.pointer_size()) * 8)
    }

    /// The full-width stack pointer. Only meaningful for supported architectures.
    #[must_use]
    pub fn stack_pointer(&self) -> Register {
        match self.pointer_size() {
            4 => Register::Esp,
            _ => Register::Rsp,
        }
    }

    /// The full-width instruction pointer. Only meaningful for supported architectures.
    #[must_use]
    pub fn instruction_pointer(&self) -> Register {
        match self.pointer_size() {
            4 => Register::Eip,
            _ => Register::Rip,
        }
    }

    /// The full-width flags register. Only meaningful for supported architectures.
    #[must_use]
    pub fn flags_register(&self) -> Register {
        match self.pointer_size() {
            4 => Register::Eflags,
            _ => Register::Rflags,
        }
    }

    /// The register file captured by snapshots, including the instruction pointer
    /// and the flags register.
    #[must_use]
    pub fn general_registers(&self) -> &'static [Register] {
        match self {
            Architecture::X86 => &X86_REGISTERS,
            Architecture::X86_64 => &X86_64_REGISTERS,
            Architecture::AArch64 | Architecture::Arm32 => &[],
        }
    }
}

bitflags! {
    /// Engine optimizations.
    ///
    /// All three are enabled by default.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SymbolicOptimization: u32 {
        /// Keep naturally aligned memory values as a single cell.
        const ALIGNED_MEMORY = 0b001;
        /// Skip instructions that touch no symbolic location.
        const ONLY_ON_SYMBOLIZED = 0b010;
        /// Skip instructions that touch no tainted location.
        const ONLY_ON_TAINTED = 0b100;
    }
}

impl Default for SymbolicOptimization {
    fn default() -> Self {
        Self::all()
    }
}

/// Result of evaluating a conditional branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchEvaluation {
    /// Address of the branch
    pub pc: u64,
    /// Condition code
    pub condition: Condition,
    /// Predicate under which the branch is taken, if the flags are symbolic and
    /// the condition is expressible
    pub predicate: Option<Expr>,
    /// Whether the flags depend on tainted data
    pub tainted: bool,
    /// Taken target
    pub target: u64,
    /// Not-taken successor
    pub fallthrough: u64,
    /// Observed outcome, or the concrete evaluation of the predicate
    pub taken: Option<bool>,
}

/// One location changed by an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellChange {
    /// The written location
    pub location: Location,
    /// Whether the location held a symbolic value before
    pub was_symbolic: bool,
    /// Whether the location was tainted before
    pub was_tainted: bool,
    /// The new symbolic value, or `None` if the location is now concrete
    pub current: Option<SymbolicCell>,
}

/// Changes applied to the symbolic state by one instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolicDelta {
    /// Index of the instruction in the trace
    pub index: u64,
    /// Address of the instruction
    pub pc: u64,
    /// Locations whose symbolic content changed
    pub changes: Vec<CellChange>,
    /// Path constraint appended by a symbolic branch
    pub constraint: Option<PathConstraint>,
    /// Branch evaluation for conditional jumps
    pub branch: Option<BranchEvaluation>,
}

impl SymbolicDelta {
    /// Returns true if the instruction left every location as it was.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.constraint.is_none()
    }

    /// Returns true if any written location is tainted afterwards.
    #[must_use]
    pub fn taints(&self) -> bool {
        self.changes
            .iter()
            .any(|c| c.current.as_ref().is_some_and(|cell| cell.tainted))
    }
}

#[derive(Debug, Clone, Copy)]
struct EngineConfig {
    architecture: Architecture,
    optimizations: SymbolicOptimization,
}

/// Drives the symbolic state from traced instructions.
pub struct EngineAdapter {
    source: Arc<dyn ConcreteStateSource>,
    config: Option<EngineConfig>,
    state: SymbolicState,
}

impl EngineAdapter {
    /// Creates an uninitialized adapter pulling concrete values from `source`.
    #[must_use]
    pub fn new(source: Arc<dyn ConcreteStateSource>) -> Self {
        Self {
            source,
            config: None,
            state: SymbolicState::new(),
        }
    }

    /// Configures the engine for `architecture`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the engine is already initialized or the
    /// architecture is not supported.
    pub fn initialize(
        &mut self,
        architecture: Architecture,
        optimizations: SymbolicOptimization,
    ) -> Result<()> {
        if let Some(config) = self.config {
            return Err(Error::Configuration(format!(
                "engine already initialized for {}",
                config.architecture
            )));
        }
        if !architecture.is_supported() {
            return Err(Error::Configuration(format!(
                "architecture {architecture} is not supported"
            )));
        }
        log::debug!("engine initialized for {architecture} with {optimizations:?}");
        self.config = Some(EngineConfig {
            architecture,
            optimizations,
        });
        self.state = SymbolicState::new();
        Ok(())
    }

    /// Drops the configuration and all symbolic state.
    pub fn teardown(&mut self) {
        if self.config.take().is_some() {
            log::debug!(
                "engine torn down after {} instruction(s)",
                self.state.instruction_count()
            );
        }
        self.state = SymbolicState::new();
    }

    /// Returns true between [`initialize`](Self::initialize) and [`teardown`](Self::teardown).
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.config.is_some()
    }

    /// The configured architecture.
    #[must_use]
    pub fn architecture(&self) -> Option<Architecture> {
        self.config.map(|c| c.architecture)
    }

    /// The configured optimizations.
    #[must_use]
    pub fn optimizations(&self) -> Option<SymbolicOptimization> {
        self.config.map(|c| c.optimizations)
    }

    /// The current symbolic state.
    #[must_use]
    pub fn state(&self) -> &SymbolicState {
        &self.state
    }

    /// Replaces the symbolic state wholesale. Used by snapshot restore.
    pub fn replace_state(&mut self, state: SymbolicState) {
        self.state = state;
    }

    fn config(&self) -> Result<EngineConfig> {
        self.config
            .ok_or_else(|| Error::InvalidState("engine is not initialized".to_string()))
    }

    /// Returns true if the enabled optimizations skip `event`.
    #[must_use]
    pub fn skips(&self, event: &InstructionEvent) -> bool {
        let Some(config) = self.config else {
            return true;
        };
        let accesses = event.accesses();
        if config
            .optimizations
            .contains(SymbolicOptimization::ONLY_ON_SYMBOLIZED)
            && !accesses.iter().any(|a| self.state.is_symbolic(&a.location))
        {
            return true;
        }
        config
            .optimizations
            .contains(SymbolicOptimization::ONLY_ON_TAINTED)
            && !accesses.iter().any(|a| self.state.is_tainted(&a.location))
    }

    /// Advances the symbolic state over one instruction.
    ///
    /// Returns `Ok(None)` if the instruction was skipped by an optimization.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InaccessibleState`] if a concrete value could not be read;
    /// the failing location is marked unresolved and nothing else changes.
    /// Returns [`Error::InvalidState`] if the engine is not initialized.
    pub fn process_instruction(&mut self, event: &InstructionEvent) -> Result<Option<SymbolicDelta>> {
        let config = self.config()?;
        let index = self.state.count_instruction();
        if self.skips(event) {
            return Ok(None);
        }

        let aligned = config
            .optimizations
            .contains(SymbolicOptimization::ALIGNED_MEMORY);
        let staged = match Transaction::new(
            config.architecture,
            aligned,
            &self.state,
            self.source.as_ref(),
            event,
        )
        .execute()
        {
            Ok(staged) => staged,
            Err(error) => {
                if let Error::InaccessibleState { location, .. } = &error {
                    self.state.mark_unresolved(*location);
                }
                return Err(error);
            }
        };

        let mut changes = Vec::new();
        for (register, cell) in staged.registers {
            let location = Location::Register(register);
            let before = self.state.register(register);
            if before != cell.as_ref() {
                changes.push(CellChange {
                    location,
                    was_symbolic: before.is_some(),
                    was_tainted: before.is_some_and(|c| c.tainted),
                    current: cell.clone(),
                });
            }
            self.state.set_register(register, cell);
        }
        for (address, size, cell) in staged.memory {
            let location = Location::Memory { address, size };
            let was_symbolic = self.state.is_symbolic(&location);
            if was_symbolic || cell.is_some() {
                changes.push(CellChange {
                    location,
                    was_symbolic,
                    was_tainted: self.state.is_tainted(&location),
                    current: cell.clone(),
                });
            }
            self.state.set_memory(address, size, cell, aligned);
        }
        if let Some(flags) = staged.flags {
            let before = self.state.flags();
            if before != flags.as_ref() {
                changes.push(CellChange {
                    location: Location::Flags,
                    was_symbolic: before.is_some(),
                    was_tainted: before.is_some_and(|f| f.tainted),
                    current: flags
                        .as_ref()
                        .map(|f| SymbolicCell::new(f.value(), f.tainted)),
                });
            }
            self.state.set_flags(flags);
        }

        let constraint = staged.branch.as_ref().and_then(|branch| {
            let predicate = branch.predicate.as_ref().filter(|p| p.is_symbolic())?;
            Some(PathConstraint {
                index,
                pc: event.pc(),
                predicate: predicate.clone(),
                taken: branch.taken?,
                tainted: branch.tainted,
            })
        });
        if let Some(constraint) = &constraint {
            self.state.push_constraint(constraint.clone());
        }

        Ok(Some(SymbolicDelta {
            index,
            pc: event.pc(),
            changes,
            constraint,
            branch: staged.branch,
        }))
    }

    /// Introduces a fresh variable for the current value of `register`.
    ///
    /// Sub-registers are symbolized in place; the rest of the full register keeps
    /// its content.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the engine is not initialized, the
    /// register is the flags register or does not exist on the architecture, and
    /// [`Error::InaccessibleState`] if its concrete value cannot be read.
    pub fn symbolize_register(&mut self, register: Register, tainted: bool) -> Result<VarId> {
        let config = self.config()?;
        let arch = config.architecture;
        if register.is_flags() {
            return Err(Error::InvalidState(format!(
                "{register} is modeled by its producing instruction, not as a variable"
            )));
        }
        let full = register.full(arch).ok_or_else(|| {
            Error::InvalidState(format!("{register} does not exist on {arch}"))
        })?;
        let value = self.source.read_concrete_register(register)?;
        let id = VarId(self.state.variables().len() as u32);
        let cell = SymbolicCell::new(Expr::variable(id, register.bits()), tainted);
        let cell = compose_register(
            arch,
            &self.state,
            self.source.as_ref(),
            register,
            full,
            cell,
        )?;
        self.state.push_variable(
            Location::Register(register),
            register.bits(),
            value,
            tainted,
        );
        self.state.set_register(full, cell);
        log::debug!("symbolized {register} = {value:#x} as {id} (tainted: {tainted})");
        Ok(id)
    }

    /// Introduces a fresh variable for the `size`-byte value at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the engine is not initialized or `size` is
    /// not between 1 and 8, and [`Error::InaccessibleState`] if the memory cannot be
    /// read.
    pub fn symbolize_memory(&mut self, address: u64, size: u8, tainted: bool) -> Result<VarId> {
        let config = self.config()?;
        if !(1..=8).contains(&size) {
            return Err(Error::InvalidState(format!(
                "cannot symbolize {size} bytes as one variable"
            )));
        }
        let bytes = self
            .source
            .read_concrete_memory(address, usize::from(size))?;
        let value = little_endian(&bytes);
        let bits = u32::from(size) * 8;
        let id = self.state.push_variable(
            Location::Memory { address, size },
            bits,
            value,
            tainted,
        );
        self.state.set_memory(
            address,
            size,
            Some(SymbolicCell::new(Expr::variable(id, bits), tainted)),
            config
                .optimizations
                .contains(SymbolicOptimization::ALIGNED_MEMORY),
        );
        log::debug!("symbolized [{address:#x}:{size}] = {value:#x} as {id} (tainted: {tainted})");
        Ok(id)
    }

    /// Symbolizes every byte of `[address, address + len)` as its own variable.
    ///
    /// The range is read in full before any variable is created.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the engine is not initialized and
    /// [`Error::InaccessibleState`] if any byte of the range cannot be read.
    pub fn symbolize_memory_range(
        &mut self,
        address: u64,
        len: usize,
        tainted: bool,
    ) -> Result<Vec<VarId>> {
        self.config()?;
        let bytes = self.source.read_concrete_memory(address, len)?;
        let mut ids = Vec::with_capacity(len);
        for (offset, byte) in bytes.iter().enumerate() {
            let at = address.wrapping_add(offset as u64);
            let location = Location::Memory {
                address: at,
                size: 1,
            };
            let id = self
                .state
                .push_variable(location, 8, u64::from(*byte), tainted);
            self.state.set_memory(
                at,
                1,
                Some(SymbolicCell::new(Expr::variable(id, 8), tainted)),
                false,
            );
            ids.push(id);
        }
        log::debug!("symbolized {len} byte(s) at {address:#x} (tainted: {tainted})");
        Ok(ids)
    }

    /// Makes `location` concrete again. Returns true if anything was symbolic.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the engine is not initialized or a
    /// register location does not exist on the architecture.
    pub fn concretize(&mut self, location: Location) -> Result<bool> {
        let config = self.config()?;
        let was_symbolic = match location {
            Location::Register(register) => {
                let full = register.full(config.architecture).ok_or_else(|| {
                    Error::InvalidState(format!(
                        "{register} does not exist on {}",
                        config.architecture
                    ))
                })?;
                let was = self.state.is_symbolic(&Location::Register(full));
                self.state.set_register(full, None);
                was
            }
            Location::Memory { address, size } => {
                let was = self.state.is_symbolic(&location);
                self.state.set_memory(address, size, None, false);
                was
            }
            Location::Flags => {
                let was = self.state.is_symbolic(&location);
                self.state.set_flags(None);
                was
            }
        };
        Ok(was_symbolic)
    }

    /// Concretizes every location. Variables and constraints are kept.
    pub fn concretize_all(&mut self) {
        for location in self.state.symbolic_locations() {
            match location {
                Location::Register(register) => self.state.set_register(register, None),
                Location::Memory { address, size } => {
                    self.state.set_memory(address, size, None, false);
                }
                Location::Flags => self.state.set_flags(None),
            }
        }
    }
}

impl std::fmt::Debug for EngineAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineAdapter")
            .field("config", &self.config)
            .field("instructions", &self.state.instruction_count())
            .field("symbolic_cells", &self.state.symbolic_cell_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bridge::DebuggeeBridge,
        host::SimulatedDebuggee,
        instruction::{Instruction, Memory, Operand},
    };

    fn setup(
        optimizations: SymbolicOptimization,
    ) -> (Arc<SimulatedDebuggee>, EngineAdapter) {
        let debuggee = Arc::new(SimulatedDebuggee::new(Architecture::X86_64));
        debuggee.map(0x1000, 0x1000).unwrap();
        debuggee.map(0x7000, 0x1000).unwrap();
        debuggee.set_register(Register::Rsp, 0x7800).unwrap();
        let bridge = Arc::new(DebuggeeBridge::new(debuggee.clone()));
        let mut engine = EngineAdapter::new(bridge);
        engine
            .initialize(Architecture::X86_64, optimizations)
            .unwrap();
        (debuggee, engine)
    }

    fn event(
        debuggee: &Arc<SimulatedDebuggee>,
        pc: u64,
        instruction: Instruction,
    ) -> InstructionEvent {
        let bridge = DebuggeeBridge::new(debuggee.clone());
        InstructionEvent::resolve(pc, vec![0x90; 3], instruction, Architecture::X86_64, &bridge)
            .unwrap()
    }

    fn reg(r: Register) -> Operand {
        Operand::Register(r)
    }

    #[test]
    fn test_initialize_rules() {
        let (_, mut engine) = setup(SymbolicOptimization::default());
        assert!(matches!(
            engine.initialize(Architecture::X86_64, SymbolicOptimization::empty()),
            Err(Error::Configuration(_))
        ));
        engine.teardown();
        assert!(!engine.is_initialized());
        assert!(matches!(
            engine.initialize(Architecture::AArch64, SymbolicOptimization::empty()),
            Err(Error::Configuration(_))
        ));
        engine
            .initialize(Architecture::X86, SymbolicOptimization::empty())
            .unwrap();
        assert_eq!(engine.architecture(), Some(Architecture::X86));
    }

    #[test]
    fn test_tainted_add_compare_branch() {
        let (debuggee, mut engine) = setup(SymbolicOptimization::default());
        debuggee.set_register(Register::Eax, 5).unwrap();
        let x = engine.symbolize_register(Register::Eax, true).unwrap();

        let add = event(
            &debuggee,
            0x1000,
            Instruction::Add {
                dst: reg(Register::Eax),
                src: Operand::Immediate(3),
            },
        );
        let delta = engine.process_instruction(&add).unwrap().unwrap();
        assert!(delta.taints());
        debuggee.set_register(Register::Eax, 8).unwrap();

        let cmp = event(
            &debuggee,
            0x1003,
            Instruction::Cmp {
                left: reg(Register::Eax),
                right: Operand::Immediate(10),
            },
        );
        engine.process_instruction(&cmp).unwrap().unwrap();
        assert!(engine.state().is_tainted(&Location::Flags));

        let jl = event(
            &debuggee,
            0x1006,
            Instruction::Jcc {
                condition: Condition::L,
                target: 0x1020,
            },
        );
        let delta = engine.process_instruction(&jl).unwrap().unwrap();
        let branch = delta.branch.unwrap();
        assert!(branch.tainted);
        assert_eq!(branch.taken, Some(true));
        let constraint = delta.constraint.unwrap();
        assert_eq!(constraint.predicate.variables(), vec![x]);
        assert_eq!(engine.state().constraints().len(), 1);
    }

    #[test]
    fn test_observed_next_pc_wins() {
        let (debuggee, mut engine) = setup(SymbolicOptimization::empty());
        debuggee.set_register(Register::Ecx, 50).unwrap();
        engine.symbolize_register(Register::Ecx, true).unwrap();
        let cmp = event(
            &debuggee,
            0x1000,
            Instruction::Cmp {
                left: reg(Register::Ecx),
                right: Operand::Immediate(10),
            },
        );
        engine.process_instruction(&cmp).unwrap();
        let jl = event(
            &debuggee,
            0x1003,
            Instruction::Jcc {
                condition: Condition::L,
                target: 0x1020,
            },
        )
        .with_next_pc(Some(0x1006));
        let delta = engine.process_instruction(&jl).unwrap().unwrap();
        assert_eq!(delta.branch.unwrap().taken, Some(false));
        assert!(!delta.constraint.unwrap().taken);
    }

    #[test]
    fn test_inexpressible_condition_reads_concrete_flags() {
        let (debuggee, mut engine) = setup(SymbolicOptimization::default());
        debuggee.set_register(Register::Ecx, 5).unwrap();
        engine.symbolize_register(Register::Ecx, true).unwrap();
        let dec = event(&debuggee, 0x1000, Instruction::Dec { dst: reg(Register::Ecx) });
        engine.process_instruction(&dec).unwrap().unwrap();
        debuggee.set_register(Register::Ecx, 4).unwrap();
        debuggee.set_register(Register::Rflags, 0x202).unwrap();

        let jg = Instruction::Jcc {
            condition: Condition::G,
            target: 0x1020,
        };
        let delta = engine
            .process_instruction(&event(&debuggee, 0x1002, jg.clone()))
            .unwrap()
            .unwrap();
        let branch = delta.branch.unwrap();
        assert!(branch.tainted);
        assert!(branch.predicate.is_none());
        assert_eq!(branch.taken, Some(true));
        assert!(delta.constraint.is_none());

        // Counter reached zero.
        debuggee.set_register(Register::Rflags, 0x246).unwrap();
        let delta = engine
            .process_instruction(&event(&debuggee, 0x1002, jg))
            .unwrap()
            .unwrap();
        assert_eq!(delta.branch.unwrap().taken, Some(false));
    }

    #[test]
    fn test_overflow_condition_reads_concrete_flags() {
        let (debuggee, mut engine) = setup(SymbolicOptimization::default());
        debuggee.set_register(Register::Eax, 0x7fff_ffff).unwrap();
        engine.symbolize_register(Register::Eax, true).unwrap();
        let add = event(
            &debuggee,
            0x1000,
            Instruction::Add {
                dst: reg(Register::Eax),
                src: Operand::Immediate(1),
            },
        );
        engine.process_instruction(&add).unwrap().unwrap();
        debuggee.set_register(Register::Eax, 0x8000_0000).unwrap();
        debuggee.set_register(Register::Rflags, 0xa86).unwrap();

        let jo = event(
            &debuggee,
            0x1003,
            Instruction::Jcc {
                condition: Condition::O,
                target: 0x1020,
            },
        );
        let branch = engine.process_instruction(&jo).unwrap().unwrap().branch.unwrap();
        assert!(branch.tainted);
        assert_eq!(branch.taken, Some(true));
    }

    #[test]
    fn test_flags_register_is_not_symbolizable() {
        let (_, mut engine) = setup(SymbolicOptimization::default());
        assert!(matches!(
            engine.symbolize_register(Register::Rflags, true),
            Err(Error::InvalidState(_))
        ));
        assert!(engine.state().symbolic_locations().is_empty());
    }

    #[test]
    fn test_only_on_tainted_skips_untainted_symbolic() {
        let (debuggee, mut engine) = setup(SymbolicOptimization::ONLY_ON_TAINTED);
        engine.symbolize_register(Register::Rbx, false).unwrap();
        let before = engine.state().clone();
        let add = event(
            &debuggee,
            0x1000,
            Instruction::Add {
                dst: reg(Register::Rbx),
                src: Operand::Immediate(1),
            },
        );
        assert!(engine.process_instruction(&add).unwrap().is_none());
        assert_eq!(
            engine.state().register(Register::Rbx),
            before.register(Register::Rbx)
        );
    }

    #[test]
    fn test_concrete_write_concretizes() {
        let (debuggee, mut engine) = setup(SymbolicOptimization::default());
        engine.symbolize_register(Register::Rdx, true).unwrap();
        let mov = event(
            &debuggee,
            0x1000,
            Instruction::Mov {
                dst: reg(Register::Rdx),
                src: Operand::Immediate(7),
            },
        );
        let delta = engine.process_instruction(&mov).unwrap().unwrap();
        assert_eq!(delta.changes.len(), 1);
        assert!(delta.changes[0].was_tainted);
        assert!(delta.changes[0].current.is_none());
        assert!(!engine.state().is_symbolic(&Location::Register(Register::Rdx)));
    }

    #[test]
    fn test_xor_self_clears_taint() {
        let (debuggee, mut engine) = setup(SymbolicOptimization::default());
        engine.symbolize_register(Register::Rax, true).unwrap();
        let xor = event(
            &debuggee,
            0x1000,
            Instruction::Xor {
                dst: reg(Register::Eax),
                src: reg(Register::Eax),
            },
        );
        engine.process_instruction(&xor).unwrap().unwrap();
        assert!(!engine.state().is_tainted(&Location::Register(Register::Rax)));
        assert!(!engine.state().is_symbolic(&Location::Flags));
    }

    #[test]
    fn test_subregister_write_keeps_upper_bits() {
        let (debuggee, mut engine) = setup(SymbolicOptimization::empty());
        debuggee.set_register(Register::Rcx, 0x1122_3344_5566_7788).unwrap();
        let id = engine.symbolize_register(Register::Cl, true).unwrap();
        let cell = engine.state().register(Register::Rcx).unwrap().clone();
        assert_eq!(cell.expr.bits(), 64);
        let model = |v: VarId| (v == id).then_some(0xaa);
        assert_eq!(cell.expr.evaluate(model), Some(0x1122_3344_5566_77aa));
    }

    #[test]
    fn test_widening_moves_keep_taint() {
        let (debuggee, mut engine) = setup(SymbolicOptimization::default());
        debuggee.load(0x1800, &[0x80]).unwrap();
        let ids = engine.symbolize_memory_range(0x1800, 1, true).unwrap();
        let model = |v: VarId| (v == ids[0]).then_some(0x80);

        let movsx = event(
            &debuggee,
            0x1000,
            Instruction::MovSx {
                dst: reg(Register::Ecx),
                src: Operand::Memory(Memory::absolute(0x1800, 1)),
            },
        );
        engine.process_instruction(&movsx).unwrap().unwrap();
        let rcx = engine.state().register(Register::Rcx).unwrap();
        assert!(rcx.tainted);
        assert_eq!(rcx.expr.evaluate(model), Some(0xffff_ff80));

        let movzx = event(
            &debuggee,
            0x1004,
            Instruction::MovZx {
                dst: reg(Register::Dx),
                src: Operand::Memory(Memory::absolute(0x1800, 1)),
            },
        );
        engine.process_instruction(&movzx).unwrap().unwrap();
        let rdx = engine.state().register(Register::Rdx).unwrap();
        assert!(rdx.tainted);
        assert_eq!(Register::Dx.extract(rdx.expr.evaluate(model).unwrap()), 0x80);
    }

    #[test]
    fn test_push_pop_moves_taint_through_stack() {
        let (debuggee, mut engine) = setup(SymbolicOptimization::default());
        engine.symbolize_register(Register::Rsi, true).unwrap();
        let push = event(&debuggee, 0x1000, Instruction::Push { src: reg(Register::Rsi) });
        engine.process_instruction(&push).unwrap().unwrap();
        assert!(engine.state().is_tainted(&Location::Memory {
            address: 0x77f8,
            size: 8
        }));

        debuggee.set_register(Register::Rsp, 0x77f8).unwrap();
        let pop = event(&debuggee, 0x1001, Instruction::Pop { dst: reg(Register::Rdi) });
        engine.process_instruction(&pop).unwrap().unwrap();
        assert_eq!(
            engine.state().register(Register::Rdi).map(|c| c.expr.clone()),
            engine.state().register(Register::Rsi).map(|c| c.expr.clone())
        );
    }

    #[test]
    fn test_memory_symbolization_and_load() {
        let (debuggee, mut engine) = setup(SymbolicOptimization::default());
        debuggee.load(0x1800, &[1, 2, 3, 4]).unwrap();
        let ids = engine.symbolize_memory_range(0x1800, 4, true).unwrap();
        assert_eq!(ids.len(), 4);
        assert_eq!(engine.state().model_value(ids[2]), Some(3));

        debuggee.set_register(Register::Rbx, 0x1800).unwrap();
        let load = event(
            &debuggee,
            0x1000,
            Instruction::Mov {
                dst: reg(Register::Eax),
                src: Operand::Memory(Memory::base_disp(Register::Rbx, 0, 4)),
            },
        );
        engine.process_instruction(&load).unwrap().unwrap();
        let rax = engine.state().register(Register::Rax).unwrap();
        assert!(rax.tainted);
        assert_eq!(
            rax.expr.evaluate(|id| engine.state().model_value(id)),
            Some(0x0403_0201)
        );
    }

    #[test]
    fn test_inaccessible_read_is_isolated() {
        let (debuggee, mut engine) = setup(SymbolicOptimization::empty());
        engine.symbolize_register(Register::Rax, true).unwrap();
        let before = engine.state().clone();
        debuggee.set_register(Register::Rbx, 0xdead_0000).unwrap();
        let load = event(
            &debuggee,
            0x1000,
            Instruction::Add {
                dst: reg(Register::Rax),
                src: Operand::Memory(Memory::base_disp(Register::Rbx, 0, 8)),
            },
        );

        let err = engine.process_instruction(&load).unwrap_err();
        assert!(err.is_instruction_local());
        assert_eq!(
            engine.state().register(Register::Rax),
            before.register(Register::Rax)
        );
        assert!(engine.state().is_unresolved(&Location::Memory {
            address: 0xdead_0000,
            size: 8
        }));
    }

    #[test]
    fn test_aligned_store_reads_back_whole() {
        let (debuggee, mut engine) = setup(SymbolicOptimization::ALIGNED_MEMORY);
        engine.symbolize_register(Register::Rax, true).unwrap();
        debuggee.set_register(Register::Rbx, 0x1400).unwrap();
        let store = event(
            &debuggee,
            0x1000,
            Instruction::Mov {
                dst: Operand::Memory(Memory::base_disp(Register::Rbx, 0, 8)),
                src: reg(Register::Rax),
            },
        );
        engine.process_instruction(&store).unwrap().unwrap();
        let rax = engine.state().register(Register::Rax).unwrap().expr.clone();
        assert_eq!(
            engine.state().aligned_cell(0x1400, 8).map(|c| c.expr.clone()),
            Some(rax)
        );
    }

    #[test]
    fn test_unsupported_concretizes_writes() {
        let (debuggee, mut engine) = setup(SymbolicOptimization::default());
        engine.symbolize_register(Register::Rdx, true).unwrap();
        let mul = event(
            &debuggee,
            0x1000,
            Instruction::Unsupported {
                mnemonic: "mul".to_string(),
                reads: vec![reg(Register::Ecx)],
                writes: vec![reg(Register::Eax), reg(Register::Edx)],
            },
        );
        engine.process_instruction(&mul).unwrap().unwrap();
        assert!(!engine.state().is_symbolic(&Location::Register(Register::Rdx)));
    }
}
