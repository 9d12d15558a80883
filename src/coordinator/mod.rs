//! Execution coordinator.
//!
//! [`ExecutionCoordinator`] owns the whole tracing session. It is the only writer
//! of the symbolic state and sequences every traced instruction through the same
//! pipeline:
//!
//! 1. the [`TraceHook`] turns the host notification into an [`InstructionEvent`],
//! 2. the [`SnapshotManager`] journals the pre-image of every memory write,
//! 3. the [`EngineAdapter`] advances the symbolic state (or skips the instruction),
//! 4. the [`TriggerDispatcher`] classifies the resulting delta.
//!
//! # State Machine
//!
//! ```text
//!            activate()             first instruction
//!   Idle ───────────────▶ Armed ───────────────────────▶ Tracing
//!    ▲                      │                               │
//!    └──────────────────────┴───────────────────────────────┘
//!       deactivate(), process exit, UI closing, instruction limit
//! ```
//!
//! Activation needs the operator's answer to the initial snapshot prompt, an
//! engine initialized for the debuggee's architecture and both notification
//! points hooked. If any step fails, everything done so far is undone and the
//! coordinator stays `Idle`.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use symtrace::prelude::*;
//!
//! # fn main() -> symtrace::Result<()> {
//! let debuggee = Arc::new(SimulatedDebuggee::new(Architecture::X86_64));
//! let mut coordinator = CoordinatorBuilder::new()
//!     .debuggee(debuggee)
//!     .notifications(Arc::new(RecordingNotificationSource::new()))
//!     .operator(Arc::new(ScriptedOperator::new(SnapshotDecision::Skip)))
//!     .build()?;
//!
//! if coordinator.activate() {
//!     coordinator.taint_register(Register::Rax)?;
//!     coordinator.handle_notification(DebuggerNotification::Step { pc: 0x1000, next_pc: None });
//!     for trigger in coordinator.drain_triggers() {
//!         println!("{:#x} depends on input", trigger.pc);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod context;

use std::sync::Arc;

use strum::{Display, IntoStaticStr};

use crate::{
    bridge::DebuggeeBridge,
    config::CoordinatorConfig,
    engine::{EngineAdapter, SymbolicState, VarId},
    hook::{HookEvent, TraceHook},
    host::{
        ConfigurationStore, Debuggee, DebuggerNotification, InstructionDecoder,
        NotificationSource, Operator, SnapshotDecision, X86Decoder,
    },
    instruction::{InstructionEvent, Location, Register},
    snapshot::{SnapshotHandle, SnapshotManager},
    stats::ExecutionStats,
    trace::{TraceEvent, TraceWriter},
    trigger::{TaintTrigger, TriggerDispatcher},
    Error, Result,
};

use context::{ExecutionContext, Phase, Retired};

/// Externally visible coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum CoordinatorState {
    /// No context exists.
    Idle,
    /// Hooks are installed and no instruction has been traced yet.
    Armed,
    /// Instructions are being traced.
    Tracing,
}

/// What [`ExecutionCoordinator::handle_notification`] did with a notification.
#[derive(Debug)]
pub enum NotificationOutcome {
    /// The coordinator is idle; the notification was ignored.
    Ignored,
    /// The engine processed the instruction.
    Processed {
        /// Number of symbolic cells the instruction changed
        changes: usize,
        /// Trigger emitted for a tainted branch
        trigger: Option<TaintTrigger>,
    },
    /// The optimization policy skipped the instruction.
    Skipped,
    /// The instruction failed and left the symbolic state untouched.
    Isolated(Error),
    /// A new process started under the debugger.
    ProcessStarted {
        /// Identifier of the new process
        pid: u32,
    },
    /// The session ended.
    Deactivated,
}

/// Builder for [`ExecutionCoordinator`].
///
/// The debuggee, the notification source and the operator are required. Without an
/// explicit decoder the built-in x86 decoder is used; without a configuration store
/// the operator is always asked for a configuration.
#[derive(Default)]
pub struct CoordinatorBuilder {
    debuggee: Option<Arc<dyn Debuggee>>,
    notifications: Option<Arc<dyn NotificationSource>>,
    decoder: Option<Arc<dyn InstructionDecoder>>,
    operator: Option<Arc<dyn Operator>>,
    store: Option<Arc<dyn ConfigurationStore>>,
}

impl CoordinatorBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the debugged process.
    #[must_use]
    pub fn debuggee(mut self, debuggee: Arc<dyn Debuggee>) -> Self {
        self.debuggee = Some(debuggee);
        self
    }

    /// Sets the host notification source.
    #[must_use]
    pub fn notifications(mut self, notifications: Arc<dyn NotificationSource>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    /// Sets the instruction decoder.
    #[must_use]
    pub fn decoder(mut self, decoder: Arc<dyn InstructionDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Sets the operator used for prompts and warnings.
    #[must_use]
    pub fn operator(mut self, operator: Arc<dyn Operator>) -> Self {
        self.operator = Some(operator);
        self
    }

    /// Sets the persisted configuration store.
    #[must_use]
    pub fn configuration_store(mut self, store: Arc<dyn ConfigurationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Builds an idle coordinator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a required collaborator is missing.
    pub fn build(self) -> Result<ExecutionCoordinator> {
        let missing = |what: &str| Error::Configuration(format!("no {what} was provided"));
        let debuggee = self.debuggee.ok_or_else(|| missing("debuggee"))?;
        Ok(ExecutionCoordinator {
            bridge: Arc::new(DebuggeeBridge::new(debuggee.clone())),
            debuggee,
            notifications: self
                .notifications
                .ok_or_else(|| missing("notification source"))?,
            decoder: self
                .decoder
                .unwrap_or_else(|| Arc::new(X86Decoder::new())),
            operator: self.operator.ok_or_else(|| missing("operator"))?,
            store: self.store,
            context: None,
            retired: Retired::default(),
        })
    }
}

/// Owns the tracing session and sequences every traced instruction.
pub struct ExecutionCoordinator {
    debuggee: Arc<dyn Debuggee>,
    bridge: Arc<DebuggeeBridge>,
    notifications: Arc<dyn NotificationSource>,
    decoder: Arc<dyn InstructionDecoder>,
    operator: Arc<dyn Operator>,
    store: Option<Arc<dyn ConfigurationStore>>,
    context: Option<ExecutionContext>,
    retired: Retired,
}

impl ExecutionCoordinator {
    /// Starts a session.
    ///
    /// Returns true if a session is active afterwards, including when one already
    /// was. Failures are reported to the operator and logged; the coordinator then
    /// stays idle.
    pub fn activate(&mut self) -> bool {
        if self.context.is_some() {
            return true;
        }
        match self.build_context() {
            Ok(context) => {
                self.retired = Retired::default();
                self.context = Some(context);
                true
            }
            Err(Error::ActivationDeclined) => {
                log::info!("activation declined by the operator");
                false
            }
            Err(error) => {
                log::error!("activation failed: {error}");
                self.operator.warn(&format!("Tracing was not started: {error}"));
                false
            }
        }
    }

    fn build_context(&self) -> Result<ExecutionContext> {
        let config = self.load_configuration();
        config.validate()?;
        let architecture = config.resolve_architecture(self.debuggee.architecture())?;

        let pending_snapshot = match self.operator.confirm_initial_snapshot() {
            SnapshotDecision::Take => true,
            SnapshotDecision::Skip => false,
            SnapshotDecision::Cancel => return Err(Error::ActivationDeclined),
        };

        let mut engine = EngineAdapter::new(self.bridge.clone());
        engine.initialize(architecture, config.optimizations)?;
        let trace = TraceWriter::from_config(&config.tracing)?;

        let mut hook = TraceHook::new(self.notifications.clone(), self.decoder.clone());
        hook.install()?;

        let context = ExecutionContext {
            architecture,
            phase: Phase::Armed,
            pending_snapshot,
            engine,
            snapshots: SnapshotManager::new(self.debuggee.clone(), architecture),
            hook,
            triggers: TriggerDispatcher::new(config.trigger_capacity),
            stats: ExecutionStats::new(),
            trace,
            config,
        };
        context.record(TraceEvent::Activated {
            architecture,
            optimizations: context.config.optimizations,
            snapshot: pending_snapshot,
        });
        log::info!(
            "activated for {architecture} with {:?}",
            context.config.optimizations
        );
        Ok(context)
    }

    fn load_configuration(&self) -> CoordinatorConfig {
        if let Some(config) = self.store.as_ref().and_then(|store| store.load()) {
            return config;
        }
        log::debug!("no stored configuration, asking the operator");
        self.operator.prompt_configuration().unwrap_or_default()
    }

    /// Ends the session. Does nothing when idle.
    pub fn deactivate(&mut self) {
        self.retire("deactivated");
    }

    fn retire(&mut self, reason: &str) {
        if let Some(context) = self.context.take() {
            self.retired = context.retire(reason);
        }
    }

    /// Returns true while a session exists.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.context.is_some()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        match self.context.as_ref().map(|c| c.phase) {
            None => CoordinatorState::Idle,
            Some(Phase::Armed) => CoordinatorState::Armed,
            Some(Phase::Tracing) => CoordinatorState::Tracing,
        }
    }

    /// Configuration of the active session.
    #[must_use]
    pub fn config(&self) -> Option<&CoordinatorConfig> {
        self.context.as_ref().map(|c| &c.config)
    }

    /// Handles one host notification.
    pub fn handle_notification(&mut self, notification: DebuggerNotification) -> NotificationOutcome {
        let Some(context) = self.context.as_mut() else {
            return NotificationOutcome::Ignored;
        };

        let event = match context
            .hook
            .translate(notification, context.architecture, self.bridge.as_ref())
        {
            Ok(event) => event,
            Err(error) => {
                context.stats.events += 1;
                return isolate(context, notification_pc(&notification), error);
            }
        };

        match event {
            HookEvent::Instruction(event) => {
                let outcome = process(context, &event);
                if context.limit_reached() {
                    let limit = context.config.max_instructions;
                    log::warn!("instruction limit of {limit} reached");
                    self.operator
                        .warn(&format!("Tracing stopped after {limit} instructions"));
                    self.retire("instruction limit reached");
                }
                outcome
            }
            HookEvent::ProcessStarted { pid } => {
                log::info!("process {pid} started");
                NotificationOutcome::ProcessStarted { pid }
            }
            HookEvent::ProcessExited { pid, code } => {
                log::info!("process {pid} exited with code {code}");
                self.retire("process exited");
                NotificationOutcome::Deactivated
            }
            HookEvent::UiClosing => {
                self.retire("ui closing");
                NotificationOutcome::Deactivated
            }
        }
    }

    fn context_mut(&mut self) -> Result<&mut ExecutionContext> {
        self.context.as_mut().ok_or(Error::NotActive)
    }

    /// Captures a snapshot of the current process and symbolic state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotActive`] when idle and [`Error::InvalidState`] if the
    /// debuggee is not suspended.
    pub fn capture_snapshot(&mut self) -> Result<SnapshotHandle> {
        let context = self.context_mut()?;
        capture(context)
    }

    /// Rewinds the process and the symbolic state to `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotActive`] when idle, [`Error::UnknownSnapshot`] for a
    /// released handle and [`Error::StaleSnapshot`] if the snapshot's process has
    /// exited. Nothing changes on error.
    pub fn restore_snapshot(&mut self, handle: SnapshotHandle) -> Result<()> {
        let context = self.context_mut()?;
        let state = context.snapshots.restore(handle)?;
        context.engine.replace_state(state);
        context.stats.snapshots_restored += 1;
        let pc = context.snapshots.get(handle).map_or(0, |s| s.pc());
        context.record(TraceEvent::SnapshotRestored {
            handle: handle.id(),
            pc,
        });
        Ok(())
    }

    /// Forgets `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotActive`] when idle and [`Error::UnknownSnapshot`] if the
    /// handle is not live.
    pub fn release_snapshot(&mut self, handle: SnapshotHandle) -> Result<()> {
        let context = self.context_mut()?;
        context.snapshots.release(handle)?;
        context.record(TraceEvent::SnapshotReleased {
            handle: handle.id(),
        });
        Ok(())
    }

    /// Live snapshot handles in capture order.
    #[must_use]
    pub fn snapshots(&self) -> Vec<SnapshotHandle> {
        self.context
            .as_ref()
            .map(|c| c.snapshots.handles())
            .unwrap_or_default()
    }

    /// Removes and returns every undrained trigger, including those left over
    /// from the last session.
    pub fn drain_triggers(&mut self) -> Vec<TaintTrigger> {
        let mut triggers = std::mem::take(&mut self.retired.triggers);
        if let Some(context) = self.context.as_mut() {
            triggers.extend(context.triggers.drain());
        }
        triggers
    }

    /// Makes the current value of `register` a symbolic input.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotActive`] when idle and [`Error::InaccessibleState`] if
    /// the register cannot be read.
    pub fn symbolize_register(&mut self, register: Register, tainted: bool) -> Result<VarId> {
        let context = self.context_mut()?;
        let id = context.engine.symbolize_register(register, tainted)?;
        context.stats.symbolized += 1;
        Ok(id)
    }

    /// Makes the current value of `register` a tainted symbolic input.
    ///
    /// # Errors
    ///
    /// See [`symbolize_register`](Self::symbolize_register).
    pub fn taint_register(&mut self, register: Register) -> Result<VarId> {
        self.symbolize_register(register, true)
    }

    /// Makes the `size`-byte value at `address` one symbolic input.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotActive`] when idle, [`Error::InvalidState`] for sizes
    /// outside 1..=8 and [`Error::InaccessibleState`] if the memory is unmapped.
    pub fn symbolize_memory(&mut self, address: u64, size: u8, tainted: bool) -> Result<VarId> {
        let context = self.context_mut()?;
        let id = context.engine.symbolize_memory(address, size, tainted)?;
        context.stats.symbolized += 1;
        Ok(id)
    }

    /// Makes every byte of `[address, address + len)` its own symbolic input.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotActive`] when idle and [`Error::InaccessibleState`] if
    /// any byte is unmapped. Nothing is symbolized on error.
    pub fn symbolize_memory_range(
        &mut self,
        address: u64,
        len: usize,
        tainted: bool,
    ) -> Result<Vec<VarId>> {
        let context = self.context_mut()?;
        let ids = context
            .engine
            .symbolize_memory_range(address, len, tainted)?;
        context.stats.symbolized += ids.len() as u64;
        Ok(ids)
    }

    /// Taints every byte of `[address, address + len)`.
    ///
    /// # Errors
    ///
    /// See [`symbolize_memory_range`](Self::symbolize_memory_range).
    pub fn taint_memory(&mut self, address: u64, len: usize) -> Result<Vec<VarId>> {
        self.symbolize_memory_range(address, len, true)
    }

    /// Makes `location` concrete again. Returns true if it was symbolic.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotActive`] when idle.
    pub fn concretize(&mut self, location: Location) -> Result<bool> {
        self.context_mut()?.engine.concretize(location)
    }

    /// The symbolic state of the active session.
    #[must_use]
    pub fn symbolic_state(&self) -> Option<&SymbolicState> {
        self.context.as_ref().map(|c| c.engine.state())
    }

    /// Counters of the active session, or of the last one when idle.
    #[must_use]
    pub fn stats(&self) -> ExecutionStats {
        self.context
            .as_ref()
            .map_or_else(|| self.retired.stats.clone(), |c| c.stats.clone())
    }

    /// Takes the in-memory trace of the active or last session.
    ///
    /// Returns `None` when tracing is disabled or written to a file.
    pub fn take_trace(&mut self) -> Option<Vec<TraceEvent>> {
        let writer = match &self.context {
            Some(context) => context.trace.as_ref(),
            None => self.retired.trace.as_ref(),
        };
        writer.and_then(TraceWriter::take_buffer)
    }
}

impl Drop for ExecutionCoordinator {
    fn drop(&mut self) {
        self.retire("coordinator dropped");
    }
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("state", &self.state())
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

fn notification_pc(notification: &DebuggerNotification) -> Option<u64> {
    match notification {
        DebuggerNotification::Step { pc, .. } | DebuggerNotification::Breakpoint { pc, .. } => {
            Some(*pc)
        }
        _ => None,
    }
}

fn capture(context: &mut ExecutionContext) -> Result<SnapshotHandle> {
    let handle = context.snapshots.capture(context.engine.state())?;
    context.stats.snapshots_captured += 1;
    if let Some(snapshot) = context.snapshots.get(handle) {
        context.record(TraceEvent::SnapshotCaptured {
            handle: handle.id(),
            pc: snapshot.pc(),
            index: snapshot.instruction_index(),
        });
    }
    Ok(handle)
}

fn isolate(context: &mut ExecutionContext, pc: Option<u64>, error: Error) -> NotificationOutcome {
    match pc {
        Some(pc) => log::warn!("{pc:#x}: instruction skipped: {error}"),
        None => log::warn!("instruction skipped: {error}"),
    }
    context.stats.isolated_errors += 1;
    context.record(TraceEvent::Error {
        pc,
        message: error.to_string(),
    });
    NotificationOutcome::Isolated(error)
}

fn process(context: &mut ExecutionContext, event: &InstructionEvent) -> NotificationOutcome {
    context.stats.events += 1;

    if context.phase == Phase::Armed {
        context.phase = Phase::Tracing;
        if std::mem::take(&mut context.pending_snapshot) {
            match capture(context) {
                Ok(handle) => log::info!("initial snapshot {handle} taken"),
                Err(error) => log::warn!("initial snapshot failed: {error}"),
            }
        }
    }

    let writes: Vec<(u64, u8)> = event.memory_writes().collect();
    for (address, size) in writes {
        if let Err(error) = context.snapshots.record_write(address, usize::from(size)) {
            return isolate(context, Some(event.pc()), error);
        }
    }

    match context.engine.process_instruction(event) {
        Ok(None) => {
            context.stats.skipped += 1;
            context.record(TraceEvent::Instruction {
                index: context.engine.state().instruction_count() - 1,
                pc: event.pc(),
                mnemonic: event.instruction().mnemonic(),
                skipped: true,
                changes: 0,
                tainted: false,
            });
            NotificationOutcome::Skipped
        }
        Ok(Some(delta)) => {
            context.stats.processed += 1;
            if delta.constraint.is_some() {
                context.stats.constraints += 1;
            }
            context.record(TraceEvent::Instruction {
                index: delta.index,
                pc: delta.pc,
                mnemonic: event.instruction().mnemonic(),
                skipped: false,
                changes: delta.changes.len(),
                tainted: delta.taints(),
            });
            let trigger = context.triggers.dispatch(&delta);
            if let Some(trigger) = &trigger {
                context.stats.triggers += 1;
                context.record(TraceEvent::trigger(trigger));
            }
            NotificationOutcome::Processed {
                changes: delta.changes.len(),
                trigger,
            }
        }
        Err(error) => isolate(context, Some(event.pc()), error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::TracingConfig,
        engine::Architecture,
        host::{
            MemoryConfigurationStore, NotificationPoint, ProcessState, RecordingNotificationSource,
            ScriptedDecoder, ScriptedOperator, SimulatedDebuggee,
        },
        instruction::{Condition, Instruction, Operand},
    };

    struct Fixture {
        debuggee: Arc<SimulatedDebuggee>,
        notifications: Arc<RecordingNotificationSource>,
        decoder: Arc<ScriptedDecoder>,
        operator: Arc<ScriptedOperator>,
        coordinator: ExecutionCoordinator,
    }

    fn fixture(decision: SnapshotDecision, config: Option<CoordinatorConfig>) -> Fixture {
        let debuggee = Arc::new(SimulatedDebuggee::new(Architecture::X86_64));
        debuggee.map(0x1000, 0x1000).unwrap();
        debuggee.map(0x7000, 0x1000).unwrap();
        debuggee.set_register(Register::Rsp, 0x7800).unwrap();
        let notifications = Arc::new(RecordingNotificationSource::new());
        let decoder = Arc::new(ScriptedDecoder::new());
        let operator = Arc::new(ScriptedOperator::new(decision));
        let coordinator = CoordinatorBuilder::new()
            .debuggee(debuggee.clone())
            .notifications(notifications.clone())
            .decoder(decoder.clone())
            .operator(operator.clone())
            .configuration_store(Arc::new(MemoryConfigurationStore::new(config)))
            .build()
            .unwrap();
        Fixture {
            debuggee,
            notifications,
            decoder,
            operator,
            coordinator,
        }
    }

    fn step(pc: u64) -> DebuggerNotification {
        DebuggerNotification::Step { pc, next_pc: None }
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let result = CoordinatorBuilder::new()
            .notifications(Arc::new(RecordingNotificationSource::new()))
            .build();
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_activation_lifecycle() {
        let mut f = fixture(SnapshotDecision::Skip, None);
        assert_eq!(f.coordinator.state(), CoordinatorState::Idle);
        assert!(f.coordinator.activate());
        assert!(f.coordinator.activate());
        assert_eq!(f.coordinator.state(), CoordinatorState::Armed);
        assert_eq!(f.notifications.hook_calls(NotificationPoint::Ui), 1);
        assert_eq!(f.operator.configuration_prompts(), 1);

        f.coordinator.deactivate();
        f.coordinator.deactivate();
        assert!(!f.coordinator.is_active());
        assert!(!f.notifications.is_hooked(NotificationPoint::Debugger));
        assert!(matches!(
            f.coordinator.capture_snapshot(),
            Err(Error::NotActive)
        ));
    }

    #[test]
    fn test_activation_declined_and_hook_failure() {
        let mut f = fixture(SnapshotDecision::Cancel, Some(CoordinatorConfig::default()));
        assert!(!f.coordinator.activate());
        assert!(f.operator.warnings().is_empty());
        assert_eq!(f.operator.configuration_prompts(), 0);

        f.operator.set_decision(SnapshotDecision::Take);
        f.notifications.refuse(NotificationPoint::Debugger);
        assert!(!f.coordinator.activate());
        assert_eq!(f.coordinator.state(), CoordinatorState::Idle);
        assert!(!f.notifications.is_hooked(NotificationPoint::Ui));
        assert_eq!(f.operator.warnings().len(), 1);
    }

    #[test]
    fn test_activation_rejects_other_architecture() {
        let config = CoordinatorConfig::default().with_architecture(Architecture::X86);
        let mut f = fixture(SnapshotDecision::Skip, Some(config));
        assert!(!f.coordinator.activate());
        assert_eq!(f.coordinator.state(), CoordinatorState::Idle);
        assert!(!f.notifications.is_hooked(NotificationPoint::Debugger));
        assert_eq!(f.operator.warnings().len(), 1);
        assert!(f.operator.warnings()[0].contains("debuggee is"));

        let config = CoordinatorConfig::default().with_architecture(Architecture::X86_64);
        let mut f = fixture(SnapshotDecision::Skip, Some(config));
        assert!(f.coordinator.activate());
        assert_eq!(
            f.coordinator.config().and_then(|c| c.architecture),
            Some(Architecture::X86_64)
        );
    }

    #[test]
    fn test_initial_snapshot_on_first_instruction() {
        let mut f = fixture(SnapshotDecision::Take, None);
        f.decoder.insert(0x1000, Instruction::Nop, 1);
        assert!(f.coordinator.activate());
        assert!(f.coordinator.snapshots().is_empty());

        f.coordinator.handle_notification(step(0x1000));
        assert_eq!(f.coordinator.state(), CoordinatorState::Tracing);
        assert_eq!(f.coordinator.snapshots().len(), 1);
        assert_eq!(f.coordinator.stats().snapshots_captured, 1);
    }

    #[test]
    fn test_tainted_branch_emits_trigger() {
        let mut f = fixture(SnapshotDecision::Skip, None);
        f.debuggee.set_register(Register::Rax, 5).unwrap();
        f.decoder.insert(
            0x1000,
            Instruction::Cmp {
                left: Operand::Register(Register::Eax),
                right: Operand::Immediate(10),
            },
            3,
        );
        f.decoder.insert(
            0x1003,
            Instruction::Jcc {
                condition: Condition::L,
                target: 0x1020,
            },
            2,
        );
        assert!(f.coordinator.activate());
        f.coordinator.taint_register(Register::Eax).unwrap();

        assert!(matches!(
            f.coordinator.handle_notification(step(0x1000)),
            NotificationOutcome::Processed { trigger: None, .. }
        ));
        let outcome = f.coordinator.handle_notification(DebuggerNotification::Step {
            pc: 0x1003,
            next_pc: Some(0x1020),
        });
        let NotificationOutcome::Processed {
            trigger: Some(trigger),
            ..
        } = outcome
        else {
            panic!("expected a trigger, got {outcome:?}");
        };
        assert!(trigger.taken);
        assert_eq!(trigger.pc, 0x1003);
        assert_eq!(f.coordinator.drain_triggers().len(), 1);
        assert_eq!(f.coordinator.stats().constraints, 1);
    }

    #[test]
    fn test_process_exit_deactivates_and_keeps_triggers() {
        let mut f = fixture(SnapshotDecision::Skip, None);
        f.decoder.insert(
            0x1000,
            Instruction::Test {
                left: Operand::Register(Register::Ecx),
                right: Operand::Register(Register::Ecx),
            },
            2,
        );
        f.decoder.insert(
            0x1002,
            Instruction::Jcc {
                condition: Condition::E,
                target: 0x1010,
            },
            2,
        );
        assert!(f.coordinator.activate());
        f.coordinator.taint_register(Register::Rcx).unwrap();
        f.coordinator.handle_notification(step(0x1000));
        f.coordinator.handle_notification(step(0x1002));

        f.debuggee.exit();
        assert!(matches!(
            f.coordinator
                .handle_notification(DebuggerNotification::ProcessExit { pid: 1, code: 0 }),
            NotificationOutcome::Deactivated
        ));
        assert!(!f.coordinator.is_active());
        assert_eq!(f.coordinator.stats().triggers, 1);
        let triggers = f.coordinator.drain_triggers();
        assert_eq!(triggers.len(), 1);
        assert!(triggers[0].taken);
        assert!(matches!(
            f.coordinator.handle_notification(step(0x1000)),
            NotificationOutcome::Ignored
        ));
    }

    #[test]
    fn test_inaccessible_state_is_isolated() {
        let mut f = fixture(SnapshotDecision::Skip, None);
        f.decoder.insert(0x1000, Instruction::Nop, 1);
        assert!(f.coordinator.activate());
        f.debuggee.set_state(ProcessState::Running);
        assert!(matches!(
            f.coordinator.handle_notification(step(0x1000)),
            NotificationOutcome::Isolated(Error::InaccessibleState { .. })
        ));
        f.debuggee.set_state(ProcessState::Suspended);
        assert!(matches!(
            f.coordinator.handle_notification(step(0x1000)),
            NotificationOutcome::Skipped
        ));
        let stats = f.coordinator.stats();
        assert_eq!(stats.events, 2);
        assert_eq!(stats.isolated_errors, 1);
        assert!(f.coordinator.is_active());
    }

    #[test]
    fn test_instruction_limit_and_trace() {
        let config = CoordinatorConfig::full()
            .with_max_instructions(2)
            .with_tracing(TracingConfig {
                trace_instructions: true,
                ..TracingConfig::default()
            });
        let mut f = fixture(SnapshotDecision::Skip, Some(config));
        f.decoder.insert(0x1000, Instruction::Nop, 1);
        assert!(f.coordinator.activate());
        f.coordinator.handle_notification(step(0x1000));
        assert!(f.coordinator.is_active());
        f.coordinator.handle_notification(step(0x1000));
        assert!(!f.coordinator.is_active());
        assert_eq!(f.operator.warnings().len(), 1);

        let trace = f.coordinator.take_trace().unwrap();
        assert!(matches!(trace.first(), Some(TraceEvent::Activated { .. })));
        assert!(matches!(trace.last(), Some(TraceEvent::Deactivated { .. })));
        assert_eq!(
            trace
                .iter()
                .filter(|e| matches!(e, TraceEvent::Instruction { .. }))
                .count(),
            2
        );
    }
}
