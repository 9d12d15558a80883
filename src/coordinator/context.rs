//! Per-activation state of the coordinator.

use crate::{
    config::CoordinatorConfig,
    engine::{Architecture, EngineAdapter},
    hook::TraceHook,
    snapshot::SnapshotManager,
    stats::ExecutionStats,
    trace::{TraceEvent, TraceWriter},
    trigger::{TaintTrigger, TriggerDispatcher},
};

/// Lifecycle phase of an active context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Phase {
    /// Hooks installed, no instruction seen yet.
    Armed,
    /// At least one instruction event was handled.
    Tracing,
}

/// Everything that lives between activation and deactivation.
#[derive(Debug)]
pub(super) struct ExecutionContext {
    pub(super) architecture: Architecture,
    pub(super) config: CoordinatorConfig,
    pub(super) phase: Phase,
    pub(super) pending_snapshot: bool,
    pub(super) engine: EngineAdapter,
    pub(super) snapshots: SnapshotManager,
    pub(super) hook: TraceHook,
    pub(super) triggers: TriggerDispatcher,
    pub(super) stats: ExecutionStats,
    pub(super) trace: Option<TraceWriter>,
}

impl ExecutionContext {
    /// Records `event` if the tracing configuration selects it.
    ///
    /// Trace failures never interrupt the session.
    pub(super) fn record(&self, event: TraceEvent) {
        let Some(writer) = &self.trace else {
            return;
        };
        if !event.is_selected(&self.config.tracing) {
            return;
        }
        if let Err(error) = writer.write(event) {
            log::warn!("failed to record trace event: {error}");
        }
    }

    /// Returns true once the processed instruction limit is reached.
    pub(super) fn limit_reached(&self) -> bool {
        self.config.max_instructions > 0 && self.stats.events >= self.config.max_instructions
    }

    /// Unhooks, tears the engine down and keeps what outlives the session.
    pub(super) fn retire(mut self, reason: &str) -> Retired {
        self.hook.uninstall();
        let instructions = self.engine.state().instruction_count();
        self.record(TraceEvent::Deactivated {
            reason: reason.to_string(),
            instructions,
        });
        if let Some(writer) = &self.trace {
            if let Err(error) = writer.flush() {
                log::warn!("failed to flush trace: {error}");
            }
        }
        self.engine.teardown();
        self.snapshots.clear();
        log::info!("deactivated ({reason}) after {instructions} instruction(s)");

        Retired {
            stats: self.stats,
            triggers: self.triggers.drain(),
            trace: self.trace,
        }
    }
}

/// What remains of the last session after deactivation.
#[derive(Debug, Default)]
pub(super) struct Retired {
    pub(super) stats: ExecutionStats,
    pub(super) triggers: Vec<TaintTrigger>,
    pub(super) trace: Option<TraceWriter>,
}
