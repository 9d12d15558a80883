//! Coordinator configuration.
//!
//! [`CoordinatorConfig`] is loaded from the host's configuration store when the
//! coordinator is activated. If nothing is stored the operator is prompted, and if
//! the operator does not answer either the defaults apply.
//!
//! # Presets
//!
//! - [`CoordinatorConfig::default()`] - all engine optimizations, triggers and errors traced in memory
//! - [`CoordinatorConfig::full()`] - every instruction processed and traced
//! - [`CoordinatorConfig::fast()`] - all optimizations, no tracing
//!
//! # Example
//!
//! ```rust,no_run
//! use symtrace::{CoordinatorConfig, SymbolicOptimization, TracingConfig};
//!
//! let config = CoordinatorConfig::fast()
//!     .with_optimizations(SymbolicOptimization::ONLY_ON_TAINTED)
//!     .with_max_instructions(1_000_000)
//!     .with_tracing(TracingConfig::full_trace("session.ndjson"));
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{
    engine::{Architecture, SymbolicOptimization},
    Error, Result,
};

/// Configuration of one coordinator session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Architecture the session expects.
    ///
    /// `None` follows whatever the debuggee reports. When set, activation fails on a
    /// debuggee of any other architecture.
    pub architecture: Option<Architecture>,

    /// Engine optimizations.
    pub optimizations: SymbolicOptimization,

    /// Maximum number of undrained triggers kept by the dispatcher.
    ///
    /// When full, the oldest trigger is dropped.
    pub trigger_capacity: usize,

    /// Number of processed instructions after which the session deactivates.
    ///
    /// 0 means unlimited.
    pub max_instructions: u64,

    /// Recording of coordinator activity.
    pub tracing: TracingConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            architecture: None,
            optimizations: SymbolicOptimization::default(),
            trigger_capacity: 1024,
            max_instructions: 0,
            tracing: TracingConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Processes every instruction and records everything in memory.
    #[must_use]
    pub fn full() -> Self {
        Self {
            optimizations: SymbolicOptimization::empty(),
            tracing: TracingConfig {
                trace_instructions: true,
                trace_triggers: true,
                trace_snapshots: true,
                trace_errors: true,
                max_trace_entries: 0,
                ..TracingConfig::default()
            },
            ..Self::default()
        }
    }

    /// All optimizations enabled and nothing recorded.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            tracing: TracingConfig::disabled(),
            ..Self::default()
        }
    }

    /// Pins the session to `architecture`.
    #[must_use]
    pub fn with_architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = Some(architecture);
        self
    }

    /// Sets the engine optimizations.
    #[must_use]
    pub fn with_optimizations(mut self, optimizations: SymbolicOptimization) -> Self {
        self.optimizations = optimizations;
        self
    }

    /// Sets the trigger queue capacity.
    #[must_use]
    pub fn with_trigger_capacity(mut self, capacity: usize) -> Self {
        self.trigger_capacity = capacity;
        self
    }

    /// Sets the processed instruction limit (0 for unlimited).
    #[must_use]
    pub fn with_max_instructions(mut self, max: u64) -> Self {
        self.max_instructions = max;
        self
    }

    /// Sets the tracing configuration.
    #[must_use]
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }

    /// Checks the configuration for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the trigger queue has no capacity.
    pub fn validate(&self) -> Result<()> {
        if self.trigger_capacity == 0 {
            return Err(Error::Configuration(
                "trigger capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the architecture to trace a debuggee reporting `reported` with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if an architecture is configured and differs
    /// from `reported`.
    pub fn resolve_architecture(&self, reported: Architecture) -> Result<Architecture> {
        match self.architecture {
            Some(expected) if expected != reported => Err(Error::Configuration(format!(
                "configured for {expected} but the debuggee is {reported}"
            ))),
            _ => Ok(reported),
        }
    }
}

/// What the coordinator records, and where.
///
/// Events go to `output_path` as NDJSON when it is set, otherwise into a bounded
/// in-memory buffer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Record every processed or skipped instruction. Very high volume.
    pub trace_instructions: bool,

    /// Record every emitted taint trigger.
    pub trace_triggers: bool,

    /// Record snapshot capture, restore and release.
    pub trace_snapshots: bool,

    /// Record instructions that failed to process.
    pub trace_errors: bool,

    /// Maximum events kept in memory; 0 for unlimited. Ignored for file output.
    pub max_trace_entries: usize,

    /// NDJSON output file.
    pub output_path: Option<PathBuf>,

    /// Included as a `context` field in every recorded event.
    pub context_prefix: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            trace_instructions: false,
            trace_triggers: true,
            trace_snapshots: true,
            trace_errors: true,
            max_trace_entries: 10_000,
            output_path: None,
            context_prefix: None,
        }
    }
}

impl TracingConfig {
    /// Records everything to `path`.
    #[must_use]
    pub fn full_trace<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            trace_instructions: true,
            trace_triggers: true,
            trace_snapshots: true,
            trace_errors: true,
            max_trace_entries: 0,
            output_path: Some(path.into()),
            context_prefix: None,
        }
    }

    /// Records nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            trace_instructions: false,
            trace_triggers: false,
            trace_snapshots: false,
            trace_errors: false,
            ..Self::default()
        }
    }

    /// Sets the context prefix.
    #[must_use]
    pub fn with_context(mut self, prefix: impl Into<String>) -> Self {
        self.context_prefix = Some(prefix.into());
        self
    }

    /// Returns true if any category is recorded.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.trace_instructions || self.trace_triggers || self.trace_snapshots || self.trace_errors
    }

    /// Returns true if events go to a file.
    #[must_use]
    pub fn has_output_file(&self) -> bool {
        self.output_path.is_some()
    }
}
