//! # symtrace Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the symtrace library. Import this module to get quick access to everything needed
//! to drive a tracing session.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all symtrace operations
pub use crate::Error;

/// The result type used throughout symtrace
pub use crate::Result;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// Session coordinator and its builder
pub use crate::coordinator::{
    CoordinatorBuilder, CoordinatorState, ExecutionCoordinator, NotificationOutcome,
};

/// Configuration
pub use crate::config::{CoordinatorConfig, TracingConfig};

// ================================================================================================
// Engine
// ================================================================================================

/// Engine adapter and its configuration
pub use crate::engine::{Architecture, EngineAdapter, SymbolicDelta, SymbolicOptimization};

/// Symbolic state
pub use crate::engine::{
    Expr, PathConstraint, SymbolicCell, SymbolicState, SymbolicVariable, VarId,
};

/// Concrete state bridge
pub use crate::bridge::{ConcreteStateSource, DebuggeeBridge};

// ================================================================================================
// Instructions
// ================================================================================================

/// Instruction model
pub use crate::instruction::{
    Condition, Instruction, InstructionEvent, Location, Memory, Operand, Register,
};

// ================================================================================================
// Exploration
// ================================================================================================

/// Snapshots
pub use crate::snapshot::{Snapshot, SnapshotHandle, SnapshotManager};

/// Taint triggers
pub use crate::trigger::{TaintTrigger, TriggerDispatcher};

/// Session recording
pub use crate::{
    stats::ExecutionStats,
    trace::{TraceEvent, TraceWriter},
};

// ================================================================================================
// Host Integration
// ================================================================================================

/// Debugger collaborator traits
pub use crate::host::{
    ConfigurationStore, Debuggee, DebuggerNotification, InstructionDecoder, NotificationPoint,
    NotificationSource, Operator, ProcessState, SnapshotDecision,
};

/// In-memory host implementations
pub use crate::host::{
    MemoryConfigurationStore, RecordingNotificationSource, ScriptedDecoder, ScriptedOperator,
    SimulatedDebuggee, X86Decoder,
};
