//! Host debugger collaborators.
//!
//! Everything the coordinator needs from the surrounding debugger is expressed as a
//! narrow trait here: process access ([`Debuggee`]), notification registration
//! ([`NotificationSource`]), instruction decoding ([`InstructionDecoder`]), operator
//! prompts ([`Operator`]) and the persisted configuration ([`ConfigurationStore`]).
//!
//! All traits take `&self`; implementations use interior mutability and are shared
//! through `Arc`, so a single debugger object can be handed to the bridge, the
//! snapshot manager and the hook at the same time.
//!
//! [`SimulatedDebuggee`] and the other in-memory implementations in this module
//! drive the coordinator without a real debugger. They back the test suite and the
//! trace replay tool.

mod decoder;
mod memory;
mod simulated;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    config::CoordinatorConfig,
    engine::Architecture,
    instruction::{Instruction, Register},
    Result,
};

pub use decoder::X86Decoder;
pub use memory::{Page, PagedMemory, PAGE_SIZE};
pub use simulated::{
    MemoryConfigurationStore, RecordingNotificationSource, ScriptedDecoder, ScriptedOperator,
    SimulatedDebuggee,
};

/// Execution state of the debugged process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// No process has been started.
    NotStarted,
    /// The process is executing; registers and memory cannot be read.
    Running,
    /// The process is stopped at an instruction boundary.
    Suspended,
    /// The process has terminated.
    Exited,
}

/// Access to the debugged process.
pub trait Debuggee: Send + Sync {
    /// Architecture of the debugged process.
    fn architecture(&self) -> Architecture;

    /// Current execution state.
    fn state(&self) -> ProcessState;

    /// Identifier of the live process, `None` once it has exited or before it started.
    fn process_id(&self) -> Option<u32>;

    /// Reads a full-width register.
    ///
    /// # Errors
    ///
    /// Returns an error if the register cannot be read.
    fn read_register(&self, register: Register) -> Result<u64>;

    /// Writes a full-width register.
    ///
    /// # Errors
    ///
    /// Returns an error if the register cannot be written.
    fn write_register(&self, register: Register, value: u64) -> Result<()>;

    /// Reads `size` bytes of memory at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if any byte of the range is unmapped.
    fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>>;

    /// Writes `data` to memory at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if any byte of the range is unmapped.
    fn write_memory(&self, address: u64, data: &[u8]) -> Result<()>;
}

/// Host notification points the coordinator subscribes to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum NotificationPoint {
    /// UI lifecycle notifications (database closing, plugin unload).
    Ui,
    /// Debugger events (step, breakpoint, process start and exit).
    Debugger,
}

/// Registration of notification callbacks with the host.
pub trait NotificationSource: Send + Sync {
    /// Subscribes to `point`.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses the registration.
    fn hook(&self, point: NotificationPoint) -> Result<()>;

    /// Unsubscribes from `point`. Unhooking a point that is not hooked is a no-op.
    fn unhook(&self, point: NotificationPoint);
}

/// A raw notification delivered by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DebuggerNotification {
    /// Single-step completed; the process is stopped at `pc`.
    Step {
        /// Address of the instruction about to execute
        pc: u64,
        /// Address execution continued at, when the host already knows it
        #[serde(default)]
        next_pc: Option<u64>,
    },
    /// A breakpoint was hit; the process is stopped at `pc`.
    Breakpoint {
        /// Address of the instruction about to execute
        pc: u64,
        /// Address execution continued at, when the host already knows it
        #[serde(default)]
        next_pc: Option<u64>,
    },
    /// A new process was started under the debugger.
    ProcessStart {
        /// Identifier of the new process
        pid: u32,
    },
    /// The debugged process exited.
    ProcessExit {
        /// Identifier of the exited process
        pid: u32,
        /// Exit code reported by the host
        code: i32,
    },
    /// The host UI is shutting down.
    UiClosing,
}

impl DebuggerNotification {
    /// The notification point this notification is delivered through.
    #[must_use]
    pub fn point(&self) -> NotificationPoint {
        match self {
            DebuggerNotification::UiClosing => NotificationPoint::Ui,
            _ => NotificationPoint::Debugger,
        }
    }
}

/// Decodes raw instruction bytes.
pub trait InstructionDecoder: Send + Sync {
    /// Decodes the instruction at `pc` from `bytes`.
    ///
    /// Returns the instruction and its length in bytes, or `None` if the bytes
    /// do not form a valid instruction.
    fn decode(&self, arch: Architecture, pc: u64, bytes: &[u8]) -> Option<(Instruction, usize)>;
}

/// The operator's answer to the initial snapshot prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SnapshotDecision {
    /// Take an initial snapshot before tracing.
    Take,
    /// Trace without an initial snapshot.
    Skip,
    /// Abort activation.
    Cancel,
}

/// Blocking operator interaction.
pub trait Operator: Send + Sync {
    /// Asks whether an initial snapshot should be taken before tracing starts.
    fn confirm_initial_snapshot(&self) -> SnapshotDecision;

    /// Asks the operator for a configuration when none is stored.
    ///
    /// Returning `None` accepts the defaults.
    fn prompt_configuration(&self) -> Option<CoordinatorConfig>;

    /// Shows a warning.
    fn warn(&self, message: &str);
}

/// Read-only access to the persisted coordinator configuration.
pub trait ConfigurationStore: Send + Sync {
    /// Loads the stored configuration, if any.
    fn load(&self) -> Option<CoordinatorConfig>;
}
