use thiserror::Error;

use crate::{host::NotificationPoint, instruction::Location, snapshot::SnapshotHandle};

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants fall into two groups with very different propagation rules:
///
/// ## Activation Errors
/// - [`Error::Configuration`] - Invalid or duplicate engine initialization
/// - [`Error::HookInstallation`] - A debugger notification point could not be registered
/// - [`Error::ActivationDeclined`] - The operator cancelled the initial snapshot prompt
///
/// These abort the whole activation. The coordinator stays `Idle` and nothing
/// partially installed survives.
///
/// ## Per-Instruction Errors
/// - [`Error::InaccessibleState`] - A concrete read failed (debuggee running, address unmapped)
/// - [`Error::Undecodable`] - The bytes at the program counter did not decode
///
/// These are isolated to the instruction being traced. The coordinator logs them
/// and continues with the next event.
///
/// ## Exploration Errors
/// - [`Error::StaleSnapshot`] - The snapshot belongs to a process that has exited
/// - [`Error::UnknownSnapshot`] - The handle was released or never issued
/// - [`Error::NotActive`] / [`Error::InvalidState`] - The operation needs a live context
///
/// # Examples
///
/// ```rust
/// use symtrace::Error;
///
/// fn report(result: symtrace::Result<()>) {
///     match result {
///         Ok(()) => {}
///         Err(Error::InaccessibleState { location, reason }) => {
///             eprintln!("{location} is unreadable: {reason}");
///         }
///         Err(e) => eprintln!("{e}"),
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The symbolic engine could not be configured.
    ///
    /// Raised when [`EngineAdapter::initialize`](crate::engine::EngineAdapter::initialize)
    /// is called twice without an intervening teardown, or when the requested
    /// architecture is declared but not supported.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A debugger notification point failed to register.
    ///
    /// Any point that was already installed has been rolled back by the time
    /// this error is returned.
    #[error("Failed to hook {point} notifications: {reason}")]
    HookInstallation {
        /// The notification point that failed
        point: NotificationPoint,
        /// Host supplied reason
        reason: String,
    },

    /// A concrete value could not be read from the debuggee.
    ///
    /// The debuggee is not suspended or the address is unmapped. The value is
    /// never defaulted; the affected location is marked unresolved instead.
    #[error("Inaccessible state at {location}: {reason}")]
    InaccessibleState {
        /// The register or memory range that could not be read
        location: Location,
        /// Why the read failed
        reason: String,
    },

    /// The instruction bytes at the given program counter could not be decoded.
    #[error("Could not decode instruction at {pc:#x}")]
    Undecodable {
        /// Program counter of the undecodable instruction
        pc: u64,
    },

    /// A restore was requested for a snapshot whose process no longer exists.
    ///
    /// Nothing was written to the debuggee or the engine.
    #[error("Snapshot {0} belongs to a process that has exited")]
    StaleSnapshot(SnapshotHandle),

    /// The snapshot handle was released or never issued.
    #[error("Unknown snapshot {0}")]
    UnknownSnapshot(SnapshotHandle),

    /// The operation requires an active execution context.
    #[error("No execution context is active")]
    NotActive,

    /// The operation is not valid in the current coordinator or debuggee state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The operator cancelled activation at the initial snapshot prompt.
    #[error("Activation declined by the operator")]
    ActivationDeclined,

    /// Trace file I/O error.
    #[error("Trace I/O error: {0}")]
    Trace(#[from] std::io::Error),

    /// Serialization of a trace record or configuration failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A lock guarding shared host state was poisoned.
    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl Error {
    /// Returns `true` if this error only affects the instruction being traced.
    ///
    /// The coordinator logs such errors and keeps tracing.
    #[must_use]
    pub fn is_instruction_local(&self) -> bool {
        matches!(
            self,
            Error::InaccessibleState { .. } | Error::Undecodable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Register;

    #[test]
    fn test_instruction_local_classification() {
        let inaccessible = Error::InaccessibleState {
            location: Location::Register(Register::Rax),
            reason: "process running".to_string(),
        };
        assert!(inaccessible.is_instruction_local());
        assert!(Error::Undecodable { pc: 0x401000 }.is_instruction_local());
        assert!(!Error::NotActive.is_instruction_local());
        assert!(!Error::Configuration("twice".to_string()).is_instruction_local());
    }

    #[test]
    fn test_display() {
        let err = Error::InaccessibleState {
            location: Location::Memory {
                address: 0x1000,
                size: 4,
            },
            reason: "unmapped".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Inaccessible state at [0x1000:4]: unmapped"
        );
        assert_eq!(
            Error::Undecodable { pc: 0x10 }.to_string(),
            "Could not decode instruction at 0x10"
        );
    }
}
