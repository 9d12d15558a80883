//! Concrete state bridge.
//!
//! The engine never owns concrete values. Whenever it needs a value that is not
//! tracked symbolically it pulls it through a [`ConcreteStateSource`]. The
//! production implementation, [`DebuggeeBridge`], forwards every request to the
//! live debuggee at call time and refuses to answer unless the process is
//! suspended. Nothing is cached here; a stale answer would be written into the
//! symbolic model as ground truth.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::{
    host::{Debuggee, ProcessState},
    instruction::{Location, Register},
    Error, Result,
};

/// Supplies authoritative concrete values to the symbolic engine.
///
/// Implementations must reflect the debuggee as it is at the moment of the call
/// and must fail with [`Error::InaccessibleState`] rather than invent a value.
pub trait ConcreteStateSource: Send + Sync {
    /// Reads `size` bytes of concrete memory starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InaccessibleState`] if the process is not suspended or any
    /// byte of the range is unmapped.
    fn read_concrete_memory(&self, address: u64, size: usize) -> Result<Vec<u8>>;

    /// Reads the concrete value of `register`, zero-extended to 64 bits.
    ///
    /// Sub-registers (`al`, `ah`, `ax`, ...) are extracted from their full register.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InaccessibleState`] if the process is not suspended or the
    /// register does not exist on the debuggee's architecture.
    fn read_concrete_register(&self, register: Register) -> Result<u64>;
}

/// [`ConcreteStateSource`] backed by a live [`Debuggee`].
pub struct DebuggeeBridge {
    debuggee: Arc<dyn Debuggee>,
    reads: AtomicU64,
}

impl DebuggeeBridge {
    /// Creates a bridge reading from `debuggee`.
    #[must_use]
    pub fn new(debuggee: Arc<dyn Debuggee>) -> Self {
        Self {
            debuggee,
            reads: AtomicU64::new(0),
        }
    }

    /// Number of concrete reads served so far.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn ensure_suspended(&self, location: Location) -> Result<()> {
        match self.debuggee.state() {
            ProcessState::Suspended => Ok(()),
            state => Err(Error::InaccessibleState {
                location,
                reason: format!("debuggee is {state}"),
            }),
        }
    }
}

impl ConcreteStateSource for DebuggeeBridge {
    fn read_concrete_memory(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let location = Location::Memory {
            address,
            size: u8::try_from(size).unwrap_or(u8::MAX),
        };
        self.ensure_suspended(location)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.debuggee
            .read_memory(address, size)
            .map_err(|e| inaccessible(location, e))
    }

    fn read_concrete_register(&self, register: Register) -> Result<u64> {
        let location = Location::Register(register);
        self.ensure_suspended(location)?;
        let arch = self.debuggee.architecture();
        let Some(full) = register.full(arch) else {
            return Err(Error::InaccessibleState {
                location,
                reason: format!("{register} does not exist on {arch}"),
            });
        };
        self.reads.fetch_add(1, Ordering::Relaxed);
        let value = self
            .debuggee
            .read_register(full)
            .map_err(|e| inaccessible(location, e))?;
        Ok(register.extract(value))
    }
}

impl std::fmt::Debug for DebuggeeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebuggeeBridge")
            .field("reads", &self.reads())
            .finish_non_exhaustive()
    }
}

fn inaccessible(location: Location, error: Error) -> Error {
    match error {
        Error::InaccessibleState { .. } => error,
        other => Error::InaccessibleState {
            location,
            reason: other.to_string(),
        },
    }
}
