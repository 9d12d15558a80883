// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # symtrace
//!
//! Concolic execution inside an interactive debugger.
//!
//! `symtrace` observes a live process instruction by instruction, mirrors the parts
//! of its state that depend on chosen inputs into a symbolic and taint model, and
//! reports every conditional branch that tainted data decides. Snapshots of the
//! process and of the symbolic model let an operator rewind and explore the other
//! side of such a branch without re-running the target.
//!
//! ## Features
//!
//! - **Pull-based concrete state** - the engine reads registers and memory from the live process only when it needs them
//! - **All-or-nothing processing** - an instruction either updates the symbolic state completely or not at all
//! - **Optimization policy** - skip instructions that touch nothing symbolic or nothing tainted
//! - **Snapshots** - copy-on-write symbolic state plus journaled memory pre-images, restorable any number of times
//! - **Taint triggers** - observed outcome and symbolic predicate of every tainted branch
//! - **Host agnostic** - the debugger is reached only through the traits in [`host`]
//!
//! ## Quick Start
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
//!     .operator(Arc::new(ScriptedOperator::new(SnapshotDecision::Take)))
//!     .build()?;
//!
//! coordinator.activate();
//! coordinator.taint_memory(0x7fff_0000, 16)?;
//! // ... feed host notifications through handle_notification ...
//! for trigger in coordinator.drain_triggers() {
//!     println!("{:#x}: {:?}", trigger.pc, trigger.predicate);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`bridge`] - Concrete state bridge between the engine and the live process
//! - [`engine`] - Symbolic expressions, symbolic state and instruction semantics
//! - [`snapshot`] - Snapshot capture, write journaling and restore
//! - [`hook`] - Debugger notification hook and instruction event construction
//! - [`trigger`] - Classification of tainted conditional branches
//! - [`coordinator`] - The session state machine tying everything together
//!
//! Supporting modules: [`instruction`] (instruction model), [`host`] (debugger
//! collaborators and simulated implementations), [`config`], [`trace`] and [`stats`].

mod error;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use symtrace::prelude::*;
///
/// let config = CoordinatorConfig::fast();
/// assert!(config.validate().is_ok());
/// ```
pub mod prelude;

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod hook;
pub mod host;
pub mod instruction;
pub mod snapshot;
pub mod stats;
pub mod trace;
pub mod trigger;

/// `symtrace` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `symtrace` Error type
///
/// Activation errors abort activation; per-instruction errors only skip the
/// instruction being traced.
pub use error::Error;

pub use config::{CoordinatorConfig, TracingConfig};
pub use coordinator::{
    CoordinatorBuilder, CoordinatorState, ExecutionCoordinator, NotificationOutcome,
};
pub use engine::{Architecture, SymbolicOptimization};
pub use snapshot::SnapshotHandle;
pub use trigger::TaintTrigger;
