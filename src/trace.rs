//! Session tracing.
//!
//! Coordinator activity is recorded as [`TraceEvent`]s through a [`TraceWriter`],
//! either to an NDJSON file or to a bounded in-memory buffer. Which categories are
//! recorded is selected by [`TracingConfig`].
//!
//! # Output Format
//!
//! Each line of a trace file is one JSON object with a `type` field naming the
//! event, preceded by a `context` field when a context prefix is configured:
//!
//! ```text
//! {"context":"run-1","type":"instruction","index":3,"pc":4102,"mnemonic":"cmp","skipped":false,"changes":1,"tainted":true}
//! ```

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    mem,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use serde::Serialize;

use crate::{
    config::TracingConfig,
    engine::{Architecture, SymbolicOptimization},
    instruction::Condition,
    trigger::TaintTrigger,
    Error, Result,
};

/// A recorded coordinator event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    /// The coordinator was activated.
    Activated {
        /// Architecture of the debuggee
        architecture: Architecture,
        /// Enabled engine optimizations
        optimizations: SymbolicOptimization,
        /// Whether an initial snapshot was requested
        snapshot: bool,
    },

    /// An instruction event was presented to the engine.
    Instruction {
        /// Position in the trace
        index: u64,
        /// Instruction address
        pc: u64,
        /// Assembly mnemonic
        mnemonic: String,
        /// Whether the engine skipped it
        skipped: bool,
        /// Number of symbolic cells changed
        changes: usize,
        /// Whether any changed cell is tainted
        tainted: bool,
    },

    /// A tainted branch was observed.
    Trigger {
        /// Position of the branch in the trace
        index: u64,
        /// Branch address
        pc: u64,
        /// Condition code
        condition: Condition,
        /// Observed outcome
        taken: bool,
        /// Address execution continued at
        successor: u64,
        /// Branch predicate in SMT syntax
        predicate: Option<String>,
    },

    /// An instruction failed to process and left the state untouched.
    Error {
        /// Instruction address, if known
        pc: Option<u64>,
        /// Error description
        message: String,
    },

    /// A snapshot was captured.
    SnapshotCaptured {
        /// Snapshot identifier
        handle: u32,
        /// Instruction pointer at capture
        pc: u64,
        /// Instructions traced before capture
        index: u64,
    },

    /// A snapshot was restored.
    SnapshotRestored {
        /// Snapshot identifier
        handle: u32,
        /// Instruction pointer after restore
        pc: u64,
    },

    /// A snapshot was released.
    SnapshotReleased {
        /// Snapshot identifier
        handle: u32,
    },

    /// The coordinator was deactivated.
    Deactivated {
        /// Why the session ended
        reason: String,
        /// Instructions traced during the session
        instructions: u64,
    },
}

impl TraceEvent {
    /// Builds a trigger event.
    #[must_use]
    pub fn trigger(trigger: &TaintTrigger) -> Self {
        TraceEvent::Trigger {
            index: trigger.index,
            pc: trigger.pc,
            condition: trigger.condition,
            taken: trigger.taken,
            successor: trigger.successor(),
            predicate: trigger.predicate.as_ref().map(ToString::to_string),
        }
    }

    /// Returns true if `config` selects this event's category.
    #[must_use]
    pub fn is_selected(&self, config: &TracingConfig) -> bool {
        match self {
            TraceEvent::Instruction { .. } => config.trace_instructions,
            TraceEvent::Trigger { .. } => config.trace_triggers,
            TraceEvent::Error { .. } => config.trace_errors,
            TraceEvent::SnapshotCaptured { .. }
            | TraceEvent::SnapshotRestored { .. }
            | TraceEvent::SnapshotReleased { .. } => config.trace_snapshots,
            TraceEvent::Activated { .. } | TraceEvent::Deactivated { .. } => config.is_enabled(),
        }
    }

    /// Serializes the event as one JSON line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the event cannot be serialized.
    pub fn to_json(&self) -> Result<String> {
        self.to_json_with_context(None)
    }

    /// Serializes the event as one JSON line with a leading `context` field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the event cannot be serialized.
    pub fn to_json_with_context(&self, context: Option<&str>) -> Result<String> {
        #[derive(Serialize)]
        struct Record<'a> {
            #[serde(skip_serializing_if = "Option::is_none")]
            context: Option<&'a str>,
            #[serde(flatten)]
            event: &'a TraceEvent,
        }

        Ok(serde_json::to_string(&Record {
            context,
            event: self,
        })?)
    }
}

/// Writes trace events to a file or an in-memory buffer.
///
/// Thread-safe via internal locking.
pub struct TraceWriter {
    file: Option<Mutex<BufWriter<File>>>,
    buffer: Option<Mutex<Vec<TraceEvent>>>,
    /// Maximum buffer size (0 = unlimited).
    max_entries: usize,
    event_count: AtomicU64,
    context_prefix: Option<String>,
}

impl TraceWriter {
    /// Creates a writer appending NDJSON lines to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Trace`] if the file cannot be opened.
    pub fn new_file<P: AsRef<Path>>(path: P, context: Option<String>) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Some(Mutex::new(BufWriter::new(file))),
            buffer: None,
            max_entries: 0,
            event_count: AtomicU64::new(0),
            context_prefix: context,
        })
    }

    /// Creates a writer keeping at most `max_entries` events in memory (0 for
    /// unlimited). The oldest events are discarded first.
    #[must_use]
    pub fn new_memory(max_entries: usize, context: Option<String>) -> Self {
        Self {
            file: None,
            buffer: Some(Mutex::new(Vec::with_capacity(max_entries.min(10_000)))),
            max_entries,
            event_count: AtomicU64::new(0),
            context_prefix: context,
        }
    }

    /// Creates the writer `config` describes, or `None` if tracing is disabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Trace`] if the output file cannot be opened.
    pub fn from_config(config: &TracingConfig) -> Result<Option<Self>> {
        if !config.is_enabled() {
            return Ok(None);
        }
        let writer = match &config.output_path {
            Some(path) => Self::new_file(path, config.context_prefix.clone())?,
            None => Self::new_memory(config.max_trace_entries, config.context_prefix.clone()),
        };
        Ok(Some(writer))
    }

    /// Returns the context prefix, if any.
    #[must_use]
    pub fn context_prefix(&self) -> Option<&str> {
        self.context_prefix.as_deref()
    }

    /// Records an event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Trace`] if the file write fails and
    /// [`Error::LockPoisoned`] if another writer panicked.
    pub fn write(&self, event: TraceEvent) -> Result<()> {
        self.event_count.fetch_add(1, Ordering::Relaxed);

        if let Some(ref file) = self.file {
            let json = event.to_json_with_context(self.context_prefix.as_deref())?;
            let mut writer = file
                .lock()
                .map_err(|_| Error::LockPoisoned("trace file"))?;
            writeln!(writer, "{json}")?;
        } else if let Some(ref buffer) = self.buffer {
            let mut buf = buffer
                .lock()
                .map_err(|_| Error::LockPoisoned("trace buffer"))?;
            if self.max_entries > 0 && buf.len() >= self.max_entries {
                buf.remove(0);
            }
            buf.push(event);
        }
        Ok(())
    }

    /// Flushes buffered file output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Trace`] if the flush fails.
    pub fn flush(&self) -> Result<()> {
        if let Some(ref file) = self.file {
            let mut writer = file
                .lock()
                .map_err(|_| Error::LockPoisoned("trace file"))?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Returns the number of events written.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    /// Takes the in-memory buffer, leaving it empty.
    ///
    /// Returns `None` if this is a file-based writer.
    pub fn take_buffer(&self) -> Option<Vec<TraceEvent>> {
        self.buffer
            .as_ref()
            .and_then(|buf| buf.lock().ok().map(|mut b| mem::take(&mut *b)))
    }
}

impl std::fmt::Debug for TraceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceWriter")
            .field("is_file_based", &self.file.is_some())
            .field("max_entries", &self.max_entries)
            .field("event_count", &self.event_count())
            .finish_non_exhaustive()
    }
}
