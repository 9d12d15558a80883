//! Taint-gated branch triggers.
//!
//! A [`TaintTrigger`] is emitted for every processed conditional branch whose flags
//! depend on tainted data, carrying the observed outcome and the symbolic predicate.
//! Branches on symbolic but untainted data emit nothing.
//!
//! [`TriggerDispatcher::classify`] is a pure function of a [`SymbolicDelta`]; the
//! dispatcher itself only queues what it classifies until the host drains it.

use std::collections::VecDeque;

use serde::Serialize;

use crate::{
    engine::{Expr, SymbolicDelta},
    instruction::Condition,
};

/// A conditional branch decided by tainted data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaintTrigger {
    /// Index of the branch instruction in the trace
    pub index: u64,
    /// Address of the branch
    pub pc: u64,
    /// Taken target
    pub target: u64,
    /// Not-taken successor
    pub fallthrough: u64,
    /// Condition code
    pub condition: Condition,
    /// Observed outcome
    pub taken: bool,
    /// Always true for emitted triggers
    pub tainted: bool,
    /// Predicate under which the branch is taken, when expressible
    pub predicate: Option<Expr>,
}

impl TaintTrigger {
    /// Address execution continued at.
    #[must_use]
    pub fn successor(&self) -> u64 {
        if self.taken {
            self.target
        } else {
            self.fallthrough
        }
    }

    /// Address of the branch side that was not explored.
    #[must_use]
    pub fn alternative(&self) -> u64 {
        if self.taken {
            self.fallthrough
        } else {
            self.target
        }
    }
}

/// Classifies deltas and queues triggers until they are drained.
#[derive(Debug)]
pub struct TriggerDispatcher {
    pending: VecDeque<TaintTrigger>,
    capacity: usize,
    emitted: u64,
    dropped: u64,
}

impl TriggerDispatcher {
    /// Creates a dispatcher holding at most `capacity` undrained triggers.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            emitted: 0,
            dropped: 0,
        }
    }

    /// Returns the trigger a delta produces, if any.
    #[must_use]
    pub fn classify(delta: &SymbolicDelta) -> Option<TaintTrigger> {
        let branch = delta.branch.as_ref()?;
        if !branch.tainted {
            return None;
        }
        let Some(taken) = branch.taken else {
            log::debug!(
                "{:#x}: tainted j{} with unknown outcome",
                branch.pc,
                branch.condition
            );
            return None;
        };
        Some(TaintTrigger {
            index: delta.index,
            pc: branch.pc,
            target: branch.target,
            fallthrough: branch.fallthrough,
            condition: branch.condition,
            taken,
            tainted: true,
            predicate: branch.predicate.clone(),
        })
    }

    /// Classifies `delta` and queues the resulting trigger.
    pub fn dispatch(&mut self, delta: &SymbolicDelta) -> Option<TaintTrigger> {
        let trigger = Self::classify(delta)?;
        if self.pending.len() >= self.capacity {
            self.pending.pop_front();
            self.dropped += 1;
            log::warn!(
                "trigger queue full ({}), dropped the oldest trigger",
                self.capacity
            );
        }
        log::info!(
            "{:#x}: tainted branch {} -> {:#x}",
            trigger.pc,
            if trigger.taken { "taken" } else { "not taken" },
            trigger.successor()
        );
        self.pending.push_back(trigger.clone());
        self.emitted += 1;
        Some(trigger)
    }

    /// Removes and returns every queued trigger in emission order.
    pub fn drain(&mut self) -> Vec<TaintTrigger> {
        self.pending.drain(..).collect()
    }

    /// Number of queued triggers.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Triggers emitted since creation.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Triggers dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
