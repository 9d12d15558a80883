//! Persistent symbolic state.
//!
//! [`SymbolicState`] records which locations currently hold a symbolic value and
//! what that value is. Every location without an entry is concrete and its value
//! lives only in the debuggee. All collections are `imbl` persistent structures,
//! so cloning a state for a snapshot is O(1) and later writes share structure with
//! the copy.
//!
//! Registers are stored at full width. Memory is stored per byte; with aligned
//! memory enabled an additional cache keeps whole naturally-aligned cells so the
//! common case of reading back what was written does not reassemble bytes.

use imbl::{OrdMap, OrdSet, Vector};
use serde::Serialize;

use crate::{
    engine::expr::{Expr, VarId},
    instruction::{Location, Register},
};

/// A symbolic value and its taint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolicCell {
    /// The symbolic value
    pub expr: Expr,
    /// Whether the value depends on a tainted source
    pub tainted: bool,
}

impl SymbolicCell {
    /// Creates a cell.
    #[must_use]
    pub fn new(expr: Expr, tainted: bool) -> Self {
        Self { expr, tainted }
    }
}

/// A symbolic variable introduced by symbolizing a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolicVariable {
    /// Variable identifier
    pub id: VarId,
    /// The location that was symbolized
    pub origin: Location,
    /// Width in bits
    pub bits: u32,
    /// Concrete value of the location when it was symbolized
    pub value: u64,
    /// Whether the variable is a taint source
    pub tainted: bool,
}

/// A branch condition observed on a symbolic path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathConstraint {
    /// Index of the branch instruction in the trace
    pub index: u64,
    /// Address of the branch instruction
    pub pc: u64,
    /// 1-bit predicate that holds when the branch is taken
    pub predicate: Expr,
    /// Observed outcome
    pub taken: bool,
    /// Whether the predicate depends on tainted data
    pub tainted: bool,
}

impl PathConstraint {
    /// The predicate as it held on the observed path.
    #[must_use]
    pub fn assertion(&self) -> Expr {
        if self.taken {
            self.predicate.clone()
        } else {
            self.predicate.logical_not()
        }
    }
}

/// What the last flags-writing instruction computed.
///
/// Conditions are rebuilt from the producer when a conditional branch reads the
/// flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlagsProducer {
    /// `left - right` (cmp, sub)
    Compare {
        /// Minuend
        left: Expr,
        /// Subtrahend
        right: Expr,
    },
    /// `left & right` (test)
    Test {
        /// Left operand
        left: Expr,
        /// Right operand
        right: Expr,
    },
    /// Any other arithmetic or logic result
    Result {
        /// The computed value
        result: Expr,
    },
}

/// Symbolic content of the flags register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlagsCell {
    /// The computation that set the flags
    pub producer: FlagsProducer,
    /// Whether the computation depends on tainted data
    pub tainted: bool,
}

impl FlagsCell {
    /// The value the flags were computed from.
    #[must_use]
    pub fn value(&self) -> Expr {
        match &self.producer {
            FlagsProducer::Compare { left, right } => Expr::sub(left.clone(), right.clone()),
            FlagsProducer::Test { left, right } => Expr::binary(
                crate::engine::expr::BinaryOp::And,
                left.clone(),
                right.clone(),
            ),
            FlagsProducer::Result { result } => result.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AlignedCell {
    size: u8,
    cell: SymbolicCell,
}

/// Symbolic state of the traced process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolicState {
    registers: OrdMap<Register, SymbolicCell>,
    memory: OrdMap<u64, SymbolicCell>,
    aligned: OrdMap<u64, AlignedCell>,
    flags: Option<FlagsCell>,
    variables: Vector<SymbolicVariable>,
    unresolved: OrdSet<Location>,
    constraints: Vector<PathConstraint>,
    instructions: u64,
}

impl SymbolicState {
    /// Creates an empty, fully concrete state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The symbolic cell of a full-width register.
    #[must_use]
    pub fn register(&self, register: Register) -> Option<&SymbolicCell> {
        self.registers.get(&register)
    }

    /// The symbolic cell of one memory byte.
    #[must_use]
    pub fn memory_byte(&self, address: u64) -> Option<&SymbolicCell> {
        self.memory.get(&address)
    }

    /// A whole aligned cell, if one was stored at exactly `address` with `size`.
    #[must_use]
    pub fn aligned_cell(&self, address: u64, size: u8) -> Option<&SymbolicCell> {
        self.aligned
            .get(&address)
            .filter(|entry| entry.size == size)
            .map(|entry| &entry.cell)
    }

    /// The symbolic content of the flags.
    #[must_use]
    pub fn flags(&self) -> Option<&FlagsCell> {
        self.flags.as_ref()
    }

    /// Returns true if any part of `location` is symbolic.
    #[must_use]
    pub fn is_symbolic(&self, location: &Location) -> bool {
        match location {
            Location::Register(reg) => self.registers.contains_key(reg),
            Location::Memory { address, size } => self.bytes(*address, *size).next().is_some(),
            Location::Flags => self.flags.is_some(),
        }
    }

    /// Returns true if any part of `location` is tainted.
    #[must_use]
    pub fn is_tainted(&self, location: &Location) -> bool {
        match location {
            Location::Register(reg) => self.registers.get(reg).is_some_and(|c| c.tainted),
            Location::Memory { address, size } => {
                self.bytes(*address, *size).any(|(_, c)| c.tainted)
            }
            Location::Flags => self.flags.as_ref().is_some_and(|f| f.tainted),
        }
    }

    fn bytes(&self, address: u64, size: u8) -> impl Iterator<Item = (&u64, &SymbolicCell)> {
        let end = address.saturating_add(u64::from(size));
        self.memory.range(address..end)
    }

    /// Every location holding a symbolic value: registers, then memory bytes, then flags.
    #[must_use]
    pub fn symbolic_locations(&self) -> Vec<Location> {
        let mut locations: Vec<Location> =
            self.registers.keys().map(|r| Location::Register(*r)).collect();
        locations.extend(
            self.memory
                .keys()
                .map(|address| Location::Memory {
                    address: *address,
                    size: 1,
                }),
        );
        if self.flags.is_some() {
            locations.push(Location::Flags);
        }
        locations
    }

    /// Number of symbolic registers plus symbolic memory bytes.
    #[must_use]
    pub fn symbolic_cell_count(&self) -> usize {
        self.registers.len() + self.memory.len()
    }

    /// Symbolic variables in creation order.
    #[must_use]
    pub fn variables(&self) -> &Vector<SymbolicVariable> {
        &self.variables
    }

    /// Looks up a variable by identifier.
    #[must_use]
    pub fn variable(&self, id: VarId) -> Option<&SymbolicVariable> {
        self.variables.get(id.0 as usize)
    }

    /// The concrete value a variable had when it was created.
    #[must_use]
    pub fn model_value(&self, id: VarId) -> Option<u64> {
        self.variable(id).map(|v| v.value)
    }

    /// Path constraints in trace order.
    #[must_use]
    pub fn constraints(&self) -> &Vector<PathConstraint> {
        &self.constraints
    }

    /// Locations whose concrete value could not be obtained.
    #[must_use]
    pub fn unresolved(&self) -> &OrdSet<Location> {
        &self.unresolved
    }

    /// Returns true if `location` is marked unresolved.
    #[must_use]
    pub fn is_unresolved(&self, location: &Location) -> bool {
        self.unresolved.contains(location)
    }

    /// Number of instructions processed into this state.
    #[must_use]
    pub fn instruction_count(&self) -> u64 {
        self.instructions
    }

    pub(crate) fn set_register(&mut self, register: Register, cell: Option<SymbolicCell>) {
        match cell {
            Some(cell) => {
                self.registers.insert(register, cell);
            }
            None => {
                self.registers.remove(&register);
            }
        }
        self.unresolved.remove(&Location::Register(register));
    }

    /// Stores a `size`-byte value at `address`, or concretizes the range for `None`.
    ///
    /// The value is split into little-endian byte cells. If `aligned` is set and the
    /// access is naturally aligned, the whole cell is cached as well.
    pub(crate) fn set_memory(
        &mut self,
        address: u64,
        size: u8,
        cell: Option<SymbolicCell>,
        aligned: bool,
    ) {
        self.invalidate_aligned(address, size);
        match &cell {
            Some(cell) => {
                for i in 0..u64::from(size) {
                    let low = (i * 8) as u32;
                    let byte = SymbolicCell::new(
                        Expr::extract(low + 7, low, cell.expr.clone()),
                        cell.tainted,
                    );
                    self.memory.insert(address.wrapping_add(i), byte);
                }
                if aligned && size > 1 && address % u64::from(size) == 0 {
                    self.aligned.insert(
                        address,
                        AlignedCell {
                            size,
                            cell: cell.clone(),
                        },
                    );
                }
            }
            None => {
                for i in 0..u64::from(size) {
                    self.memory.remove(&address.wrapping_add(i));
                }
            }
        }
        self.clear_unresolved_memory(address, size);
    }

    fn invalidate_aligned(&mut self, address: u64, size: u8) {
        let start = address.saturating_sub(7);
        let end = address.saturating_add(u64::from(size));
        let overlapping: Vec<u64> = self
            .aligned
            .range(start..end)
            .filter(|(at, entry)| at.saturating_add(u64::from(entry.size)) > address)
            .map(|(at, _)| *at)
            .collect();
        for at in overlapping {
            self.aligned.remove(&at);
        }
    }

    fn clear_unresolved_memory(&mut self, address: u64, size: u8) {
        let end = address.saturating_add(u64::from(size));
        let covered: Vec<Location> = self
            .unresolved
            .iter()
            .filter(|location| match location {
                Location::Memory { address: at, size } => {
                    *at < end && at.saturating_add(u64::from(*size)) > address
                }
                _ => false,
            })
            .copied()
            .collect();
        for location in covered {
            self.unresolved.remove(&location);
        }
    }

    pub(crate) fn set_flags(&mut self, flags: Option<FlagsCell>) {
        self.flags = flags;
        self.unresolved.remove(&Location::Flags);
    }

    pub(crate) fn push_variable(
        &mut self,
        origin: Location,
        bits: u32,
        value: u64,
        tainted: bool,
    ) -> VarId {
        let id = VarId(self.variables.len() as u32);
        self.variables.push_back(SymbolicVariable {
            id,
            origin,
            bits,
            value,
            tainted,
        });
        id
    }

    pub(crate) fn push_constraint(&mut self, constraint: PathConstraint) {
        self.constraints.push_back(constraint);
    }

    pub(crate) fn mark_unresolved(&mut self, location: Location) {
        self.unresolved.insert(location);
    }

    pub(crate) fn count_instruction(&mut self) -> u64 {
        let index = self.instructions;
        self.instructions += 1;
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(n: u32, bits: u32) -> Expr {
        Expr::variable(VarId(n), bits)
    }

    #[test]
    fn test_memory_bytes_and_aligned_cache() {
        let mut state = SymbolicState::new();
        let x = var(0, 32);
        state.set_memory(0x1000, 4, Some(SymbolicCell::new(x.clone(), true)), true);

        assert_eq!(state.aligned_cell(0x1000, 4).map(|c| &c.expr), Some(&x));
        assert_eq!(
            state.memory_byte(0x1002).map(|c| c.expr.clone()),
            Some(Expr::extract(23, 16, x))
        );
        assert!(state.is_tainted(&Location::Memory {
            address: 0x1003,
            size: 1
        }));
        assert!(!state.is_symbolic(&Location::Memory {
            address: 0x1004,
            size: 4
        }));

        state.set_memory(0x1002, 1, None, true);
        assert!(state.aligned_cell(0x1000, 4).is_none());
        assert!(state.memory_byte(0x1002).is_none());
        assert!(state.memory_byte(0x1001).is_some());
    }

    #[test]
    fn test_unaligned_store_is_not_cached() {
        let mut state = SymbolicState::new();
        state.set_memory(0x1001, 4, Some(SymbolicCell::new(var(0, 32), false)), true);
        assert!(state.aligned_cell(0x1001, 4).is_none());
        assert_eq!(state.symbolic_cell_count(), 4);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut state = SymbolicState::new();
        state.set_register(Register::Rax, Some(SymbolicCell::new(var(0, 64), true)));
        let copy = state.clone();
        state.set_register(Register::Rax, None);
        assert!(copy.is_tainted(&Location::Register(Register::Rax)));
        assert!(!state.is_symbolic(&Location::Register(Register::Rax)));
    }

    #[test]
    fn test_unresolved_cleared_by_write() {
        let mut state = SymbolicState::new();
        let slot = Location::Memory {
            address: 0x2000,
            size: 8,
        };
        state.mark_unresolved(slot);
        state.mark_unresolved(Location::Register(Register::Rcx));
        state.set_memory(0x2004, 1, None, false);
        state.set_register(Register::Rcx, None);
        assert!(state.unresolved().is_empty());
    }

    #[test]
    fn test_variables_and_constraints() {
        let mut state = SymbolicState::new();
        let id = state.push_variable(Location::Register(Register::Eax), 32, 5, true);
        assert_eq!(id, VarId(0));
        assert_eq!(state.model_value(id), Some(5));

        let predicate = Expr::compare(
            crate::engine::expr::CompareOp::Slt,
            var(0, 32),
            Expr::constant(10, 32),
        );
        let constraint = PathConstraint {
            index: 3,
            pc: 0x1010,
            predicate: predicate.clone(),
            taken: false,
            tainted: true,
        };
        assert_eq!(constraint.assertion(), predicate.logical_not());
        state.push_constraint(constraint);
        assert_eq!(state.constraints().len(), 1);
        assert_eq!(state.count_instruction(), 0);
        assert_eq!(state.instruction_count(), 1);
    }
}
