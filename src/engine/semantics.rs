//! Symbolic semantics of the supported instruction set.
//!
//! A [`Transaction`] evaluates one [`InstructionEvent`] against an immutable view of
//! the current [`SymbolicState`], pulling concrete values through the bridge
//! whenever a read is not symbolic. Results are staged, never written, so an error
//! anywhere leaves the state untouched. The adapter commits the staged writes once
//! the whole instruction evaluated successfully.
//!
//! Values are carried as [`SymbolicCell`]s: concrete values are constant
//! expressions with no taint. Any staged value whose expression is constant is
//! stored as "concrete", i.e. removes the symbolic cell.

use crate::{
    bridge::ConcreteStateSource,
    engine::{
        expr::{BinaryOp, CompareOp, Expr, UnaryOp},
        state::{FlagsCell, FlagsProducer, SymbolicCell, SymbolicState},
        Architecture, BranchEvaluation,
    },
    instruction::{Condition, Instruction, InstructionEvent, Location, Memory, Operand, Register},
    Error, Result,
};

/// Writes produced by one instruction, in program order.
#[derive(Debug, Default)]
pub(super) struct Staged {
    pub registers: Vec<(Register, Option<SymbolicCell>)>,
    pub memory: Vec<(u64, u8, Option<SymbolicCell>)>,
    pub flags: Option<Option<FlagsCell>>,
    pub branch: Option<BranchEvaluation>,
}

pub(super) struct Transaction<'a> {
    arch: Architecture,
    aligned: bool,
    state: &'a SymbolicState,
    source: &'a dyn ConcreteStateSource,
    event: &'a InstructionEvent,
    staged: Staged,
}

impl<'a> Transaction<'a> {
    pub(super) fn new(
        arch: Architecture,
        aligned: bool,
        state: &'a SymbolicState,
        source: &'a dyn ConcreteStateSource,
        event: &'a InstructionEvent,
    ) -> Self {
        Self {
            arch,
            aligned,
            state,
            source,
            event,
            staged: Staged::default(),
        }
    }

    /// Evaluates the instruction and returns its staged writes.
    pub(super) fn execute(mut self) -> Result<Staged> {
        let event = self.event;
        match event.instruction() {
            Instruction::Mov { dst, src } => {
                let value = self.read(src, operand_bits(dst)?)?;
                self.write(dst, value)?;
            }
            Instruction::MovZx { dst, src } => self.extend(dst, src, Expr::zero_extend)?,
            Instruction::MovSx { dst, src } => self.extend(dst, src, Expr::sign_extend)?,
            Instruction::Lea { dst, src } => self.lea(*dst, src)?,
            Instruction::Add { dst, src } => self.arithmetic(BinaryOp::Add, dst, src)?,
            Instruction::Sub { dst, src } => self.arithmetic(BinaryOp::Sub, dst, src)?,
            Instruction::Mul { dst, src } => self.arithmetic(BinaryOp::Mul, dst, src)?,
            Instruction::And { dst, src } => self.arithmetic(BinaryOp::And, dst, src)?,
            Instruction::Or { dst, src } => self.arithmetic(BinaryOp::Or, dst, src)?,
            Instruction::Xor { dst, src } => self.arithmetic(BinaryOp::Xor, dst, src)?,
            Instruction::Shl { dst, count } => self.shift(BinaryOp::Shl, dst, count)?,
            Instruction::Shr { dst, count } => self.shift(BinaryOp::Shr, dst, count)?,
            Instruction::Not { dst } => {
                let value = self.read(dst, operand_bits(dst)?)?;
                let result = SymbolicCell::new(Expr::unary(UnaryOp::Not, value.expr), value.tainted);
                self.write(dst, result)?;
            }
            Instruction::Neg { dst } => {
                let value = self.read(dst, operand_bits(dst)?)?;
                let bits = value.expr.bits();
                let result =
                    SymbolicCell::new(Expr::unary(UnaryOp::Neg, value.expr.clone()), value.tainted);
                self.write(dst, result)?;
                self.set_flags(
                    FlagsProducer::Compare {
                        left: Expr::constant(0, bits),
                        right: value.expr,
                    },
                    value.tainted,
                );
            }
            Instruction::Inc { dst } => self.step(BinaryOp::Add, dst)?,
            Instruction::Dec { dst } => self.step(BinaryOp::Sub, dst)?,
            Instruction::Cmp { left, right } => {
                let (left, right) = self.operands(left, right)?;
                let tainted = left.tainted || right.tainted;
                self.set_flags(
                    FlagsProducer::Compare {
                        left: left.expr,
                        right: right.expr,
                    },
                    tainted,
                );
            }
            Instruction::Test { left, right } => {
                let (left, right) = self.operands(left, right)?;
                let tainted = left.tainted || right.tainted;
                self.set_flags(
                    FlagsProducer::Test {
                        left: left.expr,
                        right: right.expr,
                    },
                    tainted,
                );
            }
            Instruction::Push { src } => {
                let width = self.arch.pointer_size();
                let value = self.read(src, u32::from(width) * 8)?;
                let value = SymbolicCell::new(fit(value.expr, u32::from(width) * 8), value.tainted);
                let slot = self.stack_slot()?;
                self.stage_memory(slot, width, value);
                self.adjust_stack(-i64::from(width));
            }
            Instruction::Pop { dst } => {
                let width = dst.size().unwrap_or(self.arch.pointer_size());
                let slot = self.stack_slot()?;
                let value = self.memory(slot, width)?;
                self.write(dst, value)?;
                if !dst.as_register().is_some_and(|r| r.is_stack_pointer()) {
                    self.adjust_stack(i64::from(width));
                }
            }
            Instruction::Call { .. } => {
                let width = self.arch.pointer_size();
                let slot = self.stack_slot()?;
                let return_address = Expr::constant(event.fallthrough(), u32::from(width) * 8);
                self.stage_memory(slot, width, SymbolicCell::new(return_address, false));
                self.adjust_stack(-i64::from(width));
            }
            Instruction::Ret => self.adjust_stack(i64::from(self.arch.pointer_size())),
            Instruction::Jcc { condition, target } => self.branch(*condition, *target),
            Instruction::Jmp { .. } | Instruction::Nop => {}
            Instruction::Unsupported {
                mnemonic, writes, ..
            } => {
                log::debug!(
                    "{:#x}: concretizing {} write(s) of unsupported {mnemonic}",
                    event.pc(),
                    writes.len()
                );
                for op in writes {
                    self.concretize(op)?;
                }
                self.staged.flags = Some(None);
            }
        }
        Ok(self.staged)
    }

    fn full(&self, register: Register) -> Result<Register> {
        register
            .full(self.arch)
            .ok_or_else(|| Error::InaccessibleState {
                location: Location::Register(register),
                reason: format!("{register} does not exist on {}", self.arch),
            })
    }

    fn register(&self, register: Register) -> Result<SymbolicCell> {
        let full = self.full(register)?;
        match self.state.register(full) {
            Some(cell) => {
                let low = register.bit_offset();
                let high = low + register.bits() - 1;
                Ok(SymbolicCell::new(
                    Expr::extract(high, low, cell.expr.clone()),
                    cell.tainted,
                ))
            }
            None => {
                let value = self.source.read_concrete_register(register)?;
                Ok(SymbolicCell::new(Expr::constant(value, register.bits()), false))
            }
        }
    }

    fn memory(&self, address: u64, size: u8) -> Result<SymbolicCell> {
        if self.aligned {
            if let Some(cell) = self.state.aligned_cell(address, size) {
                return Ok(cell.clone());
            }
        }
        let bytes: Vec<Option<&SymbolicCell>> = (0..u64::from(size))
            .map(|i| self.state.memory_byte(address.wrapping_add(i)))
            .collect();
        let concrete = if bytes.iter().all(Option::is_some) {
            Vec::new()
        } else {
            self.source
                .read_concrete_memory(address, usize::from(size))?
        };
        if bytes.iter().all(Option::is_none) {
            let value = little_endian(&concrete);
            return Ok(SymbolicCell::new(
                Expr::constant(value, u32::from(size) * 8),
                false,
            ));
        }

        let mut tainted = false;
        let mut value: Option<Expr> = None;
        for (i, byte) in bytes.iter().enumerate().rev() {
            let byte = match byte {
                Some(cell) => {
                    tainted |= cell.tainted;
                    cell.expr.clone()
                }
                None => Expr::constant(u64::from(concrete[i]), 8),
            };
            value = Some(match value {
                Some(high) => Expr::concat(high, byte),
                None => byte,
            });
        }
        let expr = value.unwrap_or_else(|| Expr::constant(0, u32::from(size) * 8));
        Ok(SymbolicCell::new(expr, tainted))
    }

    fn address(&self, memory: &Memory) -> Result<u64> {
        match self.event.address_of(memory) {
            Some(address) => Ok(address),
            None => memory.effective_address(self.arch, self.source),
        }
    }

    fn read(&self, operand: &Operand, bits: u32) -> Result<SymbolicCell> {
        match operand {
            Operand::Register(reg) => self.register(*reg),
            Operand::Immediate(value) => Ok(SymbolicCell::new(
                Expr::constant(*value as u64, bits),
                false,
            )),
            Operand::Memory(mem) => self.memory(self.address(mem)?, mem.size),
        }
    }

    /// Moves `src` into the wider `dst` through `extend`.
    fn extend(
        &mut self,
        dst: &Operand,
        src: &Operand,
        extend: fn(u32, Expr) -> Expr,
    ) -> Result<()> {
        let bits = operand_bits(dst)?;
        let value = self.read(src, operand_bits(src)?)?;
        let expr = if value.expr.bits() < bits {
            extend(bits, value.expr)
        } else {
            fit(value.expr, bits)
        };
        self.write(dst, SymbolicCell::new(expr, value.tainted))
    }

    /// Reads two operands, fitting the second to the width of the first.
    fn operands(&self, left: &Operand, right: &Operand) -> Result<(SymbolicCell, SymbolicCell)> {
        let left = self.read(left, operand_bits(left)?)?;
        let bits = left.expr.bits();
        let right = self.read(right, bits)?;
        Ok((left, SymbolicCell::new(fit(right.expr, bits), right.tainted)))
    }

    fn write(&mut self, operand: &Operand, value: SymbolicCell) -> Result<()> {
        match operand {
            Operand::Register(reg) => self.write_register(*reg, value),
            Operand::Memory(mem) => {
                let address = self.address(mem)?;
                self.stage_memory(address, mem.size, value);
                Ok(())
            }
            Operand::Immediate(_) => Err(Error::InvalidState(format!(
                "{:#x}: immediate used as destination",
                self.event.pc()
            ))),
        }
    }

    fn write_register(&mut self, register: Register, value: SymbolicCell) -> Result<()> {
        let full = self.full(register)?;
        let cell = compose_register(self.arch, self.state, self.source, register, full, value)?;
        self.staged.registers.push((full, cell));
        Ok(())
    }

    fn stage_memory(&mut self, address: u64, size: u8, value: SymbolicCell) {
        let cell = value.expr.is_symbolic().then_some(value);
        self.staged.memory.push((address, size, cell));
    }

    fn set_flags(&mut self, producer: FlagsProducer, tainted: bool) {
        let symbolic = match &producer {
            FlagsProducer::Compare { left, right } | FlagsProducer::Test { left, right } => {
                left.is_symbolic() || right.is_symbolic()
            }
            FlagsProducer::Result { result } => result.is_symbolic(),
        };
        self.staged.flags = Some(symbolic.then_some(FlagsCell {
            producer,
            tainted: tainted && symbolic,
        }));
    }

    fn concretize(&mut self, operand: &Operand) -> Result<()> {
        match operand {
            Operand::Register(reg) => {
                if let Some(full) = reg.full(self.arch) {
                    self.staged.registers.push((full, None));
                }
            }
            Operand::Memory(mem) => {
                let address = self.address(mem)?;
                self.staged.memory.push((address, mem.size, None));
            }
            Operand::Immediate(_) => {}
        }
        Ok(())
    }

    fn arithmetic(&mut self, op: BinaryOp, dst: &Operand, src: &Operand) -> Result<()> {
        let (left, right) = self.operands(dst, src)?;
        let bits = left.expr.bits();
        let self_cancelling = matches!(op, BinaryOp::Xor | BinaryOp::Sub)
            && matches!((dst, src), (Operand::Register(a), Operand::Register(b)) if a == b);

        let result = if self_cancelling {
            SymbolicCell::new(Expr::constant(0, bits), false)
        } else {
            SymbolicCell::new(
                Expr::binary(op, left.expr.clone(), right.expr.clone()),
                left.tainted || right.tainted,
            )
        };
        self.write(dst, result.clone())?;

        if op == BinaryOp::Sub && !self_cancelling {
            let tainted = left.tainted || right.tainted;
            self.set_flags(
                FlagsProducer::Compare {
                    left: left.expr,
                    right: right.expr,
                },
                tainted,
            );
        } else {
            self.set_flags(
                FlagsProducer::Result {
                    result: result.expr,
                },
                result.tainted,
            );
        }
        Ok(())
    }

    fn shift(&mut self, op: BinaryOp, dst: &Operand, count: &Operand) -> Result<()> {
        let (value, count) = self.operands(dst, count)?;
        let bits = value.expr.bits();
        let count_mask = if bits == 64 { 0x3f } else { 0x1f };
        if count.expr.as_constant().is_some_and(|c| (c & count_mask) == 0) {
            return Ok(());
        }
        let count_expr = Expr::binary(
            BinaryOp::And,
            count.expr,
            Expr::constant(count_mask, bits),
        );
        let result = SymbolicCell::new(
            Expr::binary(op, value.expr, count_expr),
            value.tainted || count.tainted,
        );
        self.write(dst, result.clone())?;
        self.set_flags(
            FlagsProducer::Result {
                result: result.expr,
            },
            result.tainted,
        );
        Ok(())
    }

    fn step(&mut self, op: BinaryOp, dst: &Operand) -> Result<()> {
        let value = self.read(dst, operand_bits(dst)?)?;
        let bits = value.expr.bits();
        let result = SymbolicCell::new(
            Expr::binary(op, value.expr, Expr::constant(1, bits)),
            value.tainted,
        );
        self.write(dst, result.clone())?;
        self.set_flags(
            FlagsProducer::Result {
                result: result.expr,
            },
            result.tainted,
        );
        Ok(())
    }

    fn lea(&mut self, dst: Register, src: &Memory) -> Result<()> {
        let bits = u32::from(self.arch.pointer_size()) * 8;
        let mut tainted = false;
        let mut address = Expr::constant(src.displacement as u64, bits);
        if let Some(base) = src.base {
            let base = self.register(base)?;
            tainted |= base.tainted;
            address = Expr::add(fit(base.expr, bits), address);
        }
        if let Some(index) = src.index {
            let index = self.register(index)?;
            tainted |= index.tainted;
            let scaled = Expr::binary(
                BinaryOp::Mul,
                fit(index.expr, bits),
                Expr::constant(u64::from(src.scale), bits),
            );
            address = Expr::add(address, scaled);
        }
        let value = SymbolicCell::new(fit(address, dst.bits()), tainted);
        self.write_register(dst, value)
    }

    fn stack_slot(&self) -> Result<u64> {
        self.event.stack_slot().ok_or_else(|| {
            Error::InvalidState(format!(
                "{:#x}: stack operation without a resolved stack slot",
                self.event.pc()
            ))
        })
    }

    fn adjust_stack(&mut self, delta: i64) {
        let sp = self.arch.stack_pointer();
        let cell = self.state.register(sp).map(|cell| {
            let bits = cell.expr.bits();
            SymbolicCell::new(
                Expr::add(cell.expr.clone(), Expr::constant(delta as u64, bits)),
                cell.tainted,
            )
        });
        self.staged.registers.push((sp, cell));
    }

    fn branch(&mut self, condition: Condition, target: u64) {
        let (predicate, tainted) = match self.state.flags() {
            Some(flags) => (condition_predicate(condition, &flags.producer), flags.tainted),
            None => (None, false),
        };
        let observed = self.event.next_pc().map(|next| next == target);
        let state = self.state;
        let taken = observed
            .or_else(|| {
                predicate
                    .as_ref()
                    .and_then(|p| p.evaluate(|id| state.model_value(id)))
                    .map(|value| value != 0)
            })
            .or_else(|| tainted.then(|| self.concrete_outcome(condition)).flatten());
        self.staged.branch = Some(BranchEvaluation {
            pc: self.event.pc(),
            condition,
            predicate,
            tainted,
            target,
            fallthrough: self.event.fallthrough(),
            taken,
        });
    }

    /// Decides `condition` from the flags register of the suspended process.
    ///
    /// The process is stopped before the jump executes, so its flags are the ones
    /// the jump will test.
    fn concrete_outcome(&self, condition: Condition) -> Option<bool> {
        let register = self.arch.flags_register();
        match self.source.read_concrete_register(register) {
            Ok(flags) => Some(condition.holds(flags)),
            Err(e) => {
                log::debug!(
                    "{:#x}: cannot decide {condition} from {register}: {e}",
                    self.event.pc()
                );
                None
            }
        }
    }
}

/// Builds the new full-register cell after writing `value` into `register`.
///
/// Returns `None` if the resulting full register is concrete.
pub(super) fn compose_register(
    arch: Architecture,
    state: &SymbolicState,
    source: &dyn ConcreteStateSource,
    register: Register,
    full: Register,
    value: SymbolicCell,
) -> Result<Option<SymbolicCell>> {
    let current = state.register(full);
    let cell = if register == full {
        value
    } else if register.size() == 4 && arch == Architecture::X86_64 {
        SymbolicCell::new(Expr::zero_extend(64, value.expr), value.tainted)
    } else if !value.expr.is_symbolic() && current.is_none() {
        return Ok(None);
    } else {
        let (current, current_tainted) = match current {
            Some(cell) => (cell.expr.clone(), cell.tainted),
            None => (
                Expr::constant(source.read_concrete_register(full)?, full.bits()),
                false,
            ),
        };
        let low = register.bit_offset();
        let high = low + register.bits();
        let mut expr = value.expr;
        if low > 0 {
            expr = Expr::concat(expr, Expr::extract(low - 1, 0, current.clone()));
        }
        if high < full.bits() {
            expr = Expr::concat(Expr::extract(full.bits() - 1, high, current), expr);
        }
        SymbolicCell::new(expr, value.tainted || current_tainted)
    };
    Ok(cell.expr.is_symbolic().then_some(cell))
}

/// The 1-bit predicate under which a conditional jump is taken.
///
/// Returns `None` for conditions the flags producer cannot express (overflow and
/// parity, or signed and unsigned orderings after a plain arithmetic result).
#[must_use]
pub fn condition_predicate(condition: Condition, producer: &FlagsProducer) -> Option<Expr> {
    match producer {
        FlagsProducer::Compare { left, right } => {
            let (l, r) = (left.clone(), right.clone());
            let op = match condition {
                Condition::E => CompareOp::Eq,
                Condition::Ne => CompareOp::Ne,
                Condition::L => CompareOp::Slt,
                Condition::Ge => CompareOp::Sge,
                Condition::Le => CompareOp::Sle,
                Condition::G => CompareOp::Sgt,
                Condition::B => CompareOp::Ult,
                Condition::Ae => CompareOp::Uge,
                Condition::Be => CompareOp::Ule,
                Condition::A => CompareOp::Ugt,
                Condition::S | Condition::Ns => {
                    let difference = Expr::sub(l, r);
                    return Some(sign_test(condition, difference));
                }
                Condition::O | Condition::No | Condition::P | Condition::Np => return None,
            };
            Some(Expr::compare(op, l, r))
        }
        FlagsProducer::Test { left, right } => {
            let masked = Expr::binary(BinaryOp::And, left.clone(), right.clone());
            let zero = Expr::constant(0, masked.bits());
            match condition {
                Condition::E | Condition::Be => Some(Expr::compare(CompareOp::Eq, masked, zero)),
                Condition::Ne | Condition::A => Some(Expr::compare(CompareOp::Ne, masked, zero)),
                Condition::S | Condition::L => Some(Expr::compare(CompareOp::Slt, masked, zero)),
                Condition::Ns | Condition::Ge => Some(Expr::compare(CompareOp::Sge, masked, zero)),
                Condition::Le => Some(Expr::compare(CompareOp::Sle, masked, zero)),
                Condition::G => Some(Expr::compare(CompareOp::Sgt, masked, zero)),
                Condition::B => Some(Expr::boolean(false)),
                Condition::Ae => Some(Expr::boolean(true)),
                Condition::O | Condition::No | Condition::P | Condition::Np => None,
            }
        }
        FlagsProducer::Result { result } => {
            let zero = Expr::constant(0, result.bits());
            match condition {
                Condition::E => Some(Expr::compare(CompareOp::Eq, result.clone(), zero)),
                Condition::Ne => Some(Expr::compare(CompareOp::Ne, result.clone(), zero)),
                Condition::S | Condition::Ns => Some(sign_test(condition, result.clone())),
                _ => None,
            }
        }
    }
}

fn sign_test(condition: Condition, value: Expr) -> Expr {
    let zero = Expr::constant(0, value.bits());
    let op = if condition == Condition::S {
        CompareOp::Slt
    } else {
        CompareOp::Sge
    };
    Expr::compare(op, value, zero)
}

fn operand_bits(operand: &Operand) -> Result<u32> {
    operand
        .size()
        .map(|size| u32::from(size) * 8)
        .ok_or_else(|| Error::InvalidState("immediate operand has no width".to_string()))
}

/// Truncates or zero-extends `expr` to `bits`.
fn fit(expr: Expr, bits: u32) -> Expr {
    match expr.bits() {
        width if width == bits => expr,
        width if width > bits => Expr::extract(bits - 1, 0, expr),
        _ => Expr::zero_extend(bits, expr),
    }
}

pub(super) fn little_endian(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | (u64::from(*b) << (i * 8)))
}
