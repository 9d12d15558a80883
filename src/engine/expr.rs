//! Bit-vector expressions.
//!
//! Expressions form a DAG of reference-counted nodes. Every node knows its width in
//! bits and whether a symbolic variable occurs anywhere below it, so both questions
//! are O(1). Constructors fold constants eagerly: combining two constants never
//! allocates a new operation node. The only other rewriting normalizes slices:
//! adjacent slices of the same expression concatenate back into one slice, and a
//! slice of a slice or of a zero extension is taken from the inner operand. A value
//! stored byte-by-byte therefore reads back as itself.
//!
//! The textual form follows SMT-LIB bit-vector syntax.

use std::{fmt, sync::Arc};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

use crate::instruction::mask;

/// Identifier of a symbolic variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub u32);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymVar_{}", self.0)
    }
}

/// Unary bit-vector operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum UnaryOp {
    /// Bitwise complement
    #[strum(serialize = "bvnot")]
    Not,
    /// Two's complement negation
    #[strum(serialize = "bvneg")]
    Neg,
}

/// Binary bit-vector operations. Both operands have the same width as the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum BinaryOp {
    /// Wrapping addition
    #[strum(serialize = "bvadd")]
    Add,
    /// Wrapping subtraction
    #[strum(serialize = "bvsub")]
    Sub,
    /// Wrapping multiplication (low half)
    #[strum(serialize = "bvmul")]
    Mul,
    /// Bitwise AND
    #[strum(serialize = "bvand")]
    And,
    /// Bitwise OR
    #[strum(serialize = "bvor")]
    Or,
    /// Bitwise XOR
    #[strum(serialize = "bvxor")]
    Xor,
    /// Logical shift left
    #[strum(serialize = "bvshl")]
    Shl,
    /// Logical shift right
    #[strum(serialize = "bvlshr")]
    Shr,
}

/// Comparison operations. The result is a 1-bit expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum CompareOp {
    /// Equal
    #[strum(serialize = "=")]
    Eq,
    /// Not equal
    #[strum(serialize = "distinct")]
    Ne,
    /// Unsigned less than
    #[strum(serialize = "bvult")]
    Ult,
    /// Unsigned less or equal
    #[strum(serialize = "bvule")]
    Ule,
    /// Unsigned greater than
    #[strum(serialize = "bvugt")]
    Ugt,
    /// Unsigned greater or equal
    #[strum(serialize = "bvuge")]
    Uge,
    /// Signed less than
    #[strum(serialize = "bvslt")]
    Slt,
    /// Signed less or equal
    #[strum(serialize = "bvsle")]
    Sle,
    /// Signed greater than
    #[strum(serialize = "bvsgt")]
    Sgt,
    /// Signed greater or equal
    #[strum(serialize = "bvsge")]
    Sge,
}

impl CompareOp {
    /// Returns the comparison that holds exactly when this one does not.
    #[must_use]
    pub fn negate(self) -> Self {
        match self {
            CompareOp::Eq => CompareOp::Ne,
            CompareOp::Ne => CompareOp::Eq,
            CompareOp::Ult => CompareOp::Uge,
            CompareOp::Uge => CompareOp::Ult,
            CompareOp::Ule => CompareOp::Ugt,
            CompareOp::Ugt => CompareOp::Ule,
            CompareOp::Slt => CompareOp::Sge,
            CompareOp::Sge => CompareOp::Slt,
            CompareOp::Sle => CompareOp::Sgt,
            CompareOp::Sgt => CompareOp::Sle,
        }
    }

    fn apply(self, left: u64, right: u64, bits: u32) -> bool {
        let (sl, sr) = (sign_extend(left, bits), sign_extend(right, bits));
        match self {
            CompareOp::Eq => left == right,
            CompareOp::Ne => left != right,
            CompareOp::Ult => left < right,
            CompareOp::Ule => left <= right,
            CompareOp::Ugt => left > right,
            CompareOp::Uge => left >= right,
            CompareOp::Slt => sl < sr,
            CompareOp::Sle => sl <= sr,
            CompareOp::Sgt => sl > sr,
            CompareOp::Sge => sl >= sr,
        }
    }
}

/// Operation at one node of an expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExprKind {
    /// Constant, already masked to the node width.
    Const(u64),
    /// Symbolic variable.
    Var(VarId),
    /// Unary operation.
    Unary(UnaryOp, Expr),
    /// Binary operation.
    Binary(BinaryOp, Expr, Expr),
    /// Comparison producing a 1-bit result.
    Compare(CompareOp, Expr, Expr),
    /// Bits `high..=low` of the operand.
    Extract {
        /// Highest bit, inclusive
        high: u32,
        /// Lowest bit, inclusive
        low: u32,
        /// Sliced expression
        operand: Expr,
    },
    /// `high` in the upper bits, `low` in the lower bits.
    Concat(Expr, Expr),
    /// Operand zero-extended to the node width.
    ZeroExtend(Expr),
    /// Operand sign-extended to the node width.
    SignExtend(Expr),
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct Node {
    kind: ExprKind,
    bits: u32,
    symbolic: bool,
}

/// A shared, immutable bit-vector expression.
///
/// Cloning is a reference count increment. Equality and hashing are structural.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Expr(Arc<Node>);

impl Expr {
    fn node(kind: ExprKind, bits: u32) -> Self {
        let symbolic = match &kind {
            ExprKind::Const(_) => false,
            ExprKind::Var(_) => true,
            ExprKind::Unary(_, e) | ExprKind::ZeroExtend(e) | ExprKind::SignExtend(e) => {
                e.is_symbolic()
            }
            ExprKind::Extract { operand, .. } => operand.is_symbolic(),
            ExprKind::Binary(_, l, r) | ExprKind::Compare(_, l, r) | ExprKind::Concat(l, r) => {
                l.is_symbolic() || r.is_symbolic()
            }
        };
        Expr(Arc::new(Node {
            kind,
            bits,
            symbolic,
        }))
    }

    /// A constant of `bits` width. The value is truncated to the width.
    #[must_use]
    pub fn constant(value: u64, bits: u32) -> Self {
        Self::node(ExprKind::Const(value & mask(bits)), bits)
    }

    /// A 1-bit constant.
    #[must_use]
    pub fn boolean(value: bool) -> Self {
        Self::constant(u64::from(value), 1)
    }

    /// A symbolic variable of `bits` width.
    #[must_use]
    pub fn variable(id: VarId, bits: u32) -> Self {
        Self::node(ExprKind::Var(id), bits)
    }

    /// Applies a unary operation.
    #[must_use]
    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        let bits = operand.bits();
        if let Some(value) = operand.as_constant() {
            let folded = match op {
                UnaryOp::Not => !value,
                UnaryOp::Neg => value.wrapping_neg(),
            };
            return Self::constant(folded, bits);
        }
        Self::node(ExprKind::Unary(op, operand), bits)
    }

    /// Applies a binary operation. Operands must have equal widths.
    #[must_use]
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        debug_assert_eq!(left.bits(), right.bits(), "{op} operand widths differ");
        let bits = left.bits();
        if let (Some(l), Some(r)) = (left.as_constant(), right.as_constant()) {
            return Self::constant(apply_binary(op, l, r, bits), bits);
        }
        Self::node(ExprKind::Binary(op, left, right), bits)
    }

    /// Compares two expressions of equal width.
    #[must_use]
    pub fn compare(op: CompareOp, left: Expr, right: Expr) -> Self {
        debug_assert_eq!(left.bits(), right.bits(), "{op} operand widths differ");
        if let (Some(l), Some(r)) = (left.as_constant(), right.as_constant()) {
            return Self::boolean(op.apply(l, r, left.bits()));
        }
        Self::node(ExprKind::Compare(op, left, right), 1)
    }

    /// Extracts bits `high..=low` of `operand`.
    #[must_use]
    pub fn extract(high: u32, low: u32, operand: Expr) -> Self {
        debug_assert!(high >= low && high < operand.bits(), "invalid extract");
        let bits = high - low + 1;
        if low == 0 && bits == operand.bits() {
            return operand;
        }
        if let Some(value) = operand.as_constant() {
            return Self::constant(value >> low, bits);
        }
        match operand.kind() {
            ExprKind::Extract {
                low: inner_low,
                operand: inner,
                ..
            } => return Self::extract(high + inner_low, low + inner_low, inner.clone()),
            ExprKind::ZeroExtend(inner) | ExprKind::SignExtend(inner) if high < inner.bits() => {
                return Self::extract(high, low, inner.clone());
            }
            _ => {}
        }
        Self::node(ExprKind::Extract { high, low, operand }, bits)
    }

    /// Concatenates `high` above `low`.
    #[must_use]
    pub fn concat(high: Expr, low: Expr) -> Self {
        let bits = high.bits() + low.bits();
        debug_assert!(bits <= 64, "concat wider than 64 bits");
        if let (Some(h), Some(l)) = (high.as_constant(), low.as_constant()) {
            return Self::constant((h << low.bits()) | l, bits);
        }
        if let (
            ExprKind::Extract {
                low: high_low,
                high: high_high,
                operand: a,
            },
            ExprKind::Extract {
                high: low_high,
                low: low_low,
                operand: b,
            },
        ) = (high.kind(), low.kind())
        {
            if a == b && *high_low == low_high + 1 {
                return Self::extract(*high_high, *low_low, a.clone());
            }
        }
        Self::node(ExprKind::Concat(high, low), bits)
    }

    /// Zero-extends `operand` to `bits`.
    #[must_use]
    pub fn zero_extend(bits: u32, operand: Expr) -> Self {
        debug_assert!(bits >= operand.bits(), "zero extension narrows");
        if bits == operand.bits() {
            return operand;
        }
        if let Some(value) = operand.as_constant() {
            return Self::constant(value, bits);
        }
        Self::node(ExprKind::ZeroExtend(operand), bits)
    }

    /// Sign-extends `operand` to `bits`.
    #[must_use]
    pub fn sign_extend(bits: u32, operand: Expr) -> Self {
        debug_assert!(bits >= operand.bits(), "sign extension narrows");
        if bits == operand.bits() {
            return operand;
        }
        if let Some(value) = operand.as_constant() {
            return Self::constant(sign_extend(value, operand.bits()) as u64, bits);
        }
        Self::node(ExprKind::SignExtend(operand), bits)
    }

    /// `left + right`
    #[must_use]
    pub fn add(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Add, left, right)
    }

    /// `left - right`
    #[must_use]
    pub fn sub(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Sub, left, right)
    }

    /// Returns the boolean negation of a 1-bit expression.
    ///
    /// Comparisons are negated by flipping their operator.
    #[must_use]
    pub fn logical_not(&self) -> Self {
        match self.kind() {
            ExprKind::Compare(op, l, r) => Self::compare(op.negate(), l.clone(), r.clone()),
            _ => Self::unary(UnaryOp::Not, self.clone()),
        }
    }

    /// Width in bits.
    #[must_use]
    pub fn bits(&self) -> u32 {
        self.0.bits
    }

    /// The operation at the root of this expression.
    #[must_use]
    pub fn kind(&self) -> &ExprKind {
        &self.0.kind
    }

    /// Returns true if a symbolic variable occurs in this expression.
    #[must_use]
    pub fn is_symbolic(&self) -> bool {
        self.0.symbolic
    }

    /// The value of a constant expression.
    #[must_use]
    pub fn as_constant(&self) -> Option<u64> {
        match self.kind() {
            ExprKind::Const(value) => Some(*value),
            _ => None,
        }
    }

    /// Every variable occurring in this expression, in ascending order.
    #[must_use]
    pub fn variables(&self) -> Vec<VarId> {
        let mut seen = FxHashSet::default();
        let mut vars = FxHashSet::default();
        let mut stack = vec![self];
        while let Some(expr) = stack.pop() {
            if !expr.is_symbolic() || !seen.insert(Arc::as_ptr(&expr.0)) {
                continue;
            }
            match expr.kind() {
                ExprKind::Const(_) => {}
                ExprKind::Var(id) => {
                    vars.insert(*id);
                }
                ExprKind::Unary(_, e) | ExprKind::ZeroExtend(e) | ExprKind::SignExtend(e) => {
                    stack.push(e);
                }
                ExprKind::Extract { operand, .. } => stack.push(operand),
                ExprKind::Binary(_, l, r)
                | ExprKind::Compare(_, l, r)
                | ExprKind::Concat(l, r) => {
                    stack.push(l);
                    stack.push(r);
                }
            }
        }
        let mut vars: Vec<VarId> = vars.into_iter().collect();
        vars.sort_unstable();
        vars
    }

    /// Evaluates the expression under a variable assignment.
    ///
    /// Returns `None` if `model` has no value for a variable that occurs in the
    /// expression. Shared subexpressions are evaluated once.
    pub fn evaluate<F>(&self, model: F) -> Option<u64>
    where
        F: Fn(VarId) -> Option<u64>,
    {
        let mut cache = FxHashMap::default();
        self.evaluate_cached(&model, &mut cache)
    }

    fn evaluate_cached<F>(&self, model: &F, cache: &mut FxHashMap<*const Node, u64>) -> Option<u64>
    where
        F: Fn(VarId) -> Option<u64>,
    {
        let key = Arc::as_ptr(&self.0);
        if let Some(value) = cache.get(&key) {
            return Some(*value);
        }
        let bits = self.bits();
        let value = match self.kind() {
            ExprKind::Const(value) => *value,
            ExprKind::Var(id) => model(*id)? & mask(bits),
            ExprKind::Unary(op, e) => {
                let v = e.evaluate_cached(model, cache)?;
                match op {
                    UnaryOp::Not => !v,
                    UnaryOp::Neg => v.wrapping_neg(),
                }
            }
            ExprKind::Binary(op, l, r) => {
                let l = l.evaluate_cached(model, cache)?;
                let r = r.evaluate_cached(model, cache)?;
                apply_binary(*op, l, r, bits)
            }
            ExprKind::Compare(op, l, r) => {
                let width = l.bits();
                let l = l.evaluate_cached(model, cache)?;
                let r = r.evaluate_cached(model, cache)?;
                u64::from(op.apply(l, r, width))
            }
            ExprKind::Extract { low, operand, .. } => operand.evaluate_cached(model, cache)? >> low,
            ExprKind::Concat(h, l) => {
                let shift = l.bits();
                let hv = h.evaluate_cached(model, cache)?;
                let lv = l.evaluate_cached(model, cache)?;
                (hv << shift) | lv
            }
            ExprKind::ZeroExtend(e) => e.evaluate_cached(model, cache)?,
            ExprKind::SignExtend(e) => {
                sign_extend(e.evaluate_cached(model, cache)?, e.bits()) as u64
            }
        } & mask(bits);
        cache.insert(key, value);
        Some(value)
    }
}

fn apply_binary(op: BinaryOp, left: u64, right: u64, bits: u32) -> u64 {
    let result = match op {
        BinaryOp::Add => left.wrapping_add(right),
        BinaryOp::Sub => left.wrapping_sub(right),
        BinaryOp::Mul => left.wrapping_mul(right),
        BinaryOp::And => left & right,
        BinaryOp::Or => left | right,
        BinaryOp::Xor => left ^ right,
        BinaryOp::Shl => {
            if right >= u64::from(bits) {
                0
            } else {
                left << right
            }
        }
        BinaryOp::Shr => {
            if right >= u64::from(bits) {
                0
            } else {
                left >> right
            }
        }
    };
    result & mask(bits)
}

/// Interprets the low `bits` of `value` as a two's complement number.
#[must_use]
pub fn sign_extend(value: u64, bits: u32) -> i64 {
    if bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ExprKind::Const(value) => write!(f, "(_ bv{value} {})", self.bits()),
            ExprKind::Var(id) => write!(f, "{id}"),
            ExprKind::Unary(op, e) => write!(f, "({op} {e})"),
            ExprKind::Binary(op, l, r) => write!(f, "({op} {l} {r})"),
            ExprKind::Compare(op, l, r) => write!(f, "({op} {l} {r})"),
            ExprKind::Extract { high, low, operand } => {
                write!(f, "((_ extract {high} {low}) {operand})")
            }
            ExprKind::Concat(h, l) => write!(f, "(concat {h} {l})"),
            ExprKind::ZeroExtend(e) => {
                write!(f, "((_ zero_extend {}) {e})", self.bits() - e.bits())
            }
            ExprKind::SignExtend(e) => {
                write!(f, "((_ sign_extend {}) {e})", self.bits() - e.bits())
            }
        }
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Expr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
