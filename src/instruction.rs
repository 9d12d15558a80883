//! Decoded instruction model and traced instruction events.
//!
//! This module provides the simplified x86/x64 instruction types the engine
//! understands, together with [`InstructionEvent`], the immutable record of one
//! traced instruction that flows from the trace hook through the coordinator.
//!
//! # Overview
//!
//! The type hierarchy is:
//!
//! - [`Register`] - General-purpose registers (8/16/32/64-bit) and the instruction pointer
//! - [`Memory`] - Memory operands with base, index, scale, displacement
//! - [`Operand`] - Union of register, immediate, or memory operand
//! - [`Instruction`] - Decoded operation with operands
//! - [`Location`] - A storage location the symbolic state can track
//! - [`InstructionEvent`] - One traced instruction with its resolved accesses
//!
//! # Locations
//!
//! Registers are always tracked at full width for the active architecture: a write
//! to `al` updates the `rax` cell on x86-64 and the `eax` cell on x86. Memory is
//! addressed by concrete byte address; effective addresses are resolved through the
//! [`ConcreteStateSource`] when the event is built.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{bridge::ConcreteStateSource, engine::Architecture, Result};

/// x86/x64 general-purpose register.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Register {
    /// 32-bit accumulator register (EAX)
    Eax,
    /// 32-bit counter register (ECX)
    Ecx,
    /// 32-bit data register (EDX)
    Edx,
    /// 32-bit base register (EBX)
    Ebx,
    /// 32-bit stack pointer (ESP)
    Esp,
    /// 32-bit base pointer (EBP)
    Ebp,
    /// 32-bit source index (ESI)
    Esi,
    /// 32-bit destination index (EDI)
    Edi,
    /// 32-bit instruction pointer (EIP)
    Eip,
    /// 32-bit flags register (EFLAGS)
    Eflags,

    /// 64-bit accumulator register (RAX)
    Rax,
    /// 64-bit counter register (RCX)
    Rcx,
    /// 64-bit data register (RDX)
    Rdx,
    /// 64-bit base register (RBX)
    Rbx,
    /// 64-bit stack pointer (RSP)
    Rsp,
    /// 64-bit base pointer (RBP)
    Rbp,
    /// 64-bit source index (RSI)
    Rsi,
    /// 64-bit destination index (RDI)
    Rdi,
    /// 64-bit extended register R8
    R8,
    /// 64-bit extended register R9
    R9,
    /// 64-bit extended register R10
    R10,
    /// 64-bit extended register R11
    R11,
    /// 64-bit extended register R12
    R12,
    /// 64-bit extended register R13
    R13,
    /// 64-bit extended register R14
    R14,
    /// 64-bit extended register R15
    R15,
    /// 64-bit instruction pointer (RIP)
    Rip,
    /// 64-bit flags register (RFLAGS)
    Rflags,

    /// 8-bit low accumulator (AL)
    Al,
    /// 8-bit low counter (CL)
    Cl,
    /// 8-bit low data (DL)
    Dl,
    /// 8-bit low base (BL)
    Bl,
    /// 8-bit high accumulator (AH)
    Ah,
    /// 8-bit high counter (CH)
    Ch,
    /// 8-bit high data (DH)
    Dh,
    /// 8-bit high base (BH)
    Bh,

    /// 16-bit accumulator register (AX)
    Ax,
    /// 16-bit counter register (CX)
    Cx,
    /// 16-bit data register (DX)
    Dx,
    /// 16-bit base register (BX)
    Bx,
    /// 16-bit stack pointer (SP)
    Sp,
    /// 16-bit base pointer (BP)
    Bp,
    /// 16-bit source index (SI)
    Si,
    /// 16-bit destination index (DI)
    Di,
}

/// Full-width registers of the x86 register file, in encoding order.
pub const X86_REGISTERS: [Register; 10] = [
    Register::Eax,
    Register::Ecx,
    Register::Edx,
    Register::Ebx,
    Register::Esp,
    Register::Ebp,
    Register::Esi,
    Register::Edi,
    Register::Eip,
    Register::Eflags,
];

/// Full-width registers of the x86-64 register file, in encoding order.
pub const X86_64_REGISTERS: [Register; 18] = [
    Register::Rax,
    Register::Rcx,
    Register::Rdx,
    Register::Rbx,
    Register::Rsp,
    Register::Rbp,
    Register::Rsi,
    Register::Rdi,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
    Register::Rip,
    Register::Rflags,
];

impl Register {
    /// Returns the size of this register in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u8 {
        match self {
            // 8-bit
            Register::Al
            | Register::Cl
            | Register::Dl
            | Register::Bl
            | Register::Ah
            | Register::Ch
            | Register::Dh
            | Register::Bh => 1,
            // 16-bit
            Register::Ax
            | Register::Cx
            | Register::Dx
            | Register::Bx
            | Register::Sp
            | Register::Bp
            | Register::Si
            | Register::Di => 2,
            // 32-bit
            Register::Eax
            | Register::Ecx
            | Register::Edx
            | Register::Ebx
            | Register::Esp
            | Register::Ebp
            | Register::Esi
            | Register::Edi
            | Register::Eip
            | Register::Eflags => 4,
            // 64-bit
            Register::Rax
            | Register::Rcx
            | Register::Rdx
            | Register::Rbx
            | Register::Rsp
            | Register::Rbp
            | Register::Rsi
            | Register::Rdi
            | Register::R8
            | Register::R9
            | Register::R10
            | Register::R11
            | Register::R12
            | Register::R13
            | Register::R14
            | Register::R15
            | Register::Rip
            | Register::Rflags => 8,
        }
    }

    /// Returns the size of this register in bits.
    #[inline]
    #[must_use]
    pub fn bits(&self) -> u32 {
        u32::from(self.size()) * 8
    }

    /// Returns the encoding index of the full register this is part of.
    ///
    /// AL/AH/AX/EAX/RAX all map to 0. The instruction pointer maps to 16 and the
    /// flags register to 17.
    #[inline]
    #[must_use]
    pub fn base_index(&self) -> u8 {
        match self {
            Register::Al | Register::Ah | Register::Ax | Register::Eax | Register::Rax => 0,
            Register::Cl | Register::Ch | Register::Cx | Register::Ecx | Register::Rcx => 1,
            Register::Dl | Register::Dh | Register::Dx | Register::Edx | Register::Rdx => 2,
            Register::Bl | Register::Bh | Register::Bx | Register::Ebx | Register::Rbx => 3,
            Register::Sp | Register::Esp | Register::Rsp => 4,
            Register::Bp | Register::Ebp | Register::Rbp => 5,
            Register::Si | Register::Esi | Register::Rsi => 6,
            Register::Di | Register::Edi | Register::Rdi => 7,
            Register::R8 => 8,
            Register::R9 => 9,
            Register::R10 => 10,
            Register::R11 => 11,
            Register::R12 => 12,
            Register::R13 => 13,
            Register::R14 => 14,
            Register::R15 => 15,
            Register::Eip | Register::Rip => 16,
            Register::Eflags | Register::Rflags => 17,
        }
    }

    /// Returns the bit position of this register inside its full register.
    ///
    /// Only the legacy high-byte registers (AH, CH, DH, BH) are not at bit 0.
    #[inline]
    #[must_use]
    pub fn bit_offset(&self) -> u32 {
        match self {
            Register::Ah | Register::Ch | Register::Dh | Register::Bh => 8,
            _ => 0,
        }
    }

    /// Returns the full-width register this register is part of on `arch`.
    ///
    /// Returns `None` if the register does not exist on `arch` (R8-R15 on x86).
    #[must_use]
    pub fn full(&self, arch: Architecture) -> Option<Register> {
        let index = usize::from(self.base_index());
        match arch {
            Architecture::X86 => {
                if index == 16 {
                    Some(Register::Eip)
                } else if index == 17 {
                    Some(Register::Eflags)
                } else if index < 8 && self.size() <= 4 {
                    Some(X86_REGISTERS[index])
                } else {
                    None
                }
            }
            Architecture::X86_64 => X86_64_REGISTERS.get(index).copied(),
            Architecture::AArch64 | Architecture::Arm32 => None,
        }
    }

    /// Extracts this register's value from the value of its full register.
    #[must_use]
    pub fn extract(&self, full_value: u64) -> u64 {
        (full_value >> self.bit_offset()) & mask(self.bits())
    }

    /// Replaces this register's bits inside the value of its full register.
    ///
    /// 32-bit writes on x86-64 zero the upper half, as the hardware does.
    #[must_use]
    pub fn insert(&self, full_value: u64, value: u64, arch: Architecture) -> u64 {
        if self.size() == 4 && arch == Architecture::X86_64 {
            return value & mask(32);
        }
        let field = mask(self.bits()) << self.bit_offset();
        (full_value & !field) | ((value << self.bit_offset()) & field)
    }

    /// Returns true if this is the stack pointer register.
    #[inline]
    #[must_use]
    pub fn is_stack_pointer(&self) -> bool {
        matches!(self, Register::Sp | Register::Esp | Register::Rsp)
    }

    /// Returns true if this is the instruction pointer register.
    #[inline]
    #[must_use]
    pub fn is_instruction_pointer(&self) -> bool {
        matches!(self, Register::Eip | Register::Rip)
    }

    /// Returns true if this is the flags register.
    #[inline]
    #[must_use]
    pub fn is_flags(&self) -> bool {
        matches!(self, Register::Eflags | Register::Rflags)
    }
}

/// Memory operand representing x86 addressing modes.
///
/// x86 memory operands use the formula: `[base + index*scale + displacement]`
///
/// RIP-relative operands are expected to arrive already resolved to an absolute
/// displacement with no base register.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Memory {
    /// Base register (optional). When `None`, uses absolute addressing.
    #[serde(default)]
    pub base: Option<Register>,
    /// Index register (optional, for SIB addressing).
    #[serde(default)]
    pub index: Option<Register>,
    /// Scale factor for index register. Valid values: 1, 2, 4, or 8.
    #[serde(default = "default_scale")]
    pub scale: u8,
    /// Signed displacement added to the effective address.
    #[serde(default)]
    pub displacement: i64,
    /// Size of the memory access in bytes (1, 2, 4, or 8).
    pub size: u8,
}

fn default_scale() -> u8 {
    1
}

impl Memory {
    /// Creates a simple [base + disp] memory operand.
    #[must_use]
    pub fn base_disp(base: Register, displacement: i64, size: u8) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: 1,
            displacement,
            size,
        }
    }

    /// Creates a [base + index*scale + disp] memory operand.
    #[must_use]
    pub fn base_index_scale_disp(
        base: Register,
        index: Register,
        scale: u8,
        displacement: i64,
        size: u8,
    ) -> Self {
        Self {
            base: Some(base),
            index: Some(index),
            scale,
            displacement,
            size,
        }
    }

    /// Creates a [disp] memory operand (absolute address).
    #[must_use]
    pub fn absolute(address: u64, size: u8) -> Self {
        Self {
            base: None,
            index: None,
            scale: 1,
            displacement: address as i64,
            size,
        }
    }

    /// Returns the registers used to compute the effective address.
    pub fn address_registers(&self) -> impl Iterator<Item = Register> {
        self.base.into_iter().chain(self.index)
    }

    /// Computes the concrete effective address of this operand.
    ///
    /// Base and index registers are read through `source`; the result is truncated
    /// to the pointer width of `arch`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InaccessibleState`] if an address register cannot be read.
    pub fn effective_address(
        &self,
        arch: Architecture,
        source: &dyn ConcreteStateSource,
    ) -> Result<u64> {
        let mut address = self.displacement as u64;
        if let Some(base) = self.base {
            address = address.wrapping_add(source.read_concrete_register(base)?);
        }
        if let Some(index) = self.index {
            let value = source.read_concrete_register(index)?;
            address = address.wrapping_add(value.wrapping_mul(u64::from(self.scale)));
        }
        Ok(address & arch.address_mask())
    }
}

/// Operand for an x86 instruction.
///
/// An operand can be a register, immediate value, or memory location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operand {
    /// Register operand (e.g., `eax`, `rcx`)
    Register(Register),
    /// Immediate constant value (e.g., `42`, `0x1000`)
    Immediate(i64),
    /// Memory operand (e.g., `[esp+8]`, `[eax+ecx*4]`)
    Memory(Memory),
}

impl Operand {
    /// Returns the size of this operand in bytes, if known.
    #[must_use]
    pub fn size(&self) -> Option<u8> {
        match self {
            Operand::Register(reg) => Some(reg.size()),
            Operand::Immediate(_) => None,
            Operand::Memory(mem) => Some(mem.size),
        }
    }

    /// Returns the register if this is a register operand.
    #[must_use]
    pub fn as_register(&self) -> Option<Register> {
        match self {
            Operand::Register(r) => Some(*r),
            _ => None,
        }
    }

    /// Returns the immediate value if this is an immediate operand.
    #[must_use]
    pub fn as_immediate(&self) -> Option<i64> {
        match self {
            Operand::Immediate(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns a reference to the memory operand if this is a memory operand.
    #[must_use]
    pub fn as_memory(&self) -> Option<&Memory> {
        match self {
            Operand::Memory(m) => Some(m),
            _ => None,
        }
    }
}

/// Condition codes for conditional jumps (Jcc instructions).
///
/// | Condition | Flags Checked | Common Use |
/// |-----------|---------------|------------|
/// | `E`/`Ne` | ZF | Equality comparison |
/// | `L`/`Ge`/`Le`/`G` | SF, OF, ZF | Signed comparison |
/// | `B`/`Ae`/`Be`/`A` | CF, ZF | Unsigned comparison |
/// | `S`/`Ns` | SF | Sign check |
/// | `O`/`No` | OF | Overflow check |
/// | `P`/`Np` | PF | Parity check |
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    /// Equal (ZF=1)
    E,
    /// Not equal (ZF=0)
    Ne,
    /// Less than (SF!=OF)
    L,
    /// Greater than or equal (SF=OF)
    Ge,
    /// Less than or equal (ZF=1 or SF!=OF)
    Le,
    /// Greater than (ZF=0 and SF=OF)
    G,
    /// Below (CF=1)
    B,
    /// Above or equal (CF=0)
    Ae,
    /// Below or equal (CF=1 or ZF=1)
    Be,
    /// Above (CF=0 and ZF=0)
    A,
    /// Sign (SF=1)
    S,
    /// Not sign (SF=0)
    Ns,
    /// Overflow (OF=1)
    O,
    /// Not overflow (OF=0)
    No,
    /// Parity even (PF=1)
    P,
    /// Parity odd (PF=0)
    Np,
}

impl Condition {
    /// Returns the negation of this condition.
    #[must_use]
    pub fn negate(&self) -> Self {
        match self {
            Condition::E => Condition::Ne,
            Condition::Ne => Condition::E,
            Condition::L => Condition::Ge,
            Condition::Ge => Condition::L,
            Condition::Le => Condition::G,
            Condition::G => Condition::Le,
            Condition::B => Condition::Ae,
            Condition::Ae => Condition::B,
            Condition::Be => Condition::A,
            Condition::A => Condition::Be,
            Condition::S => Condition::Ns,
            Condition::Ns => Condition::S,
            Condition::O => Condition::No,
            Condition::No => Condition::O,
            Condition::P => Condition::Np,
            Condition::Np => Condition::P,
        }
    }

    /// Evaluates this condition against a concrete flags register value.
    #[must_use]
    pub fn holds(&self, flags: u64) -> bool {
        let bit = |n: u32| (flags >> n) & 1 == 1;
        let (cf, pf, zf, sf, of) = (
            bit(flags::CF),
            bit(flags::PF),
            bit(flags::ZF),
            bit(flags::SF),
            bit(flags::OF),
        );
        match self {
            Condition::E => zf,
            Condition::Ne => !zf,
            Condition::L => sf != of,
            Condition::Ge => sf == of,
            Condition::Le => zf || sf != of,
            Condition::G => !zf && sf == of,
            Condition::B => cf,
            Condition::Ae => !cf,
            Condition::Be => cf || zf,
            Condition::A => !cf && !zf,
            Condition::S => sf,
            Condition::Ns => !sf,
            Condition::O => of,
            Condition::No => !of,
            Condition::P => pf,
            Condition::Np => !pf,
        }
    }
}

/// Bit positions of the status flags in EFLAGS/RFLAGS.
pub mod flags {
    /// Carry flag
    pub const CF: u32 = 0;
    /// Parity flag
    pub const PF: u32 = 2;
    /// Zero flag
    pub const ZF: u32 = 6;
    /// Sign flag
    pub const SF: u32 = 7;
    /// Overflow flag
    pub const OF: u32 = 11;
}

/// Simplified x86 instruction representation.
///
/// Instructions outside this set are captured as [`Instruction::Unsupported`]; the
/// engine concretizes whatever they write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Instruction {
    /// Move data: `mov dst, src`
    Mov {
        /// Destination operand
        dst: Operand,
        /// Source operand
        src: Operand,
    },
    /// Move with zero extension: `movzx dst, src`
    MovZx {
        /// Destination register, wider than the source
        dst: Operand,
        /// Source operand
        src: Operand,
    },
    /// Move with sign extension: `movsx dst, src` (and `movsxd`)
    MovSx {
        /// Destination register, wider than the source
        dst: Operand,
        /// Source operand
        src: Operand,
    },
    /// Load effective address: `lea dst, [mem]`
    Lea {
        /// Destination register
        dst: Register,
        /// Address expression (computed but not dereferenced)
        src: Memory,
    },
    /// Push onto stack: `push src`
    Push {
        /// Value to push onto the stack
        src: Operand,
    },
    /// Pop from stack: `pop dst`
    Pop {
        /// Destination for the popped value
        dst: Operand,
    },
    /// Addition: `add dst, src`
    Add {
        /// Destination operand (receives result)
        dst: Operand,
        /// Source operand to add
        src: Operand,
    },
    /// Subtraction: `sub dst, src`
    Sub {
        /// Destination operand (receives result)
        dst: Operand,
        /// Source operand to subtract
        src: Operand,
    },
    /// Truncating multiplication: `imul dst, src`
    Mul {
        /// Destination operand (receives the low half of the product)
        dst: Operand,
        /// Source operand
        src: Operand,
    },
    /// Bitwise AND: `and dst, src`
    And {
        /// Destination operand (receives result)
        dst: Operand,
        /// Source operand
        src: Operand,
    },
    /// Bitwise OR: `or dst, src`
    Or {
        /// Destination operand (receives result)
        dst: Operand,
        /// Source operand
        src: Operand,
    },
    /// Bitwise XOR: `xor dst, src`
    Xor {
        /// Destination operand (receives result)
        dst: Operand,
        /// Source operand
        src: Operand,
    },
    /// Shift left: `shl dst, count`
    Shl {
        /// Operand to shift
        dst: Operand,
        /// Shift count
        count: Operand,
    },
    /// Shift right (logical): `shr dst, count`
    Shr {
        /// Operand to shift
        dst: Operand,
        /// Shift count
        count: Operand,
    },
    /// Bitwise NOT: `not dst`
    Not {
        /// Operand to complement
        dst: Operand,
    },
    /// Negate: `neg dst`
    Neg {
        /// Operand to negate
        dst: Operand,
    },
    /// Increment: `inc dst`
    Inc {
        /// Operand to increment by one
        dst: Operand,
    },
    /// Decrement: `dec dst`
    Dec {
        /// Operand to decrement by one
        dst: Operand,
    },
    /// Compare: `cmp left, right` (computes left - right, sets flags)
    Cmp {
        /// Left operand of comparison
        left: Operand,
        /// Right operand of comparison
        right: Operand,
    },
    /// Test: `test left, right` (computes left & right, sets flags)
    Test {
        /// Left operand of test
        left: Operand,
        /// Right operand of test
        right: Operand,
    },
    /// Conditional jump: `jcc target`
    Jcc {
        /// Condition for the jump
        condition: Condition,
        /// Absolute target address
        target: u64,
    },
    /// Unconditional jump: `jmp target`
    Jmp {
        /// Jump target (immediate for direct jumps)
        target: Operand,
    },
    /// Call: `call target`
    Call {
        /// Call target (immediate for direct calls)
        target: Operand,
    },
    /// Return: `ret`
    Ret,
    /// No operation: `nop`
    Nop,
    /// Unsupported instruction. Everything it writes is concretized.
    Unsupported {
        /// Mnemonic name of the unsupported instruction
        mnemonic: String,
        /// Registers and memory the instruction reads
        #[serde(default)]
        reads: Vec<Operand>,
        /// Registers and memory the instruction writes
        #[serde(default)]
        writes: Vec<Operand>,
    },
}

/// Stack side effect of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEffect {
    /// Decrements the stack pointer and writes one pointer-sized slot.
    Push,
    /// Reads one pointer-sized slot and increments the stack pointer.
    Pop,
}

impl Instruction {
    /// Returns the assembly mnemonic, e.g. `"add"` or `"jl"`.
    #[must_use]
    pub fn mnemonic(&self) -> String {
        let name = match self {
            Instruction::Mov { .. } => "mov",
            Instruction::MovZx { .. } => "movzx",
            Instruction::MovSx { .. } => "movsx",
            Instruction::Lea { .. } => "lea",
            Instruction::Push { .. } => "push",
            Instruction::Pop { .. } => "pop",
            Instruction::Add { .. } => "add",
            Instruction::Sub { .. } => "sub",
            Instruction::Mul { .. } => "imul",
            Instruction::And { .. } => "and",
            Instruction::Or { .. } => "or",
            Instruction::Xor { .. } => "xor",
            Instruction::Shl { .. } => "shl",
            Instruction::Shr { .. } => "shr",
            Instruction::Not { .. } => "not",
            Instruction::Neg { .. } => "neg",
            Instruction::Inc { .. } => "inc",
            Instruction::Dec { .. } => "dec",
            Instruction::Cmp { .. } => "cmp",
            Instruction::Test { .. } => "test",
            Instruction::Jcc { condition, .. } => return format!("j{condition}"),
            Instruction::Jmp { .. } => "jmp",
            Instruction::Call { .. } => "call",
            Instruction::Ret => "ret",
            Instruction::Nop => "nop",
            Instruction::Unsupported { mnemonic, .. } => mnemonic.as_str(),
        };
        name.to_string()
    }

    /// Returns true if this instruction transfers control flow.
    #[must_use]
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            Instruction::Jmp { .. }
                | Instruction::Jcc { .. }
                | Instruction::Call { .. }
                | Instruction::Ret
        )
    }

    /// Returns true if this is a conditional jump.
    #[must_use]
    pub fn is_conditional_branch(&self) -> bool {
        matches!(self, Instruction::Jcc { .. })
    }

    /// Returns the taken target of a conditional jump.
    #[must_use]
    pub fn branch_target(&self) -> Option<u64> {
        match self {
            Instruction::Jcc { target, .. } => Some(*target),
            _ => None,
        }
    }

    /// Returns the explicit operands this instruction reads.
    #[must_use]
    pub fn reads(&self) -> Vec<&Operand> {
        match self {
            Instruction::Mov { src, .. }
            | Instruction::MovZx { src, .. }
            | Instruction::MovSx { src, .. }
            | Instruction::Push { src } => vec![src],
            Instruction::Add { dst, src }
            | Instruction::Sub { dst, src }
            | Instruction::Mul { dst, src }
            | Instruction::And { dst, src }
            | Instruction::Or { dst, src }
            | Instruction::Xor { dst, src } => vec![dst, src],
            Instruction::Shl { dst, count } | Instruction::Shr { dst, count } => vec![dst, count],
            Instruction::Not { dst }
            | Instruction::Neg { dst }
            | Instruction::Inc { dst }
            | Instruction::Dec { dst } => vec![dst],
            Instruction::Cmp { left, right } | Instruction::Test { left, right } => {
                vec![left, right]
            }
            Instruction::Jmp { target } | Instruction::Call { target } => vec![target],
            Instruction::Unsupported { reads, .. } => reads.iter().collect(),
            Instruction::Lea { .. }
            | Instruction::Pop { .. }
            | Instruction::Jcc { .. }
            | Instruction::Ret
            | Instruction::Nop => Vec::new(),
        }
    }

    /// Returns the explicit operands this instruction writes.
    #[must_use]
    pub fn writes(&self) -> Vec<&Operand> {
        match self {
            Instruction::Mov { dst, .. }
            | Instruction::MovZx { dst, .. }
            | Instruction::MovSx { dst, .. }
            | Instruction::Pop { dst }
            | Instruction::Add { dst, .. }
            | Instruction::Sub { dst, .. }
            | Instruction::Mul { dst, .. }
            | Instruction::And { dst, .. }
            | Instruction::Or { dst, .. }
            | Instruction::Xor { dst, .. }
            | Instruction::Shl { dst, .. }
            | Instruction::Shr { dst, .. }
            | Instruction::Not { dst }
            | Instruction::Neg { dst }
            | Instruction::Inc { dst }
            | Instruction::Dec { dst } => vec![dst],
            Instruction::Unsupported { writes, .. } => writes.iter().collect(),
            Instruction::Lea { .. }
            | Instruction::Push { .. }
            | Instruction::Cmp { .. }
            | Instruction::Test { .. }
            | Instruction::Jcc { .. }
            | Instruction::Jmp { .. }
            | Instruction::Call { .. }
            | Instruction::Ret
            | Instruction::Nop => Vec::new(),
        }
    }

    /// Returns the implicit stack effect of this instruction.
    #[must_use]
    pub fn stack_effect(&self) -> Option<StackEffect> {
        match self {
            Instruction::Push { .. } | Instruction::Call { .. } => Some(StackEffect::Push),
            Instruction::Pop { .. } | Instruction::Ret => Some(StackEffect::Pop),
            _ => None,
        }
    }

    /// Returns true if this instruction reads the flags register.
    #[must_use]
    pub fn reads_flags(&self) -> bool {
        matches!(self, Instruction::Jcc { .. })
    }

    /// Returns true if this instruction writes the flags register.
    #[must_use]
    pub fn writes_flags(&self) -> bool {
        matches!(
            self,
            Instruction::Add { .. }
                | Instruction::Sub { .. }
                | Instruction::Mul { .. }
                | Instruction::And { .. }
                | Instruction::Or { .. }
                | Instruction::Xor { .. }
                | Instruction::Shl { .. }
                | Instruction::Shr { .. }
                | Instruction::Neg { .. }
                | Instruction::Inc { .. }
                | Instruction::Dec { .. }
                | Instruction::Cmp { .. }
                | Instruction::Test { .. }
                | Instruction::Unsupported { .. }
        )
    }
}

/// A storage location tracked by the symbolic state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    /// A full-width register of the active architecture.
    Register(Register),
    /// A concrete memory range.
    Memory {
        /// First byte of the range
        address: u64,
        /// Length of the range in bytes
        size: u8,
    },
    /// The arithmetic flags.
    Flags,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Register(reg) => write!(f, "{reg}"),
            Location::Memory { address, size } => write!(f, "[{address:#x}:{size}]"),
            Location::Flags => write!(f, "flags"),
        }
    }
}

/// Direction of an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    /// The location is read.
    Read,
    /// The location is written.
    Write,
}

/// One register, memory, or flags access performed by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Access {
    /// The accessed location
    pub location: Location,
    /// Whether the location is read or written
    pub kind: AccessKind,
}

/// One traced instruction.
///
/// Built by the trace hook when the debuggee stops at `pc`, before the
/// instruction executes. Memory operands are resolved to concrete addresses
/// at build time and the complete access set is derived from the decoded
/// operands. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionEvent {
    pc: u64,
    bytes: Vec<u8>,
    instruction: Instruction,
    accesses: Vec<Access>,
    addresses: Vec<(Memory, u64)>,
    stack_slot: Option<u64>,
    next_pc: Option<u64>,
}

impl InstructionEvent {
    /// Resolves the accesses of `instruction` against the live concrete state.
    ///
    /// # Arguments
    ///
    /// * `pc` - Address of the instruction
    /// * `bytes` - Raw instruction bytes (their length is the instruction length)
    /// * `instruction` - The decoded instruction
    /// * `arch` - Architecture used for register widths and address masking
    /// * `source` - Concrete state used to compute effective addresses
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InaccessibleState`] if a register needed for an
    /// effective address cannot be read.
    pub fn resolve(
        pc: u64,
        bytes: Vec<u8>,
        instruction: Instruction,
        arch: Architecture,
        source: &dyn ConcreteStateSource,
    ) -> Result<Self> {
        let mut accesses = Vec::new();
        let mut addresses: Vec<(Memory, u64)> = Vec::new();

        let mut operand = |op: &Operand, kind: AccessKind, accesses: &mut Vec<Access>| {
            match op {
                Operand::Register(reg) => {
                    if let Some(full) = reg.full(arch) {
                        push_unique(accesses, Location::Register(full), kind);
                    }
                }
                Operand::Memory(mem) => {
                    for reg in mem.address_registers() {
                        if let Some(full) = reg.full(arch) {
                            push_unique(accesses, Location::Register(full), AccessKind::Read);
                        }
                    }
                    let address = match addresses.iter().find(|(m, _)| m == mem) {
                        Some((_, address)) => *address,
                        None => {
                            let address = mem.effective_address(arch, source)?;
                            addresses.push((mem.clone(), address));
                            address
                        }
                    };
                    push_unique(
                        accesses,
                        Location::Memory {
                            address,
                            size: mem.size,
                        },
                        kind,
                    );
                }
                Operand::Immediate(_) => {}
            }
            Ok::<(), crate::Error>(())
        };

        for op in instruction.reads() {
            operand(op, AccessKind::Read, &mut accesses)?;
        }
        for op in instruction.writes() {
            operand(op, AccessKind::Write, &mut accesses)?;
        }
        if let Instruction::Lea { dst, src } = &instruction {
            for reg in src.address_registers() {
                if let Some(full) = reg.full(arch) {
                    push_unique(&mut accesses, Location::Register(full), AccessKind::Read);
                }
            }
            if let Some(full) = dst.full(arch) {
                push_unique(&mut accesses, Location::Register(full), AccessKind::Write);
            }
        }

        let mut stack_slot = None;
        if let Some(effect) = instruction.stack_effect() {
            let sp = arch.stack_pointer();
            let width = arch.pointer_size();
            let current = source.read_concrete_register(sp)?;
            let slot = match effect {
                StackEffect::Push => current.wrapping_sub(u64::from(width)) & arch.address_mask(),
                StackEffect::Pop => current,
            };
            let kind = match effect {
                StackEffect::Push => AccessKind::Write,
                StackEffect::Pop => AccessKind::Read,
            };
            push_unique(&mut accesses, Location::Register(sp), AccessKind::Read);
            push_unique(&mut accesses, Location::Register(sp), AccessKind::Write);
            push_unique(
                &mut accesses,
                Location::Memory {
                    address: slot,
                    size: width,
                },
                kind,
            );
            stack_slot = Some(slot);
        }

        if instruction.reads_flags() {
            push_unique(&mut accesses, Location::Flags, AccessKind::Read);
        }
        if instruction.writes_flags() {
            push_unique(&mut accesses, Location::Flags, AccessKind::Write);
        }

        Ok(Self {
            pc,
            bytes,
            instruction,
            accesses,
            addresses,
            stack_slot,
            next_pc: None,
        })
    }

    /// Attaches the program counter observed after the instruction executed.
    #[must_use]
    pub fn with_next_pc(mut self, next_pc: Option<u64>) -> Self {
        self.next_pc = next_pc;
        self
    }

    /// Address of the instruction.
    #[must_use]
    pub fn pc(&self) -> u64 {
        self.pc
    }

    /// Raw instruction bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length of the instruction in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Returns true if the event carries no instruction bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Address of the next sequential instruction.
    #[must_use]
    pub fn fallthrough(&self) -> u64 {
        self.pc.wrapping_add(self.len())
    }

    /// The decoded instruction.
    #[must_use]
    pub fn instruction(&self) -> &Instruction {
        &self.instruction
    }

    /// Every location read or written by the instruction.
    #[must_use]
    pub fn accesses(&self) -> &[Access] {
        &self.accesses
    }

    /// Locations read by the instruction.
    pub fn reads(&self) -> impl Iterator<Item = &Location> {
        self.accesses
            .iter()
            .filter(|a| a.kind == AccessKind::Read)
            .map(|a| &a.location)
    }

    /// Locations written by the instruction.
    pub fn writes(&self) -> impl Iterator<Item = &Location> {
        self.accesses
            .iter()
            .filter(|a| a.kind == AccessKind::Write)
            .map(|a| &a.location)
    }

    /// Memory ranges written by the instruction, as `(address, size)` pairs.
    pub fn memory_writes(&self) -> impl Iterator<Item = (u64, u8)> + '_ {
        self.writes().filter_map(|location| match location {
            Location::Memory { address, size } => Some((*address, *size)),
            _ => None,
        })
    }

    /// The concrete address resolved for a memory operand of this instruction.
    #[must_use]
    pub fn address_of(&self, memory: &Memory) -> Option<u64> {
        self.addresses
            .iter()
            .find(|(m, _)| m == memory)
            .map(|(_, address)| *address)
    }

    /// The stack slot pushed to or popped from, if the instruction has a stack effect.
    #[must_use]
    pub fn stack_slot(&self) -> Option<u64> {
        self.stack_slot
    }

    /// The program counter observed after execution, when the host reported it.
    #[must_use]
    pub fn next_pc(&self) -> Option<u64> {
        self.next_pc
    }
}

/// Returns a mask with the low `bits` bits set.
#[inline]
#[must_use]
pub fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn push_unique(accesses: &mut Vec<Access>, location: Location, kind: AccessKind) {
    let access = Access { location, kind };
    if !accesses.contains(&access) {
        accesses.push(access);
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::host::SimulatedDebuggee;

    #[test]
    fn test_register_full_width() {
        assert_eq!(Register::Al.full(Architecture::X86_64), Some(Register::Rax));
        assert_eq!(Register::Ah.full(Architecture::X86), Some(Register::Eax));
        assert_eq!(Register::Esp.full(Architecture::X86_64), Some(Register::Rsp));
        assert_eq!(Register::R9.full(Architecture::X86), None);
        assert_eq!(Register::Rax.full(Architecture::X86), None);
        assert_eq!(Register::Ah.bit_offset(), 8);
        assert_eq!(Register::Cx.bits(), 16);
        assert_eq!(Register::Eflags.full(Architecture::X86), Some(Register::Eflags));
        assert_eq!(Register::Eflags.full(Architecture::X86_64), Some(Register::Rflags));
        assert_eq!(Register::Rflags.full(Architecture::X86), None);
        assert!(Register::Rflags.is_flags());
    }

    #[test]
    fn test_subregister_extract_insert() {
        let rax = 0x1122_3344_5566_7788u64;
        assert_eq!(Register::Al.extract(rax), 0x88);
        assert_eq!(Register::Ah.extract(rax), 0x77);
        assert_eq!(Register::Ax.extract(rax), 0x7788);
        assert_eq!(Register::Eax.extract(rax), 0x5566_7788);

        let arch = Architecture::X86_64;
        assert_eq!(Register::Ah.insert(rax, 0xff, arch), 0x1122_3344_5566_ff88);
        assert_eq!(Register::Eax.insert(rax, 0xdead_beef, arch), 0xdead_beef);
        assert_eq!(
            Register::Ax.insert(0xffff_ffff, 0x1234, Architecture::X86),
            0xffff_1234
        );
    }

    #[test]
    fn test_register_parse() {
        assert_eq!(Register::from_str("eax").unwrap(), Register::Eax);
        assert_eq!(Register::from_str("R12").unwrap(), Register::R12);
        assert_eq!(Register::Rsp.to_string(), "rsp");
        assert!(Register::from_str("xmm0").is_err());
    }

    #[test]
    fn test_condition_negate() {
        assert_eq!(Condition::L.negate(), Condition::Ge);
        assert_eq!(Condition::A.negate().negate(), Condition::A);
        assert_eq!(Condition::from_str("jl").ok(), None);
        assert_eq!(Condition::from_str("be").unwrap(), Condition::Be);
    }

    #[test]
    fn test_condition_holds() {
        // 4 - 1: no flags beyond the reserved bit
        let positive = 0x202;
        assert!(Condition::G.holds(positive));
        assert!(Condition::Ge.holds(positive));
        assert!(!Condition::Le.holds(positive));
        assert!(Condition::A.holds(positive));

        let zero = 0x246;
        assert!(Condition::E.holds(zero));
        assert!(Condition::Le.holds(zero));
        assert!(!Condition::G.holds(zero));
        assert!(Condition::P.holds(zero));

        // 0x7fffffff + 1: SF and OF set
        let overflow = 0xa86;
        assert!(Condition::O.holds(overflow));
        assert!(!Condition::No.holds(overflow));
        assert!(Condition::Ge.holds(overflow));
        assert!(!Condition::L.holds(overflow));
        assert!(Condition::B.holds(0x203));
        assert!(Condition::Be.holds(0x203));
    }

    #[test]
    fn test_instruction_operand_roles() {
        let add = Instruction::Add {
            dst: Operand::Register(Register::Eax),
            src: Operand::Immediate(3),
        };
        assert_eq!(add.reads().len(), 2);
        assert_eq!(add.writes(), vec![&Operand::Register(Register::Eax)]);
        assert!(add.writes_flags());

        let jl = Instruction::Jcc {
            condition: Condition::L,
            target: 0x1010,
        };
        assert!(jl.is_conditional_branch());
        assert!(jl.reads_flags());
        assert_eq!(jl.branch_target(), Some(0x1010));

        let unknown = Instruction::Unsupported {
            mnemonic: "cpuid".to_string(),
            reads: vec![Operand::Register(Register::Eax)],
            writes: vec![
                Operand::Register(Register::Eax),
                Operand::Register(Register::Ebx),
            ],
        };
        assert_eq!(unknown.reads().len(), 1);
        assert_eq!(unknown.writes().len(), 2);
    }

    #[test]
    fn test_event_resolves_memory_and_stack() {
        let debuggee = SimulatedDebuggee::new(Architecture::X86);
        debuggee.map(0x2000, 0x1000).unwrap();
        debuggee.set_register(Register::Ebx, 0x2000).unwrap();
        debuggee.set_register(Register::Esi, 2).unwrap();
        debuggee.set_register(Register::Esp, 0x2800).unwrap();
        let bridge = crate::bridge::DebuggeeBridge::new(std::sync::Arc::new(debuggee));

        let mem = Memory::base_index_scale_disp(Register::Ebx, Register::Esi, 4, 8, 4);
        let event = InstructionEvent::resolve(
            0x401000,
            vec![0x89, 0x44, 0xb3, 0x08],
            Instruction::Mov {
                dst: Operand::Memory(mem.clone()),
                src: Operand::Register(Register::Eax),
            },
            Architecture::X86,
            &bridge,
        )
        .unwrap();

        assert_eq!(event.address_of(&mem), Some(0x2010));
        assert_eq!(event.memory_writes().collect::<Vec<_>>(), vec![(0x2010, 4)]);
        assert!(event.reads().any(|l| *l == Location::Register(Register::Ebx)));
        assert_eq!(event.fallthrough(), 0x401004);

        let push = InstructionEvent::resolve(
            0x401004,
            vec![0x50],
            Instruction::Push {
                src: Operand::Register(Register::Eax),
            },
            Architecture::X86,
            &bridge,
        )
        .unwrap();
        assert_eq!(push.stack_slot(), Some(0x27fc));
        assert_eq!(push.memory_writes().collect::<Vec<_>>(), vec![(0x27fc, 4)]);
    }

    #[test]
    fn test_location_display() {
        assert_eq!(Location::Register(Register::Rax).to_string(), "rax");
        assert_eq!(Location::Flags.to_string(), "flags");
        assert_eq!(
            Location::Memory {
                address: 0x10,
                size: 1
            }
            .to_string(),
            "[0x10:1]"
        );
    }
}
