//! x86/x64 instruction decoder using iced-x86.
//!
//! A thin wrapper that converts iced-x86's instruction representation into the
//! simplified [`Instruction`] model. Anything outside that model is returned as
//! [`Instruction::Unsupported`] with the registers and memory it reads and writes,
//! as reported by iced-x86's instruction info, so the engine can concretize its
//! effects.

use iced_x86::{
    Decoder, DecoderOptions, Instruction as IcedInstruction, InstructionInfoFactory, Mnemonic,
    OpAccess, OpKind, Register as IcedRegister,
};

use crate::{
    engine::Architecture,
    host::InstructionDecoder,
    instruction::{Condition, Instruction, Memory, Operand, Register},
};

/// [`InstructionDecoder`] backed by iced-x86.
#[derive(Debug, Clone, Copy, Default)]
pub struct X86Decoder;

impl X86Decoder {
    /// Creates a decoder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl InstructionDecoder for X86Decoder {
    fn decode(&self, arch: Architecture, pc: u64, bytes: &[u8]) -> Option<(Instruction, usize)> {
        let bitness = match arch {
            Architecture::X86 => 32,
            Architecture::X86_64 => 64,
            Architecture::AArch64 | Architecture::Arm32 => return None,
        };
        let mut decoder = Decoder::with_ip(bitness, bytes, pc, DecoderOptions::NONE);
        if !decoder.can_decode() {
            return None;
        }
        let instr = decoder.decode();
        if instr.is_invalid() {
            return None;
        }
        let converted = convert_instruction(&instr).unwrap_or_else(|| unsupported(&instr));
        Some((converted, instr.len()))
    }
}

/// Convert an iced-x86 instruction to the simplified representation.
///
/// Returns `None` when the instruction or one of its operands has no counterpart.
fn convert_instruction(instr: &IcedInstruction) -> Option<Instruction> {
    match instr.mnemonic() {
        Mnemonic::Mov => binary(instr, |dst, src| Instruction::Mov { dst, src }),
        Mnemonic::Movzx => binary(instr, |dst, src| Instruction::MovZx { dst, src }),
        Mnemonic::Movsx | Mnemonic::Movsxd => {
            binary(instr, |dst, src| Instruction::MovSx { dst, src })
        }
        Mnemonic::Lea => Some(Instruction::Lea {
            dst: convert_register(instr.op0_register())?,
            src: convert_memory_operand(instr)?,
        }),
        Mnemonic::Push => Some(Instruction::Push {
            src: convert_operand(instr, 0)?,
        }),
        Mnemonic::Pop => Some(Instruction::Pop {
            dst: convert_operand(instr, 0)?,
        }),

        Mnemonic::Add => binary(instr, |dst, src| Instruction::Add { dst, src }),
        Mnemonic::Sub => binary(instr, |dst, src| Instruction::Sub { dst, src }),
        // Only the two-operand form truncates into its destination.
        Mnemonic::Imul if instr.op_count() == 2 => {
            binary(instr, |dst, src| Instruction::Mul { dst, src })
        }
        Mnemonic::And => binary(instr, |dst, src| Instruction::And { dst, src }),
        Mnemonic::Or => binary(instr, |dst, src| Instruction::Or { dst, src }),
        Mnemonic::Xor => binary(instr, |dst, src| Instruction::Xor { dst, src }),
        Mnemonic::Shl | Mnemonic::Sal => shift(instr, |dst, count| Instruction::Shl { dst, count }),
        Mnemonic::Shr => shift(instr, |dst, count| Instruction::Shr { dst, count }),
        Mnemonic::Not => unary(instr, |dst| Instruction::Not { dst }),
        Mnemonic::Neg => unary(instr, |dst| Instruction::Neg { dst }),
        Mnemonic::Inc => unary(instr, |dst| Instruction::Inc { dst }),
        Mnemonic::Dec => unary(instr, |dst| Instruction::Dec { dst }),

        Mnemonic::Cmp => binary(instr, |left, right| Instruction::Cmp { left, right }),
        Mnemonic::Test => binary(instr, |left, right| Instruction::Test { left, right }),

        Mnemonic::Jmp => Some(Instruction::Jmp {
            target: branch_operand(instr)?,
        }),
        Mnemonic::Call => Some(Instruction::Call {
            target: branch_operand(instr)?,
        }),
        Mnemonic::Ret => Some(Instruction::Ret),
        Mnemonic::Nop => Some(Instruction::Nop),
        mnemonic => Some(Instruction::Jcc {
            condition: mnemonic_to_condition(mnemonic)?,
            target: direct_target(instr)?,
        }),
    }
}

fn binary<F>(instr: &IcedInstruction, build: F) -> Option<Instruction>
where
    F: FnOnce(Operand, Operand) -> Instruction,
{
    if instr.op_count() != 2 {
        return None;
    }
    Some(build(convert_operand(instr, 0)?, convert_operand(instr, 1)?))
}

fn unary<F>(instr: &IcedInstruction, build: F) -> Option<Instruction>
where
    F: FnOnce(Operand) -> Instruction,
{
    Some(build(convert_operand(instr, 0)?))
}

fn shift<F>(instr: &IcedInstruction, build: F) -> Option<Instruction>
where
    F: FnOnce(Operand, Operand) -> Instruction,
{
    let dst = convert_operand(instr, 0)?;
    let count = if instr.op_count() > 1 {
        convert_operand(instr, 1)?
    } else {
        Operand::Immediate(1)
    };
    Some(build(dst, count))
}

fn direct_target(instr: &IcedInstruction) -> Option<u64> {
    match instr.op0_kind() {
        OpKind::NearBranch16 => Some(u64::from(instr.near_branch16())),
        OpKind::NearBranch32 => Some(u64::from(instr.near_branch32())),
        OpKind::NearBranch64 => Some(instr.near_branch64()),
        _ => None,
    }
}

fn branch_operand(instr: &IcedInstruction) -> Option<Operand> {
    match direct_target(instr) {
        Some(target) => Some(Operand::Immediate(target as i64)),
        None => convert_operand(instr, 0),
    }
}

fn mnemonic_to_condition(mnemonic: Mnemonic) -> Option<Condition> {
    match mnemonic {
        Mnemonic::Je => Some(Condition::E),
        Mnemonic::Jne => Some(Condition::Ne),
        Mnemonic::Jl => Some(Condition::L),
        Mnemonic::Jge => Some(Condition::Ge),
        Mnemonic::Jle => Some(Condition::Le),
        Mnemonic::Jg => Some(Condition::G),
        Mnemonic::Jb => Some(Condition::B),
        Mnemonic::Jae => Some(Condition::Ae),
        Mnemonic::Jbe => Some(Condition::Be),
        Mnemonic::Ja => Some(Condition::A),
        Mnemonic::Js => Some(Condition::S),
        Mnemonic::Jns => Some(Condition::Ns),
        Mnemonic::Jo => Some(Condition::O),
        Mnemonic::Jno => Some(Condition::No),
        Mnemonic::Jp => Some(Condition::P),
        Mnemonic::Jnp => Some(Condition::Np),
        _ => None,
    }
}

/// Convert an operand at the given index.
fn convert_operand(instr: &IcedInstruction, index: u32) -> Option<Operand> {
    match instr.op_kind(index) {
        OpKind::Register => Some(Operand::Register(convert_register(
            instr.op_register(index),
        )?)),
        OpKind::Immediate8 => Some(Operand::Immediate(i64::from(instr.immediate8()))),
        OpKind::Immediate16 => Some(Operand::Immediate(i64::from(instr.immediate16()))),
        OpKind::Immediate32 => Some(Operand::Immediate(i64::from(instr.immediate32()))),
        OpKind::Immediate64 => Some(Operand::Immediate(instr.immediate64() as i64)),
        OpKind::Immediate8to16 => Some(Operand::Immediate(i64::from(instr.immediate8to16()))),
        OpKind::Immediate8to32 => Some(Operand::Immediate(i64::from(instr.immediate8to32()))),
        OpKind::Immediate8to64 => Some(Operand::Immediate(instr.immediate8to64())),
        OpKind::Immediate32to64 => Some(Operand::Immediate(instr.immediate32to64())),
        OpKind::Memory => Some(Operand::Memory(convert_memory_operand(instr)?)),
        _ => None,
    }
}

/// Convert the memory operand. RIP-relative operands become absolute.
fn convert_memory_operand(instr: &IcedInstruction) -> Option<Memory> {
    memory_from_parts(
        instr.memory_base(),
        instr.memory_index(),
        instr.memory_index_scale(),
        instr.memory_displacement64(),
        instr.memory_size().size(),
    )
}

fn memory_from_parts(
    base: IcedRegister,
    index: IcedRegister,
    scale: u32,
    displacement: u64,
    size: usize,
) -> Option<Memory> {
    let base = match base {
        IcedRegister::None | IcedRegister::RIP | IcedRegister::EIP => None,
        reg => Some(convert_register(reg)?),
    };
    let index = match index {
        IcedRegister::None => None,
        reg => Some(convert_register(reg)?),
    };
    Some(Memory {
        base,
        index,
        scale: u8::try_from(scale).ok()?,
        displacement: displacement as i64,
        size: u8::try_from(size).ok().filter(|s| *s > 0)?,
    })
}

/// Builds an [`Instruction::Unsupported`] from iced-x86's access information.
fn unsupported(instr: &IcedInstruction) -> Instruction {
    let mut factory = InstructionInfoFactory::new();
    let info = factory.info(instr);

    let mut reads = Vec::new();
    let mut writes = Vec::new();
    for used in info.used_registers() {
        let Some(register) = convert_register(used.register()) else {
            continue;
        };
        if register.is_instruction_pointer() {
            continue;
        }
        let operand = Operand::Register(register);
        if is_read(used.access()) {
            reads.push(operand.clone());
        }
        if is_write(used.access()) {
            writes.push(operand);
        }
    }
    for used in info.used_memory() {
        let Some(memory) = memory_from_parts(
            used.base(),
            used.index(),
            used.scale(),
            used.displacement(),
            used.memory_size().size(),
        ) else {
            continue;
        };
        let operand = Operand::Memory(memory);
        if is_read(used.access()) {
            reads.push(operand.clone());
        }
        if is_write(used.access()) {
            writes.push(operand);
        }
    }

    Instruction::Unsupported {
        mnemonic: format!("{:?}", instr.mnemonic()).to_lowercase(),
        reads,
        writes,
    }
}

fn is_read(access: OpAccess) -> bool {
    matches!(
        access,
        OpAccess::Read | OpAccess::CondRead | OpAccess::ReadWrite | OpAccess::ReadCondWrite
    )
}

fn is_write(access: OpAccess) -> bool {
    matches!(
        access,
        OpAccess::Write | OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite
    )
}

/// Convert an iced-x86 register. Registers outside the general-purpose set yield `None`.
fn convert_register(reg: IcedRegister) -> Option<Register> {
    match reg {
        // 32-bit
        IcedRegister::EAX => Some(Register::Eax),
        IcedRegister::ECX => Some(Register::Ecx),
        IcedRegister::EDX => Some(Register::Edx),
        IcedRegister::EBX => Some(Register::Ebx),
        IcedRegister::ESP => Some(Register::Esp),
        IcedRegister::EBP => Some(Register::Ebp),
        IcedRegister::ESI => Some(Register::Esi),
        IcedRegister::EDI => Some(Register::Edi),
        IcedRegister::EIP => Some(Register::Eip),

        // 64-bit
        IcedRegister::RAX => Some(Register::Rax),
        IcedRegister::RCX => Some(Register::Rcx),
        IcedRegister::RDX => Some(Register::Rdx),
        IcedRegister::RBX => Some(Register::Rbx),
        IcedRegister::RSP => Some(Register::Rsp),
        IcedRegister::RBP => Some(Register::Rbp),
        IcedRegister::RSI => Some(Register::Rsi),
        IcedRegister::RDI => Some(Register::Rdi),
        IcedRegister::R8 => Some(Register::R8),
        IcedRegister::R9 => Some(Register::R9),
        IcedRegister::R10 => Some(Register::R10),
        IcedRegister::R11 => Some(Register::R11),
        IcedRegister::R12 => Some(Register::R12),
        IcedRegister::R13 => Some(Register::R13),
        IcedRegister::R14 => Some(Register::R14),
        IcedRegister::R15 => Some(Register::R15),
        IcedRegister::RIP => Some(Register::Rip),

        // 8-bit
        IcedRegister::AL => Some(Register::Al),
        IcedRegister::CL => Some(Register::Cl),
        IcedRegister::DL => Some(Register::Dl),
        IcedRegister::BL => Some(Register::Bl),
        IcedRegister::AH => Some(Register::Ah),
        IcedRegister::CH => Some(Register::Ch),
        IcedRegister::DH => Some(Register::Dh),
        IcedRegister::BH => Some(Register::Bh),

        // 16-bit
        IcedRegister::AX => Some(Register::Ax),
        IcedRegister::CX => Some(Register::Cx),
        IcedRegister::DX => Some(Register::Dx),
        IcedRegister::BX => Some(Register::Bx),
        IcedRegister::SP => Some(Register::Sp),
        IcedRegister::BP => Some(Register::Bp),
        IcedRegister::SI => Some(Register::Si),
        IcedRegister::DI => Some(Register::Di),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode32(bytes: &[u8]) -> (Instruction, usize) {
        X86Decoder::new()
            .decode(Architecture::X86, 0x1000, bytes)
            .unwrap()
    }

    #[test]
    fn test_decode_add_reg_imm() {
        // add eax, 3
        let (instr, len) = decode32(&[0x83, 0xc0, 0x03]);
        assert_eq!(len, 3);
        assert_eq!(
            instr,
            Instruction::Add {
                dst: Operand::Register(Register::Eax),
                src: Operand::Immediate(3),
            }
        );
    }

    #[test]
    fn test_decode_conditional_jump() {
        // jl +0x10
        let (instr, len) = decode32(&[0x7c, 0x10]);
        assert_eq!(len, 2);
        assert_eq!(
            instr,
            Instruction::Jcc {
                condition: Condition::L,
                target: 0x1012,
            }
        );
    }

    #[test]
    fn test_decode_memory_operand() {
        // mov eax, [esp + 16]
        let (instr, _) = decode32(&[0x8b, 0x44, 0x24, 0x10]);
        match instr {
            Instruction::Mov {
                src: Operand::Memory(mem),
                ..
            } => {
                assert_eq!(mem.base, Some(Register::Esp));
                assert_eq!(mem.displacement, 16);
                assert_eq!(mem.size, 4);
            }
            other => panic!("Expected Mov from memory, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_widening_moves() {
        // movzx eax, byte [rsi]
        let (instr, len) = X86Decoder::new()
            .decode(Architecture::X86_64, 0x1000, &[0x0f, 0xb6, 0x06])
            .unwrap();
        assert_eq!(len, 3);
        assert_eq!(
            instr,
            Instruction::MovZx {
                dst: Operand::Register(Register::Eax),
                src: Operand::Memory(Memory::base_disp(Register::Rsi, 0, 1)),
            }
        );
        assert_eq!(instr.mnemonic(), "movzx");

        // movsx ecx, dx
        let (instr, _) = decode32(&[0x0f, 0xbf, 0xca]);
        assert_eq!(
            instr,
            Instruction::MovSx {
                dst: Operand::Register(Register::Ecx),
                src: Operand::Register(Register::Dx),
            }
        );

        // movsxd rax, ecx
        let (instr, _) = X86Decoder::new()
            .decode(Architecture::X86_64, 0x1000, &[0x48, 0x63, 0xc1])
            .unwrap();
        assert_eq!(
            instr,
            Instruction::MovSx {
                dst: Operand::Register(Register::Rax),
                src: Operand::Register(Register::Ecx),
            }
        );
    }

    #[test]
    fn test_decode_rip_relative_is_absolute() {
        // mov rax, [rip + 0x10]
        let (instr, len) = X86Decoder::new()
            .decode(
                Architecture::X86_64,
                0x1000,
                &[0x48, 0x8b, 0x05, 0x10, 0x00, 0x00, 0x00],
            )
            .unwrap();
        assert_eq!(len, 7);
        match instr {
            Instruction::Mov {
                src: Operand::Memory(mem),
                ..
            } => {
                assert_eq!(mem.base, None);
                assert_eq!(mem.displacement, 0x1017);
            }
            other => panic!("Expected Mov from memory, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unsupported_reports_writes() {
        // mul ecx
        let (instr, _) = decode32(&[0xf7, 0xe1]);
        match instr {
            Instruction::Unsupported {
                mnemonic, writes, ..
            } => {
                assert_eq!(mnemonic, "mul");
                assert!(writes.contains(&Operand::Register(Register::Eax)));
                assert!(writes.contains(&Operand::Register(Register::Edx)));
            }
            other => panic!("Expected Unsupported, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_and_foreign_arch() {
        let decoder = X86Decoder::new();
        assert!(decoder.decode(Architecture::X86, 0, &[]).is_none());
        assert!(decoder.decode(Architecture::AArch64, 0, &[0x90]).is_none());
    }
}
