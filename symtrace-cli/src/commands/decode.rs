use serde::Serialize;
use symtrace::{
    host::{InstructionDecoder, X86Decoder},
    instruction::Instruction,
    Architecture,
};

use crate::{
    app::GlobalOptions,
    commands::common::{parse_architecture, parse_hex_bytes, parse_number},
    output::{emit, hex, Listing},
};

#[derive(Debug, Serialize)]
pub struct DecodedInstruction {
    pub address: u64,
    pub bytes: String,
    pub mnemonic: String,
    /// `None` for bytes that do not decode.
    pub instruction: Option<Instruction>,
}

/// Decode `bytes` linearly starting at `address`. Undecodable bytes are consumed one at a time.
fn decode_all(
    decoder: &dyn InstructionDecoder,
    arch: Architecture,
    address: u64,
    bytes: &[u8],
) -> Vec<DecodedInstruction> {
    let mut decoded = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let pc = address.wrapping_add(offset as u64);
        let (instruction, len) = match decoder.decode(arch, pc, &bytes[offset..]) {
            Some((instruction, len)) if len > 0 => (Some(instruction), len),
            _ => (None, 1),
        };
        let end = (offset + len).min(bytes.len());
        decoded.push(DecodedInstruction {
            address: pc,
            bytes: bytes[offset..end].iter().map(|b| format!("{b:02x}")).collect(),
            mnemonic: instruction
                .as_ref()
                .map_or_else(|| "(bad)".to_string(), Instruction::mnemonic),
            instruction,
        });
        offset = end;
    }
    decoded
}

pub fn run(bytes: &str, address: &str, arch: &str, opts: &GlobalOptions) -> anyhow::Result<()> {
    let code = parse_hex_bytes(bytes)?;
    let address = parse_number(address)?;
    let arch = parse_architecture(arch)?;

    let decoded = decode_all(&X86Decoder::new(), arch, address, &code);

    emit(&decoded, opts, |decoded| {
        let mut listing = Listing::new(&["Address", "Bytes", "Mnemonic", "Operands"], 1);
        for entry in decoded {
            let operands = entry
                .instruction
                .as_ref()
                .and_then(|i| match serde_json::to_value(i) {
                    Ok(serde_json::Value::Object(mut fields)) => {
                        fields.remove("op");
                        (!fields.is_empty()).then(|| serde_json::Value::Object(fields).to_string())
                    }
                    _ => None,
                })
                .unwrap_or_default();
            listing.push(vec![
                hex(entry.address),
                entry.bytes.clone(),
                entry.mnemonic.clone(),
                operands,
            ]);
        }
        listing.print("");
    })
}

#[cfg(test)]
mod tests {
    use symtrace::instruction::Operand;

    use super::*;

    #[test]
    fn test_decode_all() {
        // mov ebx, eax ; <push es, invalid in 64-bit mode> ; nop
        let code = [0x89, 0xC3, 0x06, 0x90];
        let decoded = decode_all(&X86Decoder::new(), Architecture::X86_64, 0x1000, &code);
        assert_eq!(decoded.len(), 3);

        assert_eq!(decoded[0].address, 0x1000);
        assert_eq!(decoded[0].bytes, "89c3");
        assert!(matches!(
            decoded[0].instruction,
            Some(Instruction::Mov {
                src: Operand::Register(_),
                ..
            })
        ));

        assert_eq!(decoded[1].mnemonic, "(bad)");
        assert!(decoded[1].instruction.is_none());
        assert_eq!(decoded[2].address, 0x1003);
        assert_eq!(decoded[2].instruction, Some(Instruction::Nop));
    }
}
