//! Recorded session format.
//!
//! A scenario describes the initial process image, the inputs to symbolize, and
//! the sequence of stops the debugger made. Each step is delivered to the
//! coordinator before its effects are applied to the simulated process, the same
//! order a live debugger reports a stop and then resumes.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use anyhow::{bail, Context};
use serde::Deserialize;
use symtrace::{
    host::{Debuggee, InstructionDecoder, ScriptedDecoder, SimulatedDebuggee, X86Decoder},
    instruction::{Instruction, Register},
    Architecture, CoordinatorConfig,
};

use crate::commands::common::{parse_architecture, parse_hex_bytes};

/// A recorded debugger session.
#[derive(Debug, Deserialize)]
pub struct Scenario {
    /// Architecture name, defaults to x86_64.
    #[serde(default = "default_architecture")]
    pub architecture: String,
    /// Session configuration; defaults apply when absent.
    #[serde(default)]
    pub config: Option<CoordinatorConfig>,
    /// Take an initial snapshot at the first traced instruction.
    #[serde(default)]
    pub initial_snapshot: bool,
    /// Memory mapped before the session starts.
    #[serde(default)]
    pub regions: Vec<Region>,
    /// Initial register values.
    #[serde(default)]
    pub registers: BTreeMap<Register, u64>,
    /// Locations symbolized right after activation.
    #[serde(default)]
    pub inputs: Vec<Input>,
    /// Debugger stops in execution order.
    pub steps: Vec<Step>,
}

fn default_architecture() -> String {
    "x86_64".to_string()
}

/// A mapped memory region with optional initial contents.
#[derive(Debug, Deserialize)]
pub struct Region {
    pub address: u64,
    pub size: usize,
    /// Initial contents as hex.
    #[serde(default)]
    pub bytes: Option<String>,
}

/// A location to symbolize.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Input {
    Register {
        register: Register,
        #[serde(default = "tainted_by_default")]
        tainted: bool,
    },
    Memory {
        address: u64,
        len: usize,
        #[serde(default = "tainted_by_default")]
        tainted: bool,
    },
}

fn tainted_by_default() -> bool {
    true
}

/// One debugger stop and the effects of resuming from it.
#[derive(Debug, Deserialize)]
pub struct Step {
    pub pc: u64,
    /// Pre-decoded instruction; the code bytes at `pc` are decoded when absent.
    #[serde(default)]
    pub instruction: Option<Instruction>,
    /// Length of `instruction` in bytes.
    #[serde(default = "default_length")]
    pub length: usize,
    #[serde(default)]
    pub next_pc: Option<u64>,
    /// Register values after the instruction executed.
    #[serde(default)]
    pub registers: BTreeMap<Register, u64>,
    /// Memory written by the instruction.
    #[serde(default)]
    pub memory: Vec<MemoryWrite>,
    /// Capture a snapshot under this label before the stop is delivered.
    #[serde(default)]
    pub capture: Option<String>,
    /// Restore the snapshot with this label before the stop is delivered.
    #[serde(default)]
    pub restore: Option<String>,
}

fn default_length() -> usize {
    1
}

/// Bytes written to memory by a step.
#[derive(Debug, Deserialize)]
pub struct MemoryWrite {
    pub address: u64,
    /// Data as hex.
    pub bytes: String,
}

impl Scenario {
    /// Load a scenario from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario: {}", path.display()))?;
        let scenario: Scenario = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse scenario: {}", path.display()))?;
        if scenario.steps.is_empty() {
            bail!("scenario has no steps: {}", path.display());
        }
        Ok(scenario)
    }

    /// The scenario architecture.
    pub fn arch(&self) -> anyhow::Result<Architecture> {
        parse_architecture(&self.architecture)
    }

    /// Build the simulated process image.
    pub fn debuggee(&self) -> anyhow::Result<Arc<SimulatedDebuggee>> {
        let debuggee = Arc::new(SimulatedDebuggee::new(self.arch()?));
        for region in &self.regions {
            debuggee
                .map(region.address, region.size)
                .with_context(|| format!("failed to map region at {:#x}", region.address))?;
            if let Some(bytes) = &region.bytes {
                debuggee.write_memory(region.address, &parse_hex_bytes(bytes)?)?;
            }
        }
        for (register, value) in &self.registers {
            debuggee.set_register(*register, *value)?;
        }
        Ok(debuggee)
    }

    /// Build a decoder that prefers pre-decoded steps over the code bytes.
    pub fn decoder(&self) -> Arc<ReplayDecoder> {
        let scripted = ScriptedDecoder::new();
        for step in &self.steps {
            if let Some(instruction) = &step.instruction {
                scripted.insert(step.pc, instruction.clone(), step.length);
            }
        }
        Arc::new(ReplayDecoder {
            scripted,
            fallback: X86Decoder::new(),
        })
    }
}

impl Step {
    /// Apply the effects of executing this step to the process.
    pub fn apply(&self, debuggee: &SimulatedDebuggee) -> anyhow::Result<()> {
        for (register, value) in &self.registers {
            debuggee.set_register(*register, *value)?;
        }
        for write in &self.memory {
            debuggee
                .write_memory(write.address, &parse_hex_bytes(&write.bytes)?)
                .with_context(|| format!("step at {:#x}: write to {:#x}", self.pc, write.address))?;
        }
        Ok(())
    }
}

/// Scripted instructions first, then the x86 decoder.
#[derive(Debug)]
pub struct ReplayDecoder {
    scripted: ScriptedDecoder,
    fallback: X86Decoder,
}

impl InstructionDecoder for ReplayDecoder {
    fn decode(&self, arch: Architecture, pc: u64, bytes: &[u8]) -> Option<(Instruction, usize)> {
        self.scripted
            .decode(arch, pc, bytes)
            .or_else(|| self.fallback.decode(arch, pc, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"{
        "regions": [
            { "address": 4096, "size": 4096, "bytes": "89c3 83c303 83fb0a 7c10" },
            { "address": 28672, "size": 4096 }
        ],
        "registers": { "rsp": 30720, "rax": 5 },
        "inputs": [ { "kind": "register", "register": "eax" } ],
        "steps": [
            { "pc": 4096, "registers": { "rbx": 5 } },
            { "pc": 8192, "instruction": { "op": "nop" } }
        ]
    }"#;

    #[test]
    fn test_parse_scenario() {
        let scenario: Scenario = serde_json::from_str(SCENARIO).unwrap();
        assert_eq!(scenario.arch().unwrap(), Architecture::X86_64);
        assert!(!scenario.initial_snapshot);
        assert!(scenario.config.is_none());
        assert_eq!(scenario.regions.len(), 2);
        assert_eq!(scenario.registers[&Register::Rsp], 0x7800);
        assert!(matches!(
            scenario.inputs[0],
            Input::Register {
                register: Register::Eax,
                tainted: true
            }
        ));
        assert_eq!(scenario.steps[1].instruction, Some(Instruction::Nop));
        assert_eq!(scenario.steps[1].length, 1);
    }

    #[test]
    fn test_debuggee_image() {
        let scenario: Scenario = serde_json::from_str(SCENARIO).unwrap();
        let debuggee = scenario.debuggee().unwrap();
        assert_eq!(debuggee.read_memory(0x1000, 2).unwrap(), vec![0x89, 0xC3]);
        assert_eq!(debuggee.register(Register::Rax).unwrap(), 5);

        scenario.steps[0].apply(&debuggee).unwrap();
        assert_eq!(debuggee.register(Register::Rbx).unwrap(), 5);
    }

    #[test]
    fn test_decoder_prefers_scripted() {
        let scenario: Scenario = serde_json::from_str(SCENARIO).unwrap();
        let decoder = scenario.decoder();
        let (nop, len) = decoder
            .decode(Architecture::X86_64, 0x2000, &[0xCC; 4])
            .unwrap();
        assert_eq!(nop, Instruction::Nop);
        assert_eq!(len, 1);

        let (mov, len) = decoder
            .decode(Architecture::X86_64, 0x1000, &[0x89, 0xC3])
            .unwrap();
        assert_eq!(mov.mnemonic(), "mov");
        assert_eq!(len, 2);
    }
}
