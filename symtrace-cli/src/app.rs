use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// symtrace - concolic replay of recorded debugger sessions
#[derive(Debug, Parser)]
#[command(name = "symtrace", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared across all subcommands.
#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Emit output as JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Replay a recorded session and report tainted branches.
    Replay {
        /// Path to the scenario file (JSON).
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Include the session trace in the output.
        #[arg(long)]
        trace: bool,

        /// Override the scenario configuration: default, full, or fast.
        #[arg(long)]
        preset: Option<String>,

        /// Stop tracing after this many instruction events.
        #[arg(long, value_name = "N")]
        max_instructions: Option<u64>,
    },

    /// Decode machine code into the instruction model.
    Decode {
        /// Instruction bytes as hex (e.g. "89c3 83c303").
        #[arg(value_name = "HEX")]
        bytes: String,

        /// Address of the first byte (hex like 0x1000 or decimal).
        #[arg(short, long, default_value = "0")]
        address: String,

        /// Architecture: x86 or x86_64.
        #[arg(long, default_value = "x86_64")]
        arch: String,
    },

    /// Print a configuration preset as JSON.
    Config {
        /// Preset: default, full, or fast.
        #[arg(default_value = "default")]
        preset: String,
    },
}
