mod app;
mod commands;
mod output;

use clap::Parser;

use crate::app::{Cli, Command};

fn main() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        eprintln!("\nCancelled.");
        std::process::exit(130);
    })
    .expect("failed to set Ctrl+C handler");

    let cli = Cli::parse();

    // Show symtrace info+ on stderr unless --json; --verbose enables debug; RUST_LOG overrides
    if !cli.global.json {
        let level = if cli.global.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        env_logger::Builder::new()
            .filter_module("symtrace", level)
            .parse_default_env()
            .target(env_logger::Target::Stderr)
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .init();
    }

    match &cli.command {
        Command::Replay {
            path,
            trace,
            preset,
            max_instructions,
        } => commands::replay::run(
            path,
            &commands::replay::ReplayOptions {
                trace: *trace,
                preset: preset.as_deref(),
                max_instructions: *max_instructions,
                global: &cli.global,
            },
        ),
        Command::Decode { bytes, address, arch } => {
            commands::decode::run(bytes, address, arch, &cli.global)
        }
        Command::Config { preset } => commands::config::run(preset),
    }
}
