use std::str::FromStr;

use anyhow::{bail, Context};
use symtrace::{Architecture, CoordinatorConfig};

/// Parse a number string supporting hex (0x...) and decimal.
pub fn parse_number(s: &str) -> anyhow::Result<u64> {
    let trimmed = s.trim();
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).with_context(|| format!("invalid hex number: {s}"))
    } else {
        trimmed
            .parse::<u64>()
            .with_context(|| format!("invalid number: {s}"))
    }
}

/// Parse a hex byte string. Whitespace and an optional `0x` prefix are ignored.
pub fn parse_hex_bytes(s: &str) -> anyhow::Result<Vec<u8>> {
    let digits: String = s
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if !digits.is_ascii() {
        bail!("invalid hex string: {s}");
    }
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits in: {s}");
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte at offset {}: {s}", i / 2))
        })
        .collect()
}

/// Parse an architecture name, rejecting architectures the engine cannot trace.
pub fn parse_architecture(s: &str) -> anyhow::Result<Architecture> {
    let arch = Architecture::from_str(s).with_context(|| format!("unknown architecture: {s}"))?;
    if !arch.is_supported() {
        bail!("architecture {arch} is not supported");
    }
    Ok(arch)
}

/// Resolve a configuration preset by name.
pub fn preset(name: &str) -> anyhow::Result<CoordinatorConfig> {
    match name.to_ascii_lowercase().as_str() {
        "default" => Ok(CoordinatorConfig::default()),
        "full" => Ok(CoordinatorConfig::full()),
        "fast" => Ok(CoordinatorConfig::fast()),
        other => bail!("unknown preset: {other} (expected default, full, or fast)"),
    }
}
