use crate::commands::common::preset;

/// Print a preset as JSON.
pub fn run(name: &str) -> anyhow::Result<()> {
    let config = preset(name)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
