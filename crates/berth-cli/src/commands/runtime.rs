use anyhow::Context;
use berth_core::runtime::RuntimeConfig;

/// Run the `runtime` subcommand: print the detected runtime as JSON.
pub fn run() -> anyhow::Result<()> {
    let config = RuntimeConfig::detect();
    let json = serde_json::to_string_pretty(&config).context("failed to encode runtime")?;
    println!("{json}");
    Ok(())
}
