// ABOUTME: Timeouts command printing the effective per-tool timeout table
// ABOUTME: Reflects built-in defaults merged with RECON_TOOL_TIMEOUTS overrides

use anyhow::Result;
use colored::*;
use recon_cli::render::timeouts_table;
use recon_config::ReconConfig;
use recon_sandbox::ToolTimeouts;

pub fn timeouts_command(config: &ReconConfig) -> Result<()> {
    let timeouts = ToolTimeouts::from_config(config);

    println!("{}", "⏱  Tool timeouts".blue().bold());
    println!();
    println!("{}", timeouts_table(&timeouts));
    Ok(())
}
