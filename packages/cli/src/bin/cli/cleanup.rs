// ABOUTME: Cleanup command force-killing the sandbox a scan left behind
// ABOUTME: Safe to run for scans that never started or were already torn down

use anyhow::{Context, Result};
use colored::*;
use recon_cli::Engine;
use recon_config::ReconConfig;

pub async fn cleanup_command(config: ReconConfig, run_id: String) -> Result<()> {
    let engine = Engine::connect(config, None)?;
    let name = engine.sessions().config().container_name(&run_id);

    let removed = engine
        .cleanup(&run_id)
        .await
        .with_context(|| format!("Failed to inspect sandbox {}", name))?;

    if removed {
        println!("{} Removed sandbox {}", "✅".green(), name.cyan());
    } else {
        println!("{}", format!("No sandbox found for scan {}", run_id).yellow());
    }
    Ok(())
}
