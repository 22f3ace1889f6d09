// ABOUTME: Scan command running the full pipeline against one target
// ABOUTME: Prints a stage table and findings, or the whole run as JSON; Ctrl-C cancels the scan

use anyhow::{bail, Context, Result};
use colored::*;
use recon_cli::render::{findings_table, outcome_line, severity_label, stage_table};
use recon_cli::{new_run_id, Engine};
use recon_config::ReconConfig;
use recon_pipeline::{PipelineRun, RunOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

pub async fn scan_command(
    config: ReconConfig,
    target: String,
    run_id: Option<String>,
    json: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let engine = Arc::new(Engine::connect(config, output)?);
    let run_id = run_id.unwrap_or_else(new_run_id);

    if !json {
        println!(
            "{} {} {}",
            "🔎 Scanning".blue().bold(),
            target.cyan(),
            format!("({})", run_id).dimmed()
        );
    }

    let interrupt = {
        let engine = Arc::clone(&engine);
        let run_id = run_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling scan {}", run_id);
                engine.interrupt(&run_id).await;
            }
        })
    };
    let result = engine.scan(&run_id, &target).await;
    interrupt.abort();

    let run = result.with_context(|| format!("Scan {} could not run", run_id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&run);
    }

    match &run.outcome {
        Some(RunOutcome::Completed { .. }) => Ok(()),
        Some(outcome) => bail!("Scan {} {}", run_id, outcome),
        None => bail!("Scan {} ended without an outcome", run_id),
    }
}

fn print_run(run: &PipelineRun) {
    println!();
    println!("{}", stage_table(run));

    let open_ports = run.facts.open_ports();
    if !open_ports.is_empty() {
        let ports: Vec<String> = open_ports.iter().map(|p| p.to_string()).collect();
        println!("Open ports: {}", ports.join(", ").cyan());
    }
    if !run.facts.degraded_tools.is_empty() {
        println!(
            "Degraded tools: {}",
            run.facts.degraded_tools.join(", ").yellow()
        );
    }

    if let Some(report) = &run.facts.report {
        if report.findings.is_empty() {
            println!("{}", "No findings".dimmed());
        } else {
            let counts: Vec<String> = report
                .findings_by_severity
                .iter()
                .rev()
                .map(|(severity, count)| format!("{} {}", count, severity_label(*severity)))
                .collect();
            println!("Findings: {}", counts.join(", ").bold());
            println!("{}", findings_table(&report.findings));
        }
    }

    if let Some(outcome) = &run.outcome {
        println!();
        println!("{}", outcome_line(outcome));
    }
}
