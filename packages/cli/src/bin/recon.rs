use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::*;
use recon_cli::init_logging;
use recon_config::ReconConfig;
use std::path::PathBuf;
use std::process;

mod cli;

#[derive(Parser)]
#[command(name = "recon")]
#[command(about = "Recon engine - sandboxed multi-stage reconnaissance scans")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full scan pipeline against a host name or address
    Scan {
        target: String,

        /// Scan run identifier (default: generated)
        #[arg(long)]
        run_id: Option<String>,

        /// Print the finished run as JSON
        #[arg(long)]
        json: bool,

        /// Directory to write <run-id>.json reports into
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Force-kill the sandbox container left behind by a scan
    Cleanup { run_id: String },
    /// Show the effective per-tool timeout table
    Timeouts,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = handle_command(cli.command).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let config = ReconConfig::from_env().context("Invalid configuration")?;

    match command {
        Commands::Scan {
            target,
            run_id,
            json,
            output,
        } => cli::scan::scan_command(config, target, run_id, json, output).await,
        Commands::Cleanup { run_id } => cli::cleanup::cleanup_command(config, run_id).await,
        Commands::Timeouts => cli::timeouts::timeouts_command(&config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_scan_arguments_parse() {
        let cli = Cli::try_parse_from([
            "recon",
            "-v",
            "scan",
            "example.com",
            "--run-id",
            "scan-1",
            "--json",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Scan {
                target,
                run_id,
                json,
                output,
            } => {
                assert_eq!(target, "example.com");
                assert_eq!(run_id.as_deref(), Some("scan-1"));
                assert!(json);
                assert!(output.is_none());
            }
            _ => panic!("expected scan"),
        }
    }

    #[test]
    fn test_cleanup_requires_run_id() {
        assert!(Cli::try_parse_from(["recon", "cleanup"]).is_err());
    }
}
