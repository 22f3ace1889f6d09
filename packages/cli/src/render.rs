// ABOUTME: Terminal rendering of scan runs, findings, and timeout tables
// ABOUTME: Tables use comfy-table presets and outcomes are colored by severity of the ending

use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use recon_pipeline::{Finding, PipelineRun, RunOutcome, Severity, StageState, StageStatus};
use recon_sandbox::ToolTimeouts;

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn state_label(state: StageState) -> &'static str {
    match state {
        StageState::Pending => "pending",
        StageState::Running => "running",
        StageState::Done => "done",
        StageState::Failed => "failed",
    }
}

fn duration_label(status: &StageStatus) -> String {
    match (status.started_at, status.finished_at) {
        (Some(start), Some(end)) => {
            let millis = (end - start).num_milliseconds().max(0);
            format!("{:.1}s", millis as f64 / 1000.0)
        }
        _ => "-".to_string(),
    }
}

pub fn stage_table(run: &PipelineRun) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Stage", "State", "Duration", "Note"]);

    for status in &run.stages {
        let note = match (&status.error, run.skip_record(status.stage)) {
            (Some(error), _) => error.clone(),
            (None, Some(skip)) => format!("skipped: {}", skip.reason),
            (None, None) => String::new(),
        };
        table.add_row(vec![
            status.stage.to_string(),
            state_label(status.state).to_string(),
            duration_label(status),
            note,
        ]);
    }
    table
}

pub fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Unknown => "unknown",
        Severity::Info => "info",
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
        Severity::Critical => "critical",
    }
}

/// Findings ordered from most to least severe.
pub fn findings_table(findings: &[Finding]) -> Table {
    let mut sorted: Vec<&Finding> = findings.iter().collect();
    sorted.sort_by(|a, b| b.severity.cmp(&a.severity));

    let mut table = new_table();
    table.set_header(vec!["Severity", "Template", "Name", "Matched at"]);
    for finding in sorted {
        table.add_row(vec![
            severity_label(finding.severity).to_string(),
            finding.template_id.clone(),
            finding.name.clone(),
            finding.matched_at.clone(),
        ]);
    }
    table
}

pub fn timeouts_table(timeouts: &ToolTimeouts) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Tool", "Timeout"]);
    for (tool, timeout) in timeouts.entries() {
        table.add_row(vec![tool.to_string(), format!("{}s", timeout.as_secs())]);
    }
    table.add_row(vec![
        "(other)".to_string(),
        format!("{}s", timeouts.fallback().as_secs()),
    ]);
    table
}

pub fn outcome_line(outcome: &RunOutcome) -> String {
    let text = outcome.to_string();
    match outcome {
        RunOutcome::Completed { partial: false } => format!("✅ {}", text.green().bold()),
        RunOutcome::Completed { partial: true } => format!("⚠️  {}", text.yellow().bold()),
        RunOutcome::Failed { .. } => format!("❌ {}", text.red().bold()),
        RunOutcome::Cancelled => format!("⏹  {}", text.dimmed()),
    }
}
