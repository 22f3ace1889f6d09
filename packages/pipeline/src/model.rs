// ABOUTME: Pipeline data model covering stages, per-stage status, scan facts, and terminal outcomes
// ABOUTME: PipelineRun enforces the ordered stage invariant and monotonic progress

use crate::report::ScanReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    InfoGather,
    PortScan,
    VulnScan,
    Report,
}

impl StageKind {
    /// Canonical execution order.
    pub const ALL: [StageKind; 4] = [
        StageKind::InfoGather,
        StageKind::PortScan,
        StageKind::VulnScan,
        StageKind::Report,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::InfoGather => 0,
            Self::PortScan => 1,
            Self::VulnScan => 2,
            Self::Report => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::InfoGather => "info-gather",
            Self::PortScan => "port-scan",
            Self::VulnScan => "vuln-scan",
            Self::Report => "report",
        }
    }

    pub fn next(self) -> Option<StageKind> {
        Self::ALL.get(self.index() + 1).copied()
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    Pending,
    Running,
    Done,
    Failed,
}

impl StageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatus {
    pub stage: StageKind,
    pub state: StageState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StageStatus {
    fn pending(stage: StageKind) -> Self {
        Self {
            stage,
            state: StageState::Pending,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
    Unknown,
}

impl PortState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "open" => Self::Open,
            "closed" => Self::Closed,
            "filtered" | "open|filtered" | "closed|filtered" => Self::Filtered,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    pub port: u16,
    pub protocol: String,
    pub state: PortState,
    pub service: Option<String>,
    pub version: Option<String>,
}

impl PortRecord {
    pub fn is_open(&self) -> bool {
        self.state == PortState::Open
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub path: String,
    pub status: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Unknown,
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "info" => Self::Info,
            "low" => Self::Low,
            "medium" => Self::Medium,
            "high" => Self::High,
            "critical" => Self::Critical,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub template_id: String,
    pub name: String,
    pub severity: Severity,
    pub matched_at: String,
}

/// Why an optional stage did not run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRecord {
    pub stage: StageKind,
    pub reason: String,
}

/// Cross-stage facts accumulated while the pipeline runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanFacts {
    pub addresses: Vec<String>,
    pub web_server: Option<String>,
    /// Ports the quick discovery pass saw; port-scan verifies them.
    pub candidate_ports: Vec<u16>,
    /// Authoritative port states from the port-scan stage.
    pub ports: Vec<PortRecord>,
    pub directories: Vec<Directory>,
    pub findings: Vec<Finding>,
    pub skipped: Vec<SkipRecord>,
    /// Tools that failed or timed out without failing their stage.
    pub degraded_tools: Vec<String>,
    pub report: Option<ScanReport>,
}

impl ScanFacts {
    pub fn open_ports(&self) -> Vec<u16> {
        self.ports
            .iter()
            .filter(|p| p.is_open())
            .map(|p| p.port)
            .collect()
    }

    pub fn degrade(&mut self, tool: &str) {
        if !self.degraded_tools.iter().any(|t| t == tool) {
            self.degraded_tools.push(tool.to_string());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunOutcome {
    Completed { partial: bool },
    Failed { stage: Option<StageKind>, cause: String },
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { partial: false } => f.write_str("completed"),
            Self::Completed { partial: true } => f.write_str("completed (partial)"),
            Self::Failed {
                stage: Some(stage),
                cause,
            } => write!(f, "failed at {}: {}", stage, cause),
            Self::Failed { stage: None, cause } => write!(f, "failed: {}", cause),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Aggregate state of one scan, mutated only by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub scan_run_id: String,
    pub target: String,
    pub stages: Vec<StageStatus>,
    /// Percentage, never decreases.
    pub progress: u8,
    pub facts: ScanFacts,
    pub outcome: Option<RunOutcome>,
    pub started_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(scan_run_id: &str, target: &str) -> Self {
        Self {
            scan_run_id: scan_run_id.to_string(),
            target: target.to_string(),
            stages: StageKind::ALL.iter().map(|k| StageStatus::pending(*k)).collect(),
            progress: 0,
            facts: ScanFacts::default(),
            outcome: None,
            started_at: Utc::now(),
        }
    }

    pub fn status(&self, stage: StageKind) -> &StageStatus {
        &self.stages[stage.index()]
    }

    fn status_mut(&mut self, stage: StageKind) -> &mut StageStatus {
        &mut self.stages[stage.index()]
    }

    /// The stage currently running, if any.
    pub fn current(&self) -> Option<StageKind> {
        self.stages
            .iter()
            .find(|s| s.state == StageState::Running)
            .map(|s| s.stage)
    }

    pub fn begin(&mut self, stage: StageKind) {
        debug_assert!(
            self.stages[..stage.index()]
                .iter()
                .all(|s| s.state.is_terminal()),
            "stage {} started before its predecessors finished",
            stage
        );
        let status = self.status_mut(stage);
        status.state = StageState::Running;
        status.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, stage: StageKind) {
        let status = self.status_mut(stage);
        status.state = StageState::Done;
        status.finished_at = Some(Utc::now());
        self.advance_progress(stage);
    }

    pub fn fail(&mut self, stage: StageKind, error: impl Into<String>) {
        let status = self.status_mut(stage);
        status.state = StageState::Failed;
        status.finished_at = Some(Utc::now());
        status.error = Some(error.into());
    }

    /// Record an optional stage as done without running it.
    pub fn skip(&mut self, stage: StageKind, reason: impl Into<String>) {
        self.facts.skipped.push(SkipRecord {
            stage,
            reason: reason.into(),
        });
        self.complete(stage);
    }

    pub fn skip_record(&self, stage: StageKind) -> Option<&SkipRecord> {
        self.facts.skipped.iter().find(|s| s.stage == stage)
    }

    fn advance_progress(&mut self, stage: StageKind) {
        let reached = ((stage.index() + 1) * 100 / StageKind::ALL.len()) as u8;
        self.progress = self.progress.max(reached);
    }

    pub fn finish(&mut self, outcome: RunOutcome) {
        self.outcome = Some(outcome);
    }

    pub fn all_done(&self) -> bool {
        self.stages.iter().all(|s| s.state == StageState::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_run_is_all_pending() {
        let run = PipelineRun::new("run-1", "example.com");

        assert_eq!(run.stages.len(), 4);
        assert!(run.stages.iter().all(|s| s.state == StageState::Pending));
        assert_eq!(run.progress, 0);
        assert_eq!(run.current(), None);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut run = PipelineRun::new("run-1", "example.com");

        run.begin(StageKind::InfoGather);
        run.complete(StageKind::InfoGather);
        assert_eq!(run.progress, 25);

        run.begin(StageKind::PortScan);
        run.complete(StageKind::PortScan);
        run.skip(StageKind::VulnScan, "no web ports");
        assert_eq!(run.progress, 75);

        run.begin(StageKind::Report);
        run.fail(StageKind::Report, "disk full");
        assert_eq!(run.progress, 75);
    }

    #[test]
    fn test_failed_stage_leaves_later_stages_pending() {
        let mut run = PipelineRun::new("run-1", "example.com");
        run.begin(StageKind::InfoGather);
        run.complete(StageKind::InfoGather);
        run.begin(StageKind::PortScan);
        assert_eq!(run.current(), Some(StageKind::PortScan));

        run.fail(StageKind::PortScan, "nmap crashed");

        assert_eq!(run.status(StageKind::PortScan).state, StageState::Failed);
        assert_eq!(run.status(StageKind::VulnScan).state, StageState::Pending);
        assert_eq!(run.status(StageKind::Report).state, StageState::Pending);
        assert_eq!(run.current(), None);
    }

    #[test]
    fn test_skip_records_reason() {
        let mut run = PipelineRun::new("run-1", "example.com");

        run.skip(StageKind::VulnScan, "no open web ports");

        assert_eq!(run.status(StageKind::VulnScan).state, StageState::Done);
        assert_eq!(
            run.skip_record(StageKind::VulnScan).map(|s| s.reason.as_str()),
            Some("no open web ports")
        );
    }

    #[test]
    fn test_stage_labels_and_order() {
        let labels: Vec<_> = StageKind::ALL.iter().map(|k| k.label()).collect();
        assert_eq!(labels, vec!["info-gather", "port-scan", "vuln-scan", "report"]);
        assert_eq!(StageKind::VulnScan.next(), Some(StageKind::Report));
        assert_eq!(StageKind::Report.next(), None);
        assert_eq!(
            serde_json::to_string(&StageKind::PortScan).unwrap(),
            "\"port-scan\""
        );
    }

    #[test]
    fn test_degrade_deduplicates() {
        let mut facts = ScanFacts::default();
        facts.degrade("whois");
        facts.degrade("whois");
        assert_eq!(facts.degraded_tools, vec!["whois".to_string()]);
    }

    #[test]
    fn test_outcome_display() {
        let failed = RunOutcome::Failed {
            stage: Some(StageKind::PortScan),
            cause: "boom".into(),
        };
        assert_eq!(failed.to_string(), "failed at port-scan: boom");
        assert_eq!(
            RunOutcome::Completed { partial: true }.to_string(),
            "completed (partial)"
        );
    }
}
