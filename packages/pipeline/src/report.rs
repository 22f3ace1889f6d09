// ABOUTME: Scan report synthesized from accumulated pipeline facts
// ABOUTME: Summarizes open ports, directories, findings by severity, skips, and degraded tools

use crate::model::{Directory, Finding, PortRecord, ScanFacts, Severity, SkipRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub scan_run_id: String,
    pub target: String,
    pub generated_at: DateTime<Utc>,
    pub addresses: Vec<String>,
    pub open_ports: Vec<PortRecord>,
    pub directories: Vec<Directory>,
    pub findings: Vec<Finding>,
    pub findings_by_severity: BTreeMap<Severity, usize>,
    pub skipped: Vec<SkipRecord>,
    pub degraded_tools: Vec<String>,
}

impl ScanReport {
    pub fn from_facts(scan_run_id: &str, target: &str, facts: &ScanFacts) -> Self {
        let mut findings_by_severity = BTreeMap::new();
        for finding in &facts.findings {
            *findings_by_severity.entry(finding.severity).or_insert(0) += 1;
        }

        Self {
            scan_run_id: scan_run_id.to_string(),
            target: target.to_string(),
            generated_at: Utc::now(),
            addresses: facts.addresses.clone(),
            open_ports: facts.ports.iter().filter(|p| p.is_open()).cloned().collect(),
            directories: facts.directories.clone(),
            findings: facts.findings.clone(),
            findings_by_severity,
            skipped: facts.skipped.clone(),
            degraded_tools: facts.degraded_tools.clone(),
        }
    }

    pub fn finding_count(&self) -> usize {
        self.findings.len()
    }

    /// One-line human summary for scan logs.
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{}: {} open ports, {} directories, {} findings",
            self.target,
            self.open_ports.len(),
            self.directories.len(),
            self.findings.len()
        );
        for skip in &self.skipped {
            summary.push_str(&format!("; {} skipped ({})", skip.stage, skip.reason));
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PortState, StageKind};
    use pretty_assertions::assert_eq;

    fn finding(severity: Severity) -> Finding {
        Finding {
            template_id: "t".into(),
            name: "n".into(),
            severity,
            matched_at: "http://example.com".into(),
        }
    }

    #[test]
    fn test_report_counts_by_severity_and_keeps_open_ports_only() {
        let facts = ScanFacts {
            ports: vec![
                PortRecord {
                    port: 80,
                    protocol: "tcp".into(),
                    state: PortState::Open,
                    service: Some("http".into()),
                    version: None,
                },
                PortRecord {
                    port: 25,
                    protocol: "tcp".into(),
                    state: PortState::Filtered,
                    service: None,
                    version: None,
                },
            ],
            findings: vec![
                finding(Severity::High),
                finding(Severity::High),
                finding(Severity::Info),
            ],
            ..Default::default()
        };

        let report = ScanReport::from_facts("run-1", "example.com", &facts);

        assert_eq!(report.open_ports.len(), 1);
        assert_eq!(report.finding_count(), 3);
        assert_eq!(report.findings_by_severity[&Severity::High], 2);
        assert_eq!(report.findings_by_severity[&Severity::Info], 1);
    }

    #[test]
    fn test_summary_mentions_skips() {
        let facts = ScanFacts {
            skipped: vec![SkipRecord {
                stage: StageKind::VulnScan,
                reason: "no open web service ports (open: 22)".into(),
            }],
            ..Default::default()
        };

        let report = ScanReport::from_facts("run-1", "example.com", &facts);

        assert_eq!(
            report.summary(),
            "example.com: 0 open ports, 0 directories, 0 findings; vuln-scan skipped (no open web service ports (open: 22))"
        );
    }
}
