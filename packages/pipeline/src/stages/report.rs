// ABOUTME: Report stage synthesizing the scan report from accumulated facts
// ABOUTME: Optionally persists the report as JSON under a configured directory

use crate::error::{PipelineError, Result};
use crate::model::{ScanFacts, StageKind};
use crate::report::ScanReport;
use crate::runner::{Stage, StageContext};
use async_trait::async_trait;
use recon_sandbox::LogLevel;
use std::path::PathBuf;

pub struct ReportStage {
    output_dir: Option<PathBuf>,
}

impl ReportStage {
    pub fn new(output_dir: Option<PathBuf>) -> Self {
        Self { output_dir }
    }

    async fn persist(&self, report: &ScanReport) -> Result<()> {
        let Some(dir) = &self.output_dir else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(report)
            .map_err(|e| PipelineError::Report(e.to_string()))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| PipelineError::Report(format!("{}: {}", dir.display(), e)))?;
        let path = dir.join(format!("{}.json", report.scan_run_id));
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| PipelineError::Report(format!("{}: {}", path.display(), e)))
    }
}

#[async_trait]
impl Stage for ReportStage {
    fn kind(&self) -> StageKind {
        StageKind::Report
    }

    async fn run(&self, ctx: &StageContext<'_>, facts: &mut ScanFacts) -> Result<()> {
        let report = ScanReport::from_facts(ctx.scan_run_id, ctx.target, facts);
        ctx.log(LogLevel::Info, report.summary()).await;
        let persisted = self.persist(&report).await;
        facts.report = Some(report);
        persisted
    }
}
