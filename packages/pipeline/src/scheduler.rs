// ABOUTME: Pipeline scheduler driving stages through the transition function for one scan
// ABOUTME: Owns session startup, stage handoff events, and the failure, cancel, and finalize paths

use crate::error::{PipelineError, Result};
use crate::events::{
    TriggerBus, TriggerEvent, PORT_SCAN_REQUESTED, REPORT_REQUESTED, SCAN_CANCELLED,
    SCAN_COMPLETED, SCAN_FAILED, VULN_SCAN_REQUESTED,
};
use crate::fsm::{open_web_ports, transition, Transition};
use crate::model::{PipelineRun, RunOutcome, StageKind};
use crate::runner::{Stage, StageRunner};
use crate::stages::{standard_stages, StageSettings};
use crate::status::RunStatusStore;
use recon_sandbox::{write_log, LogLevel, RunStatus, ScanLogSink, SessionManager, ToolRunner};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

const MAX_TARGET_LEN: usize = 253;

/// Reject targets that are not a plain host name or address.
pub fn validate_target(target: &str) -> Result<()> {
    let valid = !target.is_empty()
        && target.len() <= MAX_TARGET_LEN
        && !target.starts_with('-')
        && target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'));
    if valid {
        Ok(())
    } else {
        Err(PipelineError::InvalidTarget(target.to_string()))
    }
}

pub struct PipelineScheduler {
    runner: StageRunner,
    sessions: Arc<SessionManager>,
    status: Arc<dyn RunStatusStore>,
    bus: Arc<dyn TriggerBus>,
    stages: [Arc<dyn Stage>; 4],
}

impl PipelineScheduler {
    pub fn new(
        tools: Arc<dyn ToolRunner>,
        status: Arc<dyn RunStatusStore>,
        bus: Arc<dyn TriggerBus>,
        sink: Arc<dyn ScanLogSink>,
        settings: StageSettings,
    ) -> Self {
        let sessions = Arc::clone(tools.sessions());
        let stages = standard_stages(&settings);
        Self {
            runner: StageRunner::new(tools, settings.timeouts, sink),
            sessions,
            status,
            bus,
            stages,
        }
    }

    /// Replace the implementation of one stage.
    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        let index = stage.kind().index();
        self.stages[index] = stage;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Run a scan end to end. Only a sandbox that cannot be started at all
    /// (or an invalid target) is an error; every other ending is recorded in
    /// the returned run's outcome.
    pub async fn run(&self, scan_run_id: &str, target: &str) -> Result<PipelineRun> {
        validate_target(target)?;

        let mut run = PipelineRun::new(scan_run_id, target);
        self.set_status(scan_run_id, RunStatus::Running, None).await;
        info!("Starting scan {} against {}", scan_run_id, target);

        if let Err(e) = self.sessions.start_session(scan_run_id).await {
            let cause = e.to_string();
            error!("Scan {} could not start: {}", scan_run_id, cause);
            self.sessions.kill_container(scan_run_id).await;
            self.set_status(scan_run_id, RunStatus::Failed, Some(cause.clone()))
                .await;
            self.bus
                .emit(TriggerEvent::new(
                    SCAN_FAILED,
                    json!({ "scan_run_id": scan_run_id, "stage": null, "cause": cause }),
                ))
                .await;
            return Err(PipelineError::Initialization(e));
        }

        let mut current = None;
        loop {
            if self.is_cancelled(scan_run_id).await {
                return Ok(self.cancel(run).await);
            }

            match transition(current, &run.facts) {
                Transition::Run(stage) => {
                    self.emit_handoff(stage, &run).await;
                    let implementation = Arc::clone(&self.stages[stage.index()]);
                    match self.runner.run_stage(implementation.as_ref(), &mut run).await {
                        Ok(()) => current = Some(stage),
                        Err(PipelineError::Cancelled(_)) => return Ok(self.cancel(run).await),
                        Err(e) if stage == StageKind::Report => {
                            warn!("Report for scan {} incomplete: {}", scan_run_id, e);
                            return Ok(self.finalize(run, true).await);
                        }
                        Err(e) => return Ok(self.fail(run, stage, e).await),
                    }
                }
                Transition::Skip { stage, reason } => {
                    info!("Scan {} skipping {}: {}", scan_run_id, stage, reason);
                    write_log(
                        self.runner.sink().as_ref(),
                        scan_run_id,
                        LogLevel::Info,
                        stage.label(),
                        format!("Skipped: {}", reason),
                    )
                    .await;
                    run.skip(stage, reason);
                    current = Some(stage);
                }
                Transition::Finish => break,
            }
        }

        let partial = !run.facts.degraded_tools.is_empty();
        Ok(self.finalize(run, partial).await)
    }

    async fn emit_handoff(&self, stage: StageKind, run: &PipelineRun) {
        let (name, payload) = match stage {
            StageKind::InfoGather => return,
            StageKind::PortScan => (
                PORT_SCAN_REQUESTED,
                json!({
                    "scan_run_id": run.scan_run_id,
                    "target": run.target,
                    "candidate_ports": run.facts.candidate_ports,
                }),
            ),
            StageKind::VulnScan => (
                VULN_SCAN_REQUESTED,
                json!({
                    "scan_run_id": run.scan_run_id,
                    "target": run.target,
                    "open_ports": run.facts.open_ports(),
                    "web_ports": open_web_ports(&run.facts),
                    "directories": run.facts.directories,
                }),
            ),
            StageKind::Report => (
                REPORT_REQUESTED,
                json!({
                    "scan_run_id": run.scan_run_id,
                    "skipped": run.facts.skipped,
                }),
            ),
        };
        self.bus.emit(TriggerEvent::new(name, payload)).await;
    }

    async fn is_cancelled(&self, scan_run_id: &str) -> bool {
        match self.status.run_status(scan_run_id).await {
            Ok(status) => status == Some(RunStatus::Cancelled),
            Err(e) => {
                warn!("Status lookup for scan {} failed: {}", scan_run_id, e);
                false
            }
        }
    }

    async fn set_status(&self, scan_run_id: &str, status: RunStatus, message: Option<String>) {
        if let Err(e) = self.status.set_status(scan_run_id, status, message).await {
            warn!("Failed to record {:?} for scan {}: {}", status, scan_run_id, e);
        }
    }

    async fn finalize(&self, mut run: PipelineRun, partial: bool) -> PipelineRun {
        let id = run.scan_run_id.clone();
        if let Err(e) = self.sessions.end_session(&id).await {
            warn!("Session teardown for scan {} failed: {}", id, e);
        }

        let outcome = RunOutcome::Completed { partial };
        self.set_status(&id, RunStatus::Completed, Some(outcome.to_string()))
            .await;
        let findings = run
            .facts
            .report
            .as_ref()
            .map(|r| r.finding_count())
            .unwrap_or(run.facts.findings.len());
        self.bus
            .emit(TriggerEvent::new(
                SCAN_COMPLETED,
                json!({
                    "scan_run_id": id,
                    "partial": partial,
                    "findings": findings,
                    "open_ports": run.facts.open_ports(),
                }),
            ))
            .await;
        info!("Scan {} {}", id, outcome);
        run.finish(outcome);
        run
    }

    async fn fail(&self, mut run: PipelineRun, stage: StageKind, error: PipelineError) -> PipelineRun {
        let id = run.scan_run_id.clone();
        let cause = error.to_string();

        self.set_status(
            &id,
            RunStatus::Failed,
            Some(format!("{} failed: {}", stage, cause)),
        )
        .await;
        self.sessions.kill_container(&id).await;
        self.bus
            .emit(TriggerEvent::new(
                SCAN_FAILED,
                json!({ "scan_run_id": id, "stage": stage, "cause": cause }),
            ))
            .await;

        run.finish(RunOutcome::Failed {
            stage: Some(stage),
            cause,
        });
        run
    }

    async fn cancel(&self, mut run: PipelineRun) -> PipelineRun {
        let id = run.scan_run_id.clone();
        info!("Scan {} cancelled", id);

        self.sessions.kill_container(&id).await;
        self.set_status(&id, RunStatus::Cancelled, None).await;
        self.bus
            .emit(TriggerEvent::new(SCAN_CANCELLED, json!({ "scan_run_id": id })))
            .await;

        run.finish(RunOutcome::Cancelled);
        run
    }
}
