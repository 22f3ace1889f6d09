// ABOUTME: End-to-end scheduler tests against the in-memory container runtime
// ABOUTME: Cover branching on open web ports, failure, cancellation, recovery, and report persistence

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use recon_config::ReconConfig;
use recon_pipeline::events::{
    PORT_SCAN_REQUESTED, REPORT_REQUESTED, SCAN_CANCELLED, SCAN_COMPLETED, SCAN_FAILED,
    VULN_SCAN_REQUESTED,
};
use recon_pipeline::stages::InfoGatherStage;
use recon_pipeline::{
    BroadcastTriggerBus, MemoryRunStatusStore, PipelineError, PipelineScheduler, RunOutcome,
    RunStatusStore, ScanFacts, Stage, StageContext, StageKind, StageSettings, StageState,
    TriggerEvent,
};
use recon_sandbox::testing::{FakeRuntime, ScriptedExec};
use recon_sandbox::{
    CommandExecutor, MemoryLogSink, RecoveringExecutor, RunStatus, RunStatusSource,
    RuntimeError, SessionConfig, SessionManager, SinkError,
};
use std::sync::Arc;
use tokio::sync::broadcast;

const TOP_PORTS_80_443: &str = "\
PORT    STATE SERVICE
80/tcp  open  http
443/tcp open  https
";

const SERVICE_SCAN_80_443: &str = "\
PORT    STATE SERVICE  VERSION
80/tcp  open  http     nginx 1.18.0
443/tcp open  ssl/http nginx 1.18.0
";

const NUCLEI_HTTP: &str = r#"{"template-id":"tech-detect","info":{"name":"Nginx Detection","severity":"info"},"matched-at":"http://example.com"}
{"template-id":"http-missing-security-headers","info":{"name":"HTTP Missing Security Headers","severity":"low"},"matched-at":"http://example.com"}
"#;

struct Harness {
    runtime: Arc<FakeRuntime>,
    store: Arc<MemoryRunStatusStore>,
    sink: Arc<MemoryLogSink>,
    bus: Arc<BroadcastTriggerBus>,
    events: broadcast::Receiver<TriggerEvent>,
}

impl Harness {
    fn new() -> Self {
        let bus = Arc::new(BroadcastTriggerBus::default());
        let events = bus.subscribe();
        Self {
            runtime: Arc::new(FakeRuntime::new()),
            store: Arc::new(MemoryRunStatusStore::new()),
            sink: Arc::new(MemoryLogSink::new()),
            bus,
            events,
        }
    }

    fn scheduler(&self) -> PipelineScheduler {
        self.scheduler_with(StageSettings::default())
    }

    fn scheduler_with(&self, settings: StageSettings) -> PipelineScheduler {
        let sessions = Arc::new(SessionManager::new(
            self.runtime.clone(),
            SessionConfig::from_config(&ReconConfig::default()),
        ));
        let executor =
            CommandExecutor::new(sessions, self.sink.clone()).with_status_source(self.store.clone());
        PipelineScheduler::new(
            Arc::new(RecoveringExecutor::new(executor)),
            self.store.clone(),
            self.bus.clone(),
            self.sink.clone(),
            settings,
        )
    }

    fn script_web_target(&self) {
        self.runtime
            .script("--top-ports 1000", ScriptedExec::stdout(TOP_PORTS_80_443));
        self.runtime
            .script("nmap -sV", ScriptedExec::stdout(SERVICE_SCAN_80_443));
        self.runtime.script(
            "gobuster",
            ScriptedExec::stdout("/admin                (Status: 301) [Size: 178]\n"),
        );
        self.runtime
            .script("-u http://example.com ", ScriptedExec::stdout(NUCLEI_HTTP));
    }

    fn event_names(&mut self) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            names.push(event.name);
        }
        names
    }

    fn execs_containing(&self, needle: &str) -> usize {
        self.runtime
            .execs()
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }
}

#[tokio::test]
async fn test_full_scan_of_web_target() {
    let mut h = Harness::new();
    h.script_web_target();

    let run = h.scheduler().run("scan-e2e", "example.com").await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Completed { partial: false }));
    assert!(run.all_done());
    assert_eq!(run.progress, 100);
    assert_eq!(run.facts.candidate_ports, vec![80, 443]);
    assert_eq!(run.facts.open_ports(), vec![80, 443]);
    assert_eq!(run.facts.directories.len(), 1);
    assert_eq!(run.facts.findings.len(), 2);
    assert_eq!(run.facts.report.as_ref().map(|r| r.finding_count()), Some(2));

    assert_eq!(h.execs_containing("nmap -sV -Pn -p 80,443 example.com"), 1);
    assert_eq!(h.execs_containing("gobuster dir -u http://example.com -w"), 1);
    assert_eq!(h.execs_containing("nuclei -u http://example.com -jsonl"), 1);
    assert_eq!(h.execs_containing("nuclei -u https://example.com -jsonl"), 1);

    assert_eq!(
        h.event_names(),
        vec![
            PORT_SCAN_REQUESTED,
            VULN_SCAN_REQUESTED,
            REPORT_REQUESTED,
            SCAN_COMPLETED
        ]
    );
    assert_eq!(
        h.store.entry("scan-e2e").map(|e| e.status),
        Some(RunStatus::Completed)
    );
    assert!(!h.runtime.exists("recon-scan-scan-e2e"));
    assert_eq!(h.runtime.create_count(), 1);
}

#[tokio::test]
async fn test_completion_event_carries_totals() {
    let h = Harness::new();
    h.script_web_target();
    let mut events = h.bus.subscribe();

    h.scheduler().run("scan-totals", "example.com").await.unwrap();

    let mut completed = None;
    while let Ok(event) = events.try_recv() {
        if event.name == SCAN_COMPLETED {
            completed = Some(event.payload);
        }
    }
    let payload = completed.unwrap();
    assert_eq!(payload["findings"], 2);
    assert_eq!(payload["open_ports"], serde_json::json!([80, 443]));
    assert_eq!(payload["partial"], false);
}

#[tokio::test]
async fn test_vuln_scan_runs_when_a_web_port_is_open() {
    let mut h = Harness::new();
    h.runtime.script(
        "--top-ports 1000",
        ScriptedExec::stdout("22/tcp open ssh\n80/tcp open http\n"),
    );
    h.runtime.script(
        "nmap -sV",
        ScriptedExec::stdout("22/tcp open ssh OpenSSH 8.9\n80/tcp open http nginx\n"),
    );

    let run = h.scheduler().run("scan-web", "example.com").await.unwrap();

    assert_eq!(run.status(StageKind::VulnScan).state, StageState::Done);
    assert!(run.skip_record(StageKind::VulnScan).is_none());
    assert_eq!(h.execs_containing("nuclei"), 1);
    assert!(h.event_names().contains(&VULN_SCAN_REQUESTED.to_string()));
}

#[tokio::test]
async fn test_vuln_handoff_carries_all_open_ports() {
    let h = Harness::new();
    h.runtime.script(
        "--top-ports 1000",
        ScriptedExec::stdout("22/tcp open ssh\n80/tcp open http\n"),
    );
    h.runtime.script(
        "nmap -sV",
        ScriptedExec::stdout("22/tcp open ssh OpenSSH 8.9\n80/tcp open http nginx\n"),
    );
    let mut events = h.bus.subscribe();

    h.scheduler().run("scan-handoff", "example.com").await.unwrap();

    let mut handoff = None;
    while let Ok(event) = events.try_recv() {
        if event.name == VULN_SCAN_REQUESTED {
            handoff = Some(event.payload);
        }
    }
    let payload = handoff.unwrap();
    assert_eq!(payload["open_ports"], serde_json::json!([22, 80]));
    assert_eq!(payload["web_ports"], serde_json::json!([80]));
}

#[tokio::test]
async fn test_vuln_scan_skipped_without_web_ports() {
    let mut h = Harness::new();
    h.runtime
        .script("--top-ports 1000", ScriptedExec::stdout("22/tcp open ssh\n"));
    h.runtime.script(
        "nmap -sV",
        ScriptedExec::stdout("22/tcp open ssh OpenSSH 8.9\n"),
    );

    let run = h.scheduler().run("scan-ssh", "example.com").await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Completed { partial: false }));
    assert_eq!(run.status(StageKind::VulnScan).state, StageState::Done);
    let skip = run.skip_record(StageKind::VulnScan).unwrap();
    assert!(skip.reason.contains("22"));
    assert_eq!(h.execs_containing("nuclei"), 0);
    assert_eq!(h.execs_containing("gobuster"), 0);

    let names = h.event_names();
    assert!(!names.contains(&VULN_SCAN_REQUESTED.to_string()));
    assert_eq!(names.last().map(String::as_str), Some(SCAN_COMPLETED));

    let report = run.facts.report.unwrap();
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(h.sink.matching("Skipped: no open web service ports").len(), 1);
}

#[tokio::test]
async fn test_stage_error_fails_scan_and_kills_sandbox() {
    let mut h = Harness::new();
    h.script_web_target();
    h.runtime.fail_execs_containing(
        "nmap -sV",
        RuntimeError::Api {
            status: 500,
            message: "exec create failed".into(),
        },
    );

    let run = h.scheduler().run("scan-fail", "example.com").await.unwrap();

    assert!(matches!(
        run.outcome,
        Some(RunOutcome::Failed {
            stage: Some(StageKind::PortScan),
            ..
        })
    ));
    assert_eq!(run.status(StageKind::InfoGather).state, StageState::Done);
    assert_eq!(run.status(StageKind::PortScan).state, StageState::Failed);
    assert_eq!(run.status(StageKind::VulnScan).state, StageState::Pending);
    assert_eq!(run.status(StageKind::Report).state, StageState::Pending);

    let entry = h.store.entry("scan-fail").unwrap();
    assert_eq!(entry.status, RunStatus::Failed);
    assert!(entry.message.unwrap().starts_with("port-scan failed"));
    assert!(!h.runtime.exists("recon-scan-scan-fail"));
    assert_eq!(h.event_names().last().map(String::as_str), Some(SCAN_FAILED));
    assert_eq!(h.execs_containing("nuclei"), 0);
}

#[tokio::test]
async fn test_sandbox_start_failure_is_initialization_error() {
    let mut h = Harness::new();
    h.runtime
        .fail_creates(RuntimeError::Image("manifest unknown".into()));

    let err = h
        .scheduler()
        .run("scan-init", "example.com")
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Initialization(_)));
    assert_eq!(
        h.store.entry("scan-init").map(|e| e.status),
        Some(RunStatus::Failed)
    );
    assert_eq!(h.event_names(), vec![SCAN_FAILED]);
    assert!(h.runtime.execs().is_empty());
}

#[tokio::test]
async fn test_unstarted_sandbox_is_removed_on_initialization_failure() {
    let mut h = Harness::new();
    h.runtime.fail_starts(RuntimeError::Api {
        status: 500,
        message: "cannot start container".into(),
    });

    let err = h
        .scheduler()
        .run("scan-unstarted", "example.com")
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Initialization(_)));
    assert_eq!(h.runtime.create_count(), 1);
    assert!(!h.runtime.exists("recon-scan-scan-unstarted"));
    assert_eq!(h.runtime.removed(), vec!["recon-scan-scan-unstarted".to_string()]);
    assert_eq!(h.event_names(), vec![SCAN_FAILED]);
}

#[tokio::test]
async fn test_invalid_target_never_touches_runtime() {
    let h = Harness::new();

    let err = h
        .scheduler()
        .run("scan-bad", "example.com;id")
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::InvalidTarget(_)));
    assert_eq!(h.runtime.create_count(), 0);
    assert!(h.store.entry("scan-bad").is_none());
}

/// Info-gather replacement that flips the run to cancelled.
struct CancellingStage {
    store: Arc<MemoryRunStatusStore>,
}

#[async_trait]
impl Stage for CancellingStage {
    fn kind(&self) -> StageKind {
        StageKind::InfoGather
    }

    async fn run(&self, ctx: &StageContext<'_>, _facts: &mut ScanFacts) -> recon_pipeline::Result<()> {
        self.store.cancel(ctx.scan_run_id);
        Ok(())
    }
}

#[tokio::test]
async fn test_cancellation_between_stages() {
    let mut h = Harness::new();
    h.script_web_target();
    let scheduler = h.scheduler().with_stage(Arc::new(CancellingStage {
        store: h.store.clone(),
    }));

    let run = scheduler.run("scan-cancel", "example.com").await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Cancelled));
    assert_eq!(run.status(StageKind::PortScan).state, StageState::Pending);
    assert_eq!(
        h.store.entry("scan-cancel").map(|e| e.status),
        Some(RunStatus::Cancelled)
    );
    assert!(!h.runtime.exists("recon-scan-scan-cancel"));
    assert_eq!(h.execs_containing("nmap"), 0);
    assert_eq!(h.event_names().last().map(String::as_str), Some(SCAN_CANCELLED));
}

/// Info-gather that runs normally, then loses the sandbox out of band.
struct VanishingStage {
    runtime: Arc<FakeRuntime>,
}

#[async_trait]
impl Stage for VanishingStage {
    fn kind(&self) -> StageKind {
        StageKind::InfoGather
    }

    async fn run(&self, ctx: &StageContext<'_>, facts: &mut ScanFacts) -> recon_pipeline::Result<()> {
        InfoGatherStage.run(ctx, facts).await?;
        self.runtime
            .drop_container(&format!("recon-scan-{}", ctx.scan_run_id));
        Ok(())
    }
}

#[tokio::test]
async fn test_lost_sandbox_is_respawned_mid_scan() {
    let h = Harness::new();
    h.script_web_target();
    let scheduler = h.scheduler().with_stage(Arc::new(VanishingStage {
        runtime: h.runtime.clone(),
    }));

    let run = scheduler.run("scan-lost", "example.com").await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Completed { partial: false }));
    assert_eq!(h.runtime.create_count(), 2);
    assert_eq!(h.sink.matching("recovering session").len(), 1);
    assert_eq!(run.facts.findings.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_hung_tool_times_out_and_scan_is_partial() {
    let h = Harness::new();
    h.script_web_target();
    h.runtime
        .script("-u https://example.com ", ScriptedExec::hanging());

    let run = h.scheduler().run("scan-hang", "example.com").await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Completed { partial: true }));
    assert_eq!(run.facts.degraded_tools, vec!["nuclei".to_string()]);
    assert_eq!(run.facts.findings.len(), 2);
    assert_eq!(h.runtime.kill_exec_count(), 1);
    assert_eq!(h.sink.matching("nuclei timed out, continuing").len(), 1);
}

#[tokio::test]
async fn test_report_written_to_configured_directory() {
    let h = Harness::new();
    h.script_web_target();
    let dir = tempfile::tempdir().unwrap();
    let settings = StageSettings::default().with_report_dir(dir.path().join("reports"));

    h.scheduler_with(settings)
        .run("scan-report", "example.com")
        .await
        .unwrap();

    let written = std::fs::read_to_string(dir.path().join("reports/scan-report.json")).unwrap();
    let report: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert_eq!(report["scan_run_id"], "scan-report");
    assert_eq!(report["findings"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn test_unwritable_report_completes_partial() {
    let h = Harness::new();
    h.script_web_target();
    let file = tempfile::NamedTempFile::new().unwrap();
    let settings = StageSettings::default().with_report_dir(file.path().join("reports"));

    let run = h
        .scheduler_with(settings)
        .run("scan-unwritable", "example.com")
        .await
        .unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Completed { partial: true }));
    assert_eq!(run.status(StageKind::Report).state, StageState::Failed);
    assert!(run.facts.report.is_some());
    assert!(!h.runtime.exists("recon-scan-scan-unwritable"));
}

mockall::mock! {
    Status {}

    #[async_trait]
    impl RunStatusSource for Status {
        async fn run_status(&self, scan_run_id: &str) -> Result<Option<RunStatus>, SinkError>;
    }

    #[async_trait]
    impl RunStatusStore for Status {
        async fn set_status(
            &self,
            scan_run_id: &str,
            status: RunStatus,
            message: Option<String>,
        ) -> Result<(), SinkError>;
    }
}

#[tokio::test]
async fn test_status_store_errors_do_not_abort_scan() {
    let h = Harness::new();
    h.script_web_target();

    let mut status = MockStatus::new();
    status
        .expect_run_status()
        .returning(|_| Err(SinkError::Lookup("database unavailable".into())));
    status
        .expect_set_status()
        .withf(|id, status, _| id == "scan-mock" && *status == RunStatus::Running)
        .times(1)
        .returning(|_, _, _| Err(SinkError::Lookup("database unavailable".into())));
    status
        .expect_set_status()
        .withf(|id, status, message| {
            id == "scan-mock"
                && *status == RunStatus::Completed
                && message.as_deref() == Some("completed")
        })
        .times(1)
        .returning(|_, _, _| Ok(()));

    let sessions = Arc::new(SessionManager::new(
        h.runtime.clone(),
        SessionConfig::from_config(&ReconConfig::default()),
    ));
    let executor = CommandExecutor::new(sessions, h.sink.clone());
    let scheduler = PipelineScheduler::new(
        Arc::new(RecoveringExecutor::new(executor)),
        Arc::new(status),
        h.bus.clone(),
        h.sink.clone(),
        StageSettings::default(),
    );

    let run = scheduler.run("scan-mock", "example.com").await.unwrap();

    assert_eq!(run.outcome, Some(RunOutcome::Completed { partial: false }));
}
