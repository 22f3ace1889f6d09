// ABOUTME: Wires the container runtime, session manager, executors, and scheduler into one engine
// ABOUTME: Shared by the scan and cleanup commands; the runtime is injectable for tests

use anyhow::Context;
use recon_config::ReconConfig;
use recon_pipeline::{
    BroadcastTriggerBus, MemoryRunStatusStore, PipelineRun, PipelineScheduler, StageSettings,
};
use recon_sandbox::{
    CommandExecutor, ContainerRuntime, DockerProvider, JsonlLogSink, RecoveringExecutor,
    RuntimeError, ScanLogSink, SessionConfig, SessionManager, TracingLogSink,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct Engine {
    config: ReconConfig,
    sessions: Arc<SessionManager>,
    status: Arc<MemoryRunStatusStore>,
    bus: Arc<BroadcastTriggerBus>,
    scheduler: PipelineScheduler,
}

impl Engine {
    /// Build an engine backed by the local Docker daemon.
    pub fn connect(config: ReconConfig, report_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let runtime = DockerProvider::new().context("Failed to connect to the Docker daemon")?;
        Ok(Self::with_runtime(config, Arc::new(runtime), report_dir))
    }

    pub fn with_runtime(
        config: ReconConfig,
        runtime: Arc<dyn ContainerRuntime>,
        report_dir: Option<PathBuf>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(
            runtime,
            SessionConfig::from_config(&config),
        ));
        let status = Arc::new(MemoryRunStatusStore::new());
        let bus = Arc::new(BroadcastTriggerBus::default());
        let sink = scan_log_sink(&config);

        let executor = CommandExecutor::new(Arc::clone(&sessions), Arc::clone(&sink))
            .with_status_source(status.clone())
            .with_log_cap(config.stdout_log_cap_bytes);

        let mut settings = StageSettings::from_config(&config);
        if let Some(dir) = report_dir {
            settings = settings.with_report_dir(dir);
        }

        let scheduler = PipelineScheduler::new(
            Arc::new(RecoveringExecutor::new(executor)),
            status.clone(),
            bus.clone(),
            sink,
            settings,
        );

        Self {
            config,
            sessions,
            status,
            bus,
            scheduler,
        }
    }

    pub fn config(&self) -> &ReconConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn status(&self) -> &Arc<MemoryRunStatusStore> {
        &self.status
    }

    pub fn bus(&self) -> &Arc<BroadcastTriggerBus> {
        &self.bus
    }

    pub async fn scan(&self, scan_run_id: &str, target: &str) -> recon_pipeline::Result<PipelineRun> {
        self.scheduler.run(scan_run_id, target).await
    }

    /// Ask a running scan to stop and tear down its sandbox right away.
    pub async fn interrupt(&self, scan_run_id: &str) {
        info!("Cancelling scan {}", scan_run_id);
        self.status.cancel(scan_run_id);
        self.sessions.kill_container(scan_run_id).await;
    }

    /// Force-kill a scan's sandbox. Returns false when no sandbox exists.
    pub async fn cleanup(&self, scan_run_id: &str) -> Result<bool, RuntimeError> {
        let name = self.sessions.config().container_name(scan_run_id);
        if self.sessions.runtime().inspect(&name).await?.is_none() {
            debug!("No sandbox named {}", name);
            return Ok(false);
        }
        self.sessions.kill_container(scan_run_id).await;
        Ok(true)
    }
}

/// JSONL file sink when a scan log path is configured, tracing otherwise.
pub fn scan_log_sink(config: &ReconConfig) -> Arc<dyn ScanLogSink> {
    match &config.scan_log_path {
        Some(path) => Arc::new(JsonlLogSink::new(path)),
        None => Arc::new(TracingLogSink),
    }
}

pub fn new_run_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("scan-{}", &id[..12])
}
