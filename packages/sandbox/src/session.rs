// ABOUTME: Per-scan container session manager owning the scan run to container mapping
// ABOUTME: Creates, adopts, verifies, respawns, and tears down one privileged sandbox per scan

use crate::providers::{ContainerRuntime, ContainerSpec, RuntimeError};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use recon_config::ReconConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Labels applied to every recon sandbox for tracking
pub const RECON_LABEL: &str = "recon.managed";
pub const RECON_SCAN_RUN_LABEL: &str = "recon.scan_run_id";
pub const RECON_MODE_LABEL: &str = "recon.mode";

/// Capabilities raw-socket scanners (SYN scans, OS detection) need.
const NETWORK_CAPABILITIES: &[&str] = &["NET_ADMIN", "NET_RAW"];

/// No-op entry command that keeps a session container alive indefinitely.
const KEEP_ALIVE_COMMAND: &[&str] = &["tail", "-f", "/dev/null"];

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to start sandbox for scan {scan_run_id}: {source}")]
    StartFailed {
        scan_run_id: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Failed to tear down sandbox for scan {scan_run_id}: {source}")]
    TeardownFailed {
        scan_run_id: String,
        #[source]
        source: RuntimeError,
    },
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Absent,
    Starting,
    Running,
    Stale,
    Terminated,
}

/// A live sandbox bound to one scan run.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSession {
    pub scan_run_id: String,
    pub container_name: String,
    pub container_id: String,
    pub adopted: bool,
    pub started_at: DateTime<Utc>,
}

/// Image and resource settings for sandbox containers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub image: String,
    pub name_prefix: String,
    pub memory_mb: u64,
    pub cpu_shares: i64,
}

impl SessionConfig {
    pub fn from_config(config: &ReconConfig) -> Self {
        Self {
            image: config.sandbox_image.clone(),
            name_prefix: config.container_prefix.clone(),
            memory_mb: config.memory_mb,
            cpu_shares: config.cpu_shares,
        }
    }

    /// Deterministic session container name for a scan run.
    pub fn container_name(&self, scan_run_id: &str) -> String {
        format!("{}{}", self.name_prefix, scan_run_id)
    }

    pub fn session_spec(&self, scan_run_id: &str) -> ContainerSpec {
        self.spec(
            self.container_name(scan_run_id),
            scan_run_id,
            "session",
            KEEP_ALIVE_COMMAND.iter().map(|s| s.to_string()).collect(),
        )
    }

    /// Spec for a single-use container that runs `command` and exits.
    pub fn ephemeral_spec(&self, scan_run_id: &str, command: &str) -> ContainerSpec {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        self.spec(
            format!("{}-eph-{}", self.container_name(scan_run_id), &suffix[..8]),
            scan_run_id,
            "ephemeral",
            vec!["sh".to_string(), "-c".to_string(), command.to_string()],
        )
    }

    fn spec(&self, name: String, scan_run_id: &str, mode: &str, command: Vec<String>) -> ContainerSpec {
        ContainerSpec {
            name,
            image: self.image.clone(),
            command,
            memory_mb: self.memory_mb,
            cpu_shares: self.cpu_shares,
            cap_add: NETWORK_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            labels: HashMap::from([
                (RECON_LABEL.to_string(), "true".to_string()),
                (RECON_SCAN_RUN_LABEL.to_string(), scan_run_id.to_string()),
                (RECON_MODE_LABEL.to_string(), mode.to_string()),
            ]),
        }
    }
}

#[derive(Debug)]
struct SessionSlot {
    session: Option<ContainerSession>,
    state: SessionState,
}

impl Default for SessionSlot {
    fn default() -> Self {
        Self {
            session: None,
            state: SessionState::Absent,
        }
    }
}

/// Sole owner of the scan run to sandbox mapping.
///
/// Every mutation for a given scan run happens while holding that run's slot
/// lock, so concurrent callers for the same id observe a single container.
pub struct SessionManager {
    runtime: Arc<dyn ContainerRuntime>,
    config: SessionConfig,
    slots: Mutex<HashMap<String, Arc<Mutex<SessionSlot>>>>,
}

impl SessionManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SessionConfig) -> Self {
        Self {
            runtime,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        Arc::clone(&self.runtime)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    async fn slot(&self, scan_run_id: &str) -> Arc<Mutex<SessionSlot>> {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(scan_run_id.to_string()).or_default())
    }

    async fn existing_slot(&self, scan_run_id: &str) -> Option<Arc<Mutex<SessionSlot>>> {
        let slots = self.slots.lock().await;
        slots.get(scan_run_id).cloned()
    }

    /// Obtain the scan's sandbox: reuse the remembered one, adopt a running
    /// container with the deterministic name, or create a fresh one.
    pub async fn start_session(&self, scan_run_id: &str) -> Result<ContainerSession> {
        let slot = self.slot(scan_run_id).await;
        let mut guard = slot.lock().await;
        self.start_locked(scan_run_id, &mut guard).await
    }

    async fn start_locked(
        &self,
        scan_run_id: &str,
        slot: &mut SessionSlot,
    ) -> Result<ContainerSession> {
        if let Some(session) = &slot.session {
            debug!("Reusing sandbox {} for scan {}", session.container_name, scan_run_id);
            return Ok(session.clone());
        }

        slot.state = SessionState::Starting;
        let name = self.config.container_name(scan_run_id);

        match self.create_or_adopt(scan_run_id, &name).await {
            Ok(session) => {
                slot.session = Some(session.clone());
                slot.state = SessionState::Running;
                Ok(session)
            }
            Err(source) => {
                error!("Failed to start sandbox {} for scan {}: {}", name, scan_run_id, source);
                slot.state = SessionState::Absent;
                Err(SessionError::StartFailed {
                    scan_run_id: scan_run_id.to_string(),
                    source,
                })
            }
        }
    }

    async fn create_or_adopt(
        &self,
        scan_run_id: &str,
        name: &str,
    ) -> std::result::Result<ContainerSession, RuntimeError> {
        if let Some(existing) = self.runtime.inspect(name).await? {
            if existing.running {
                info!("Adopting running sandbox {} for scan {}", name, scan_run_id);
                return Ok(ContainerSession {
                    scan_run_id: scan_run_id.to_string(),
                    container_name: name.to_string(),
                    container_id: existing.id,
                    adopted: true,
                    started_at: Utc::now(),
                });
            }
            info!("Removing stopped sandbox {} before recreating", name);
            self.runtime.remove(name, true).await?;
        }

        let spec = self.config.session_spec(scan_run_id);
        let container_id = self.runtime.create_and_start(&spec).await?;
        info!("Started sandbox {} ({}) for scan {}", name, container_id, scan_run_id);

        Ok(ContainerSession {
            scan_run_id: scan_run_id.to_string(),
            container_name: name.to_string(),
            container_id,
            adopted: false,
            started_at: Utc::now(),
        })
    }

    /// Verify the remembered sandbox still answers, respawning it if it is
    /// gone. Returns true only when a working session exists afterwards.
    pub async fn ensure_session_alive(&self, scan_run_id: &str) -> bool {
        let slot = self.slot(scan_run_id).await;
        let mut guard = slot.lock().await;

        let Some(session) = guard.session.clone() else {
            return self.start_locked(scan_run_id, &mut guard).await.is_ok();
        };

        match self.probe(&session.container_name).await {
            Ok(()) => return true,
            Err(e) if e.is_container_gone() => {
                warn!(
                    "Sandbox {} for scan {} is gone ({}), respawning",
                    session.container_name, scan_run_id, e
                );
            }
            Err(e) => {
                error!(
                    "Liveness check for sandbox {} failed: {}",
                    session.container_name, e
                );
                return false;
            }
        }

        guard.session = None;
        guard.state = SessionState::Stale;
        if let Err(e) = self.runtime.remove(&session.container_name, true).await {
            debug!(
                "Best-effort removal of stale sandbox {} failed: {}",
                session.container_name, e
            );
        }

        self.start_locked(scan_run_id, &mut guard).await.is_ok()
    }

    async fn probe(&self, container: &str) -> std::result::Result<(), RuntimeError> {
        let mut attachment = self.runtime.exec(container, "true").await?;
        while let Some(chunk) = attachment.output.next().await {
            chunk?;
        }
        Ok(())
    }

    /// Kill and remove the scan's sandbox. The in-memory reference is always
    /// cleared, even when teardown fails.
    pub async fn end_session(&self, scan_run_id: &str) -> Result<()> {
        let name = self.config.container_name(scan_run_id);
        let torn_down = match self.existing_slot(scan_run_id).await {
            Some(slot) => {
                let mut guard = slot.lock().await;
                guard.session = None;
                guard.state = SessionState::Terminated;
                let torn_down = self.teardown(&name).await;
                self.release(scan_run_id, &slot).await;
                torn_down
            }
            None => self.teardown(&name).await,
        };

        torn_down.map_err(|source| {
            warn!("Teardown of sandbox {} failed: {}", name, source);
            SessionError::TeardownFailed {
                scan_run_id: scan_run_id.to_string(),
                source,
            }
        })?;
        info!("Ended session for scan {}", scan_run_id);
        Ok(())
    }

    /// Force-kill the scan's sandbox from a failure or cancellation path.
    /// Does not consult or wait on liveness and never returns an error.
    pub async fn kill_container(&self, scan_run_id: &str) {
        let name = self.config.container_name(scan_run_id);
        if let Err(e) = self.teardown(&name).await {
            warn!("Force kill of sandbox {} failed: {}", name, e);
        } else {
            info!("Force killed sandbox {} for scan {}", name, scan_run_id);
        }

        if let Some(slot) = self.existing_slot(scan_run_id).await {
            let mut guard = slot.lock().await;
            guard.session = None;
            guard.state = SessionState::Terminated;
            self.release(scan_run_id, &slot).await;
        }
    }

    /// Forget a terminated slot. Must be called while holding the slot lock;
    /// a slot another caller has already cloned stays in the map for it.
    async fn release(&self, scan_run_id: &str, slot: &Arc<Mutex<SessionSlot>>) {
        let mut slots = self.slots.lock().await;
        let unshared = slots
            .get(scan_run_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && Arc::strong_count(slot) == 2);
        if unshared {
            slots.remove(scan_run_id);
        }
    }

    /// Number of scan runs the manager currently tracks.
    pub async fn tracked_sessions(&self) -> usize {
        self.slots.lock().await.len()
    }

    async fn teardown(&self, name: &str) -> std::result::Result<(), RuntimeError> {
        match self.runtime.kill(name).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) | Err(RuntimeError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.runtime.remove(name, true).await
    }

    /// The live session handle, if one is known.
    pub async fn handle(&self, scan_run_id: &str) -> Option<ContainerSession> {
        let slot = self.existing_slot(scan_run_id).await?;
        let guard = slot.lock().await;
        guard.session.clone()
    }

    pub async fn state(&self, scan_run_id: &str) -> SessionState {
        match self.existing_slot(scan_run_id).await {
            Some(slot) => slot.lock().await.state,
            None => SessionState::Absent,
        }
    }

    /// Tear down every known session, e.g. on process shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = {
            let slots = self.slots.lock().await;
            slots.keys().cloned().collect()
        };
        for scan_run_id in ids {
            if self.handle(&scan_run_id).await.is_some() {
                info!("Shutting down session for scan {}", scan_run_id);
                self.kill_container(&scan_run_id).await;
            }
        }
    }
}
