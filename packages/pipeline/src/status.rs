// ABOUTME: Run status store combining the cancellation lookup with terminal status writes
// ABOUTME: In-memory implementation used by the CLI and tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_sandbox::{RunStatus, RunStatusSource, SinkError};
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait RunStatusStore: RunStatusSource {
    async fn set_status(
        &self,
        scan_run_id: &str,
        status: RunStatus,
        message: Option<String>,
    ) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusEntry {
    pub status: RunStatus,
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MemoryRunStatusStore {
    entries: Mutex<HashMap<String, StatusEntry>>,
}

impl MemoryRunStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, scan_run_id: &str) -> Option<StatusEntry> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(scan_run_id).cloned())
    }

    /// Request cooperative cancellation of a scan.
    pub fn cancel(&self, scan_run_id: &str) {
        self.put(scan_run_id, RunStatus::Cancelled, Some("cancelled by user".into()));
    }

    fn put(&self, scan_run_id: &str, status: RunStatus, message: Option<String>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                scan_run_id.to_string(),
                StatusEntry {
                    status,
                    message,
                    updated_at: Utc::now(),
                },
            );
        }
    }
}

#[async_trait]
impl RunStatusSource for MemoryRunStatusStore {
    async fn run_status(&self, scan_run_id: &str) -> Result<Option<RunStatus>, SinkError> {
        Ok(self.entry(scan_run_id).map(|e| e.status))
    }
}

#[async_trait]
impl RunStatusStore for MemoryRunStatusStore {
    async fn set_status(
        &self,
        scan_run_id: &str,
        status: RunStatus,
        message: Option<String>,
    ) -> Result<(), SinkError> {
        self.put(scan_run_id, status, message);
        Ok(())
    }
}
