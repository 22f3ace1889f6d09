// ABOUTME: Boundary contracts for scan log records and scan run status lookups
// ABOUTME: Provides tracing, in-memory, and JSONL log sinks plus the cancellation source trait

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error writing scan log: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize scan log record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Status lookup failed: {0}")]
    Lookup(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One append-only scan log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub scan_run_id: String,
    pub level: LogLevel,
    pub stage: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(
        scan_run_id: &str,
        level: LogLevel,
        stage: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            scan_run_id: scan_run_id.to_string(),
            level,
            stage: stage.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ScanLogSink: Send + Sync {
    async fn write(&self, record: LogRecord) -> Result<(), SinkError>;
}

/// Write to a sink, logging and swallowing any failure.
pub async fn write_log(
    sink: &dyn ScanLogSink,
    scan_run_id: &str,
    level: LogLevel,
    stage: &str,
    message: impl Into<String>,
) {
    let record = LogRecord::new(scan_run_id, level, stage, message);
    if let Err(e) = sink.write(record).await {
        warn!("Scan log write failed for {}: {}", scan_run_id, e);
    }
}

/// Forwards scan records to the process log.
#[derive(Debug, Default, Clone)]
pub struct TracingLogSink;

#[async_trait]
impl ScanLogSink for TracingLogSink {
    async fn write(&self, record: LogRecord) -> Result<(), SinkError> {
        let LogRecord {
            scan_run_id,
            level,
            stage,
            message,
            ..
        } = record;
        match level {
            LogLevel::Debug => debug!("[{}/{}] {}", scan_run_id, stage, message),
            LogLevel::Info => info!("[{}/{}] {}", scan_run_id, stage, message),
            LogLevel::Warn => warn!("[{}/{}] {}", scan_run_id, stage, message),
            LogLevel::Error => error!("[{}/{}] {}", scan_run_id, stage, message),
        }
        Ok(())
    }
}

/// Keeps records in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    records: StdMutex<Vec<LogRecord>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Records whose message contains `needle`.
    pub fn matching(&self, needle: &str) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.message.contains(needle))
            .collect()
    }
}

#[async_trait]
impl ScanLogSink for MemoryLogSink {
    async fn write(&self, record: LogRecord) -> Result<(), SinkError> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlLogSink {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl JsonlLogSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ScanLogSink for JsonlLogSink {
    async fn write(&self, record: LogRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(&line).await?;
            file.flush().await?;
        }
        Ok(())
    }
}

/// Externally visible status of a scan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Read-only status lookup polled before each tool invocation.
#[async_trait]
pub trait RunStatusSource: Send + Sync {
    async fn run_status(&self, scan_run_id: &str) -> Result<Option<RunStatus>, SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_collects_records() {
        let sink = MemoryLogSink::new();

        write_log(&sink, "run-1", LogLevel::Info, "port-scan", "nmap started").await;
        write_log(&sink, "run-1", LogLevel::Warn, "port-scan", "nmap slow").await;

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].level, LogLevel::Warn);
        assert_eq!(sink.matching("slow").len(), 1);
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.jsonl");
        let sink = JsonlLogSink::new(&path);

        write_log(&sink, "run-7", LogLevel::Info, "info-gather", "whois done").await;
        write_log(&sink, "run-7", LogLevel::Error, "vuln-scan", "nuclei died").await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<LogRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].stage, "info-gather");
        assert_eq!(lines[1].level, LogLevel::Error);
        assert!(content.contains("\"scan_run_id\":\"run-7\""));
    }

    #[tokio::test]
    async fn test_jsonl_sink_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending.
        let sink = JsonlLogSink::new(dir.path());

        assert!(sink
            .write(LogRecord::new("run-1", LogLevel::Info, "report", "x"))
            .await
            .is_err());
        write_log(&sink, "run-1", LogLevel::Info, "report", "does not panic").await;
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }
}
