// ABOUTME: Concrete scan stages wired into the scheduler in canonical order
// ABOUTME: Shared settings and helpers for decoding parsed tool output

mod info_gather;
mod port_scan;
mod report;
mod vuln_scan;

pub use info_gather::InfoGatherStage;
pub use port_scan::PortScanStage;
pub use report::ReportStage;
pub use vuln_scan::VulnScanStage;

use crate::runner::Stage;
use recon_config::ReconConfig;
use recon_sandbox::ToolTimeouts;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct StageSettings {
    pub timeouts: ToolTimeouts,
    pub wordlist_path: String,
    /// Directory the report stage writes `<scan_run_id>.json` into.
    pub report_dir: Option<PathBuf>,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self::from_config(&ReconConfig::default())
    }
}

impl StageSettings {
    pub fn from_config(config: &ReconConfig) -> Self {
        Self {
            timeouts: ToolTimeouts::from_config(config),
            wordlist_path: config.wordlist_path.clone(),
            report_dir: None,
        }
    }

    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = Some(dir.into());
        self
    }
}

/// The four stages in execution order.
pub fn standard_stages(settings: &StageSettings) -> [Arc<dyn Stage>; 4] {
    [
        Arc::new(InfoGatherStage),
        Arc::new(PortScanStage::new(&settings.wordlist_path)),
        Arc::new(VulnScanStage),
        Arc::new(ReportStage::new(settings.report_dir.clone())),
    ]
}

/// Decode a parser's output, falling back to empty when absent or mismatched.
fn decode<T: DeserializeOwned + Default>(parsed: &Option<Value>) -> T {
    parsed
        .clone()
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default()
}
