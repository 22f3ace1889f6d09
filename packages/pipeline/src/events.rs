// ABOUTME: Fire-and-forget trigger bus used to hand off between pipeline stages
// ABOUTME: Broadcast-channel implementation with subscribers for downstream consumers

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

pub const PORT_SCAN_REQUESTED: &str = "scan/port-scan.requested";
pub const VULN_SCAN_REQUESTED: &str = "scan/vuln-scan.requested";
pub const REPORT_REQUESTED: &str = "scan/report.requested";
pub const SCAN_COMPLETED: &str = "scan/completed";
pub const SCAN_FAILED: &str = "scan/failed";
pub const SCAN_CANCELLED: &str = "scan/cancelled";

const DEFAULT_CHANNEL_SIZE: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub name: String,
    pub payload: Value,
}

impl TriggerEvent {
    pub fn new(name: &str, payload: Value) -> Self {
        Self {
            name: name.to_string(),
            payload,
        }
    }
}

/// Emission never fails from the caller's point of view.
#[async_trait]
pub trait TriggerBus: Send + Sync {
    async fn emit(&self, event: TriggerEvent);
}

pub struct BroadcastTriggerBus {
    tx: broadcast::Sender<TriggerEvent>,
}

impl Default for BroadcastTriggerBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_SIZE)
    }
}

impl BroadcastTriggerBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TriggerEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl TriggerBus for BroadcastTriggerBus {
    async fn emit(&self, event: TriggerEvent) {
        let name = event.name.clone();
        if self.tx.send(event).is_err() {
            debug!("No subscribers for trigger {}", name);
        }
    }
}
