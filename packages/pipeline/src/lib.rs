// ABOUTME: Multi-stage scan pipeline built on the recon sandbox execution layer
// ABOUTME: Stage model, transition function, stage runner, concrete stages, and the scheduler

pub mod error;
pub mod events;
pub mod fsm;
pub mod model;
pub mod parsers;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod stages;
pub mod status;

pub use error::{PipelineError, Result};
pub use events::{BroadcastTriggerBus, TriggerBus, TriggerEvent};
pub use fsm::{transition, Transition, WEB_PORTS};
pub use model::{
    Directory, Finding, PipelineRun, PortRecord, PortState, RunOutcome, ScanFacts, Severity,
    SkipRecord, StageKind, StageState, StageStatus,
};
pub use report::ScanReport;
pub use runner::{Stage, StageContext, StageRunner};
pub use scheduler::{validate_target, PipelineScheduler};
pub use stages::StageSettings;
pub use status::{MemoryRunStatusStore, RunStatusStore, StatusEntry};
