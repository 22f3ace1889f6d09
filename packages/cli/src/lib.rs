// ABOUTME: Library half of the recon command line front end
// ABOUTME: Engine wiring, logging setup, and terminal rendering shared by the recon binary

pub mod engine;
pub mod logging;
pub mod render;

pub use engine::{new_run_id, scan_log_sink, Engine};
pub use logging::init_logging;
