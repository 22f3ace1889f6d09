// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names read by the recon engine

// Sandbox Container
pub const RECON_SANDBOX_IMAGE: &str = "RECON_SANDBOX_IMAGE";
pub const RECON_CONTAINER_PREFIX: &str = "RECON_CONTAINER_PREFIX";
pub const RECON_SANDBOX_MEMORY_MB: &str = "RECON_SANDBOX_MEMORY_MB";
pub const RECON_SANDBOX_CPU_SHARES: &str = "RECON_SANDBOX_CPU_SHARES";

// Tool Execution
pub const RECON_DEFAULT_TOOL_TIMEOUT_SECS: &str = "RECON_DEFAULT_TOOL_TIMEOUT_SECS";
pub const RECON_TOOL_TIMEOUTS: &str = "RECON_TOOL_TIMEOUTS";
pub const RECON_STDOUT_LOG_CAP_BYTES: &str = "RECON_STDOUT_LOG_CAP_BYTES";
pub const RECON_WORDLIST_PATH: &str = "RECON_WORDLIST_PATH";

// Scan Log Sink
pub const RECON_SCAN_LOG_PATH: &str = "RECON_SCAN_LOG_PATH";

// Defaults
pub const DEFAULT_SANDBOX_IMAGE: &str = "recon-tools:latest";
pub const DEFAULT_CONTAINER_PREFIX: &str = "recon-scan-";
pub const DEFAULT_SANDBOX_MEMORY_MB: u64 = 2048;
pub const DEFAULT_SANDBOX_CPU_SHARES: i64 = 256; // 1024 is normal priority
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_STDOUT_LOG_CAP_BYTES: usize = 900_000;
pub const DEFAULT_WORDLIST_PATH: &str = "/usr/share/wordlists/dirb/common.txt";
