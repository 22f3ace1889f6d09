// ABOUTME: Environment-driven configuration for the recon engine
// ABOUTME: Parses sandbox, tool timeout, and log sink settings with strict validation

pub mod constants;

use constants::*;
use std::collections::BTreeMap;
use std::env;
use std::num::ParseIntError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid number for {name}: {source}")]
    InvalidNumber {
        name: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
    #[error("{name} must not be empty")]
    Empty { name: &'static str },
    #[error("Invalid tool timeout entry '{0}' (expected tool=seconds)")]
    InvalidToolTimeout(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconConfig {
    pub sandbox_image: String,
    pub container_prefix: String,
    pub memory_mb: u64,
    pub cpu_shares: i64,
    pub default_tool_timeout_secs: u64,
    /// Per-tool overrides merged over the built-in timeout table.
    pub tool_timeouts: BTreeMap<String, u64>,
    pub stdout_log_cap_bytes: usize,
    pub wordlist_path: String,
    pub scan_log_path: Option<PathBuf>,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            sandbox_image: DEFAULT_SANDBOX_IMAGE.to_string(),
            container_prefix: DEFAULT_CONTAINER_PREFIX.to_string(),
            memory_mb: DEFAULT_SANDBOX_MEMORY_MB,
            cpu_shares: DEFAULT_SANDBOX_CPU_SHARES,
            default_tool_timeout_secs: DEFAULT_TOOL_TIMEOUT_SECS,
            tool_timeouts: BTreeMap::new(),
            stdout_log_cap_bytes: DEFAULT_STDOUT_LOG_CAP_BYTES,
            wordlist_path: DEFAULT_WORDLIST_PATH.to_string(),
            scan_log_path: None,
        }
    }
}

impl ReconConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source. Unset variables fall
    /// back to defaults; set-but-invalid variables are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |name: &str| lookup(name).map(|v| v.trim().to_string());

        let sandbox_image = match read(RECON_SANDBOX_IMAGE) {
            Some(v) if v.is_empty() => {
                return Err(ConfigError::Empty {
                    name: RECON_SANDBOX_IMAGE,
                })
            }
            Some(v) => v,
            None => defaults.sandbox_image,
        };

        let container_prefix = match read(RECON_CONTAINER_PREFIX) {
            Some(v) if v.is_empty() => {
                return Err(ConfigError::Empty {
                    name: RECON_CONTAINER_PREFIX,
                })
            }
            Some(v) => v,
            None => defaults.container_prefix,
        };

        let memory_mb = parse_positive(RECON_SANDBOX_MEMORY_MB, read(RECON_SANDBOX_MEMORY_MB))?
            .unwrap_or(defaults.memory_mb);

        let cpu_shares = match read(RECON_SANDBOX_CPU_SHARES) {
            Some(v) => {
                let shares = parse_positive(RECON_SANDBOX_CPU_SHARES, Some(v))?
                    .unwrap_or(DEFAULT_SANDBOX_CPU_SHARES as u64);
                i64::try_from(shares).unwrap_or(i64::MAX)
            }
            None => defaults.cpu_shares,
        };

        let default_tool_timeout_secs = parse_positive(
            RECON_DEFAULT_TOOL_TIMEOUT_SECS,
            read(RECON_DEFAULT_TOOL_TIMEOUT_SECS),
        )?
        .unwrap_or(defaults.default_tool_timeout_secs);

        let tool_timeouts = match read(RECON_TOOL_TIMEOUTS) {
            Some(v) => parse_tool_timeouts(&v)?,
            None => BTreeMap::new(),
        };

        let stdout_log_cap_bytes =
            parse_positive(RECON_STDOUT_LOG_CAP_BYTES, read(RECON_STDOUT_LOG_CAP_BYTES))?
                .map(|v| usize::try_from(v).unwrap_or(usize::MAX))
                .unwrap_or(defaults.stdout_log_cap_bytes);

        let wordlist_path = read(RECON_WORDLIST_PATH)
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.wordlist_path);

        let scan_log_path = read(RECON_SCAN_LOG_PATH)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            sandbox_image,
            container_prefix,
            memory_mb,
            cpu_shares,
            default_tool_timeout_secs,
            tool_timeouts,
            stdout_log_cap_bytes,
            wordlist_path,
            scan_log_path,
        })
    }
}

fn parse_positive(name: &'static str, value: Option<String>) -> Result<Option<u64>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = value
        .parse::<u64>()
        .map_err(|source| ConfigError::InvalidNumber { name, source })?;
    if parsed == 0 {
        return Err(ConfigError::Zero { name });
    }
    Ok(Some(parsed))
}

/// Parse `tool=secs,tool=secs`. Tool names are lowercased.
pub fn parse_tool_timeouts(raw: &str) -> Result<BTreeMap<String, u64>> {
    let mut timeouts = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (tool, secs) = entry
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidToolTimeout(entry.to_string()))?;
        let tool = tool.trim().to_lowercase();
        if tool.is_empty() {
            return Err(ConfigError::InvalidToolTimeout(entry.to_string()));
        }
        let secs = secs
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| ConfigError::InvalidToolTimeout(entry.to_string()))?;
        timeouts.insert(tool, secs);
    }
    tracing::debug!("Parsed {} tool timeout overrides", timeouts.len());
    Ok(timeouts)
}
