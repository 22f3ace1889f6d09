// ABOUTME: Tool name to timeout lookup table with configurable overrides
// ABOUTME: Static per-tool defaults merged with environment overrides and a fallback default

use recon_config::ReconConfig;
use std::collections::BTreeMap;
use std::time::Duration;

const BUILTIN_TIMEOUTS: &[(&str, u64)] = &[
    ("nmap", 600),
    ("gobuster", 300),
    ("nuclei", 900),
    ("nikto", 900),
    ("whois", 60),
    ("dig", 60),
    ("curl", 60),
];

#[derive(Debug, Clone, PartialEq)]
pub struct ToolTimeouts {
    table: BTreeMap<String, Duration>,
    fallback: Duration,
}

impl Default for ToolTimeouts {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(recon_config::constants::DEFAULT_TOOL_TIMEOUT_SECS),
            &BTreeMap::new(),
        )
    }
}

impl ToolTimeouts {
    pub fn new(fallback: Duration, overrides: &BTreeMap<String, u64>) -> Self {
        let mut table: BTreeMap<String, Duration> = BUILTIN_TIMEOUTS
            .iter()
            .map(|(tool, secs)| (tool.to_string(), Duration::from_secs(*secs)))
            .collect();
        for (tool, secs) in overrides {
            table.insert(tool.to_lowercase(), Duration::from_secs(*secs));
        }
        Self { table, fallback }
    }

    pub fn from_config(config: &ReconConfig) -> Self {
        Self::new(
            Duration::from_secs(config.default_tool_timeout_secs),
            &config.tool_timeouts,
        )
    }

    /// Timeout for `tool`, or the fallback for unlisted tools.
    pub fn lookup(&self, tool: &str) -> Duration {
        self.table
            .get(&tool.to_lowercase())
            .copied()
            .unwrap_or(self.fallback)
    }

    pub fn fallback(&self) -> Duration {
        self.fallback
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, Duration)> {
        self.table.iter().map(|(tool, d)| (tool.as_str(), *d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("nmap", 600)]
    #[case("NMAP", 600)]
    #[case("nuclei", 900)]
    #[case("whois", 60)]
    #[case("masscan", 300)]
    fn test_builtin_lookup(#[case] tool: &str, #[case] secs: u64) {
        assert_eq!(ToolTimeouts::default().lookup(tool), Duration::from_secs(secs));
    }

    #[test]
    fn test_overrides_replace_and_extend() {
        let overrides = BTreeMap::from([("nmap".to_string(), 30), ("masscan".to_string(), 45)]);
        let timeouts = ToolTimeouts::new(Duration::from_secs(10), &overrides);

        assert_eq!(timeouts.lookup("nmap"), Duration::from_secs(30));
        assert_eq!(timeouts.lookup("masscan"), Duration::from_secs(45));
        assert_eq!(timeouts.lookup("unknown"), Duration::from_secs(10));
        assert_eq!(timeouts.lookup("curl"), Duration::from_secs(60));
    }

    #[test]
    fn test_from_config() {
        let config = ReconConfig {
            default_tool_timeout_secs: 42,
            ..Default::default()
        };

        let timeouts = ToolTimeouts::from_config(&config);

        assert_eq!(timeouts.fallback(), Duration::from_secs(42));
        assert_eq!(timeouts.entries().count(), BUILTIN_TIMEOUTS.len());
    }
}
