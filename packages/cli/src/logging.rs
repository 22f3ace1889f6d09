// ABOUTME: Process log initialisation for the recon binary
// ABOUTME: Compact stderr output filtered by RUST_LOG, --verbose, or an info default

use tracing_subscriber::EnvFilter;

/// Pick the filter directive: `--verbose` wins, then `RUST_LOG`, then `info`.
pub fn filter_directive(verbose: bool, env_filter: Option<String>) -> String {
    if verbose {
        return "debug".to_string();
    }
    env_filter
        .filter(|f| !f.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

/// Logs go to stderr so `--json` output on stdout stays machine-readable.
pub fn init_logging(verbose: bool) {
    let directive = filter_directive(verbose, std::env::var(EnvFilter::DEFAULT_ENV).ok());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(false, None, "info")]
    #[case(false, Some(""), "info")]
    #[case(false, Some("recon_sandbox=trace"), "recon_sandbox=trace")]
    #[case(true, Some("warn"), "debug")]
    fn test_filter_directive(
        #[case] verbose: bool,
        #[case] env: Option<&str>,
        #[case] expected: &str,
    ) {
        assert_eq!(filter_directive(verbose, env.map(str::to_string)), expected);
    }
}
