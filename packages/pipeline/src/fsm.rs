// ABOUTME: Pure stage transition function deciding the next pipeline step from accumulated facts
// ABOUTME: Holds the web-service port allow-list that gates the vulnerability scan branch

use crate::model::{ScanFacts, StageKind};

/// Ports treated as hosting a web service.
pub const WEB_PORTS: &[u16] = &[
    80, 443, 3000, 5000, 8000, 8008, 8080, 8081, 8443, 8888, 9000, 9443,
];

/// Ports that speak TLS by convention.
const TLS_PORTS: &[u16] = &[443, 8443, 9443];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Run(StageKind),
    Skip { stage: StageKind, reason: String },
    Finish,
}

pub fn is_web_port(port: u16) -> bool {
    WEB_PORTS.contains(&port)
}

/// Open ports on the web allow-list, in discovery order.
pub fn open_web_ports(facts: &ScanFacts) -> Vec<u16> {
    facts
        .ports
        .iter()
        .filter(|p| p.is_open() && is_web_port(p.port))
        .map(|p| p.port)
        .collect()
}

/// Base URL for a web service on `port`, eliding default ports. IPv6
/// literals are bracketed.
pub fn web_url(target: &str, port: u16) -> String {
    let scheme = if TLS_PORTS.contains(&port) {
        "https"
    } else {
        "http"
    };
    let host = if target.contains(':') && !target.starts_with('[') {
        format!("[{}]", target)
    } else {
        target.to_string()
    };
    match (scheme, port) {
        ("http", 80) | ("https", 443) => format!("{}://{}", scheme, host),
        _ => format!("{}://{}:{}", scheme, host, port),
    }
}

/// Decide what follows `current` (None before the first stage).
pub fn transition(current: Option<StageKind>, facts: &ScanFacts) -> Transition {
    match current {
        None => Transition::Run(StageKind::InfoGather),
        Some(StageKind::InfoGather) => Transition::Run(StageKind::PortScan),
        Some(StageKind::PortScan) => {
            if open_web_ports(facts).is_empty() {
                let open = facts.open_ports();
                let reason = if open.is_empty() {
                    "no open ports discovered".to_string()
                } else {
                    format!(
                        "no open web service ports (open: {})",
                        open.iter()
                            .map(|p| p.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )
                };
                Transition::Skip {
                    stage: StageKind::VulnScan,
                    reason,
                }
            } else {
                Transition::Run(StageKind::VulnScan)
            }
        }
        Some(StageKind::VulnScan) => Transition::Run(StageKind::Report),
        Some(StageKind::Report) => Transition::Finish,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PortRecord, PortState};
    use rstest::rstest;

    fn facts(ports: &[(u16, PortState)]) -> ScanFacts {
        ScanFacts {
            ports: ports
                .iter()
                .map(|(port, state)| PortRecord {
                    port: *port,
                    protocol: "tcp".into(),
                    state: *state,
                    service: None,
                    version: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_linear_order() {
        let empty = ScanFacts::default();
        assert_eq!(transition(None, &empty), Transition::Run(StageKind::InfoGather));
        assert_eq!(
            transition(Some(StageKind::InfoGather), &empty),
            Transition::Run(StageKind::PortScan)
        );
        assert_eq!(
            transition(Some(StageKind::VulnScan), &empty),
            Transition::Run(StageKind::Report)
        );
        assert_eq!(transition(Some(StageKind::Report), &empty), Transition::Finish);
    }

    #[test]
    fn test_open_web_port_runs_vuln_scan() {
        let facts = facts(&[(80, PortState::Open), (22, PortState::Open)]);

        assert_eq!(
            transition(Some(StageKind::PortScan), &facts),
            Transition::Run(StageKind::VulnScan)
        );
    }

    #[test]
    fn test_no_web_port_skips_with_reason() {
        let facts = facts(&[(22, PortState::Open)]);

        let Transition::Skip { stage, reason } = transition(Some(StageKind::PortScan), &facts)
        else {
            panic!("expected skip");
        };
        assert_eq!(stage, StageKind::VulnScan);
        assert!(reason.contains("22"), "reason was {}", reason);
    }

    #[rstest]
    #[case(&[(8080, PortState::Filtered)])]
    #[case(&[(443, PortState::Closed)])]
    #[case(&[])]
    fn test_non_open_web_ports_do_not_trigger(#[case] ports: &[(u16, PortState)]) {
        assert!(matches!(
            transition(Some(StageKind::PortScan), &facts(ports)),
            Transition::Skip { .. }
        ));
    }

    #[rstest]
    #[case(80, "http://example.com")]
    #[case(443, "https://example.com")]
    #[case(8443, "https://example.com:8443")]
    #[case(8080, "http://example.com:8080")]
    fn test_web_url(#[case] port: u16, #[case] expected: &str) {
        assert_eq!(web_url("example.com", port), expected);
    }

    #[rstest]
    #[case(8080, "http://[2001:db8::1]:8080")]
    #[case(443, "https://[2001:db8::1]")]
    fn test_web_url_brackets_ipv6_hosts(#[case] port: u16, #[case] expected: &str) {
        assert_eq!(web_url("2001:db8::1", port), expected);
    }
}
