// ABOUTME: Minimal tool output parsers extracting only the fields pipeline decisions need
// ABOUTME: Covers nmap port tables, gobuster hits, nuclei JSON lines, dig answers, and HTTP headers

use crate::model::{Directory, Finding, PortRecord, PortState, Severity};
use serde::Deserialize;
use std::net::IpAddr;

/// Port rows from nmap's normal output (`80/tcp open http nginx 1.18`).
pub fn parse_nmap(output: &str) -> Vec<PortRecord> {
    output.lines().filter_map(parse_nmap_line).collect()
}

fn parse_nmap_line(line: &str) -> Option<PortRecord> {
    let mut fields = line.split_whitespace();
    let (port, protocol) = fields.next()?.split_once('/')?;
    let port = port.parse::<u16>().ok()?;
    if !matches!(protocol, "tcp" | "udp" | "sctp") {
        return None;
    }
    let state = PortState::parse(fields.next()?);
    let service = fields.next().map(str::to_string);
    let version = fields.collect::<Vec<_>>().join(" ");

    Some(PortRecord {
        port,
        protocol: protocol.to_string(),
        state,
        service,
        version: (!version.is_empty()).then_some(version),
    })
}

/// Hits from `gobuster dir` (`/admin (Status: 301) [Size: 178]`).
pub fn parse_gobuster(output: &str) -> Vec<Directory> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let path = line.split_whitespace().next()?;
            if !path.starts_with('/') {
                return None;
            }
            let (_, rest) = line.split_once("Status:")?;
            let status = rest
                .trim_start()
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .ok()?;
            Some(Directory {
                path: path.to_string(),
                status,
            })
        })
        .collect()
}

#[derive(Deserialize)]
struct NucleiLine {
    #[serde(rename = "template-id")]
    template_id: String,
    info: NucleiInfo,
    #[serde(rename = "matched-at", default)]
    matched_at: Option<String>,
    #[serde(default)]
    host: Option<String>,
}

#[derive(Deserialize)]
struct NucleiInfo {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    severity: Option<String>,
}

/// Findings from `nuclei -jsonl`. Lines that are not findings are ignored;
/// output with content but no parseable finding is an error.
pub fn parse_nuclei(output: &str) -> Result<Vec<Finding>, String> {
    let mut findings = Vec::new();
    let mut last_error = None;

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<NucleiLine>(line) {
            Ok(hit) => findings.push(Finding {
                name: hit.info.name.unwrap_or_else(|| hit.template_id.clone()),
                severity: Severity::parse(hit.info.severity.as_deref().unwrap_or("")),
                matched_at: hit.matched_at.or(hit.host).unwrap_or_default(),
                template_id: hit.template_id,
            }),
            Err(e) => last_error = Some(e.to_string()),
        }
    }

    match last_error {
        Some(e) if findings.is_empty() => Err(format!("no nuclei findings parsed: {}", e)),
        _ => Ok(findings),
    }
}

/// Address answers from `dig +short`, skipping CNAME hops.
pub fn parse_dig_short(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| l.parse::<IpAddr>().is_ok())
        .map(str::to_string)
        .collect()
}

/// `Server` header value from a `curl -sI` response.
pub fn parse_server_header(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("server")
            .then(|| value.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const NMAP_SV: &str = "\
Starting Nmap 7.94 ( https://nmap.org ) at 2024-05-01 10:00 UTC
Nmap scan report for example.com (93.184.216.34)
Host is up (0.011s latency).
Not shown: 997 filtered tcp ports (no-response)
PORT    STATE  SERVICE  VERSION
22/tcp  open   ssh      OpenSSH 8.9p1 Ubuntu 3ubuntu0.6
80/tcp  open   http     nginx 1.18.0
443/tcp closed https

Nmap done: 1 IP address (1 host up) scanned in 12.34 seconds
";

    #[test]
    fn test_parse_nmap_rows() {
        let ports = parse_nmap(NMAP_SV);

        assert_eq!(ports.len(), 3);
        assert_eq!(ports[0].port, 22);
        assert_eq!(ports[0].version.as_deref(), Some("OpenSSH 8.9p1 Ubuntu 3ubuntu0.6"));
        assert_eq!(ports[1].service.as_deref(), Some("http"));
        assert_eq!(ports[2].state, PortState::Closed);
        assert_eq!(ports[2].version, None);
    }

    #[test]
    fn test_parse_nmap_ignores_noise() {
        assert!(parse_nmap("Nmap done: 1 IP address\n1/2 hosts\n").is_empty());
    }

    #[test]
    fn test_parse_gobuster() {
        let out = "/admin                (Status: 301) [Size: 178] [--> http://example.com/admin/]\n\
                   /index.html           (Status: 200) [Size: 1256]\n\
                   Progress: 4614 / 4615 (99.98%)\n";

        let dirs = parse_gobuster(out);

        assert_eq!(
            dirs,
            vec![
                Directory {
                    path: "/admin".into(),
                    status: 301
                },
                Directory {
                    path: "/index.html".into(),
                    status: 200
                },
            ]
        );
    }

    #[test]
    fn test_parse_nuclei_jsonl() {
        let out = r#"{"template-id":"tech-detect","info":{"name":"Wappalyzer Technology Detection","severity":"info"},"matched-at":"http://example.com"}
{"template-id":"CVE-2021-41773","info":{"name":"Apache 2.4.49 Path Traversal","severity":"critical"},"host":"http://example.com"}
"#;

        let findings = parse_nuclei(out).unwrap();

        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Info);
        assert_eq!(findings[1].severity, Severity::Critical);
        assert_eq!(findings[1].matched_at, "http://example.com");
    }

    #[test]
    fn test_parse_nuclei_garbage_is_error() {
        assert!(parse_nuclei("[INF] Using Nuclei Engine 3.1.0\n").is_err());
        assert!(parse_nuclei("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_dig_short_skips_cnames() {
        let out = "edge.example.net.\n93.184.216.34\n2606:2800:220:1::248\n";
        assert_eq!(
            parse_dig_short(out),
            vec!["93.184.216.34".to_string(), "2606:2800:220:1::248".to_string()]
        );
    }

    #[test]
    fn test_parse_server_header() {
        let out = "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nserver: ECS (dcb/7EA3)\r\n\r\n";
        assert_eq!(parse_server_header(out).as_deref(), Some("ECS (dcb/7EA3)"));
        assert_eq!(parse_server_header("HTTP/1.1 200 OK\r\n"), None);
    }
}
