// ABOUTME: Port-scan stage verifying candidate ports with service detection
// ABOUTME: Optionally brute-forces directories on the first open web port

use super::decode;
use crate::error::Result;
use crate::fsm::{open_web_ports, web_url};
use crate::model::{Directory, PortRecord, ScanFacts, StageKind};
use crate::parsers::{parse_gobuster, parse_nmap};
use crate::runner::{Stage, StageContext};
use async_trait::async_trait;
use recon_sandbox::{typed_parser, LogLevel};

/// Ports scanned when discovery produced no candidates.
const FALLBACK_TOP_PORTS: u16 = 100;

pub struct PortScanStage {
    wordlist_path: String,
}

impl PortScanStage {
    pub fn new(wordlist_path: &str) -> Self {
        Self {
            wordlist_path: wordlist_path.to_string(),
        }
    }

    fn port_selection(candidates: &[u16]) -> String {
        if candidates.is_empty() {
            format!("--top-ports {}", FALLBACK_TOP_PORTS)
        } else {
            let list: Vec<String> = candidates.iter().map(|p| p.to_string()).collect();
            format!("-p {}", list.join(","))
        }
    }
}

#[async_trait]
impl Stage for PortScanStage {
    fn kind(&self) -> StageKind {
        StageKind::PortScan
    }

    async fn run(&self, ctx: &StageContext<'_>, facts: &mut ScanFacts) -> Result<()> {
        let nmap = ctx
            .invoke(
                "nmap",
                format!(
                    "nmap -sV -Pn {} {}",
                    Self::port_selection(&facts.candidate_ports),
                    ctx.target
                ),
                Some(typed_parser(|out: &str| Ok(parse_nmap(out)))),
            )
            .await?;
        let ports: Vec<PortRecord> = decode(&nmap.parsed);

        if !nmap.success {
            if ports.is_empty() {
                ctx.log(LogLevel::Info, "Port scan produced no signal").await;
            }
            ctx.degrade(facts, "nmap", &nmap).await;
        }
        facts.ports = ports;

        if let Some(port) = open_web_ports(facts).first().copied() {
            let url = web_url(ctx.target, port);
            let gobuster = ctx
                .invoke(
                    "gobuster",
                    format!(
                        "gobuster dir -u {} -w {} -q --no-error -t 20",
                        url, self.wordlist_path
                    ),
                    Some(typed_parser(|out: &str| Ok(parse_gobuster(out)))),
                )
                .await?;
            if !gobuster.success {
                ctx.degrade(facts, "gobuster", &gobuster).await;
            }
            let found: Vec<Directory> = decode(&gobuster.parsed);
            facts.directories.extend(found);
        }

        ctx.log(
            LogLevel::Info,
            format!(
                "{} open ports, {} directories",
                facts.open_ports().len(),
                facts.directories.len()
            ),
        )
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_selection() {
        assert_eq!(PortScanStage::port_selection(&[]), "--top-ports 100");
        assert_eq!(PortScanStage::port_selection(&[80, 443]), "-p 80,443");
    }
}
