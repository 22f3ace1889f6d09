// ABOUTME: Info-gather stage running whois, DNS, HTTP header, and quick port discovery probes
// ABOUTME: Every probe is tolerated on failure; discovered ports become port-scan candidates

use super::decode;
use crate::error::Result;
use crate::model::{PortRecord, ScanFacts, StageKind};
use crate::parsers::{parse_dig_short, parse_nmap, parse_server_header};
use crate::runner::{Stage, StageContext};
use async_trait::async_trait;
use recon_sandbox::{typed_parser, LogLevel};

pub struct InfoGatherStage;

#[async_trait]
impl Stage for InfoGatherStage {
    fn kind(&self) -> StageKind {
        StageKind::InfoGather
    }

    async fn run(&self, ctx: &StageContext<'_>, facts: &mut ScanFacts) -> Result<()> {
        let target = ctx.target;

        let whois = ctx.invoke("whois", format!("whois {}", target), None).await?;
        if !whois.success {
            ctx.degrade(facts, "whois", &whois).await;
        }

        let dig = ctx
            .invoke(
                "dig",
                format!("dig +short {}", target),
                Some(typed_parser(|out: &str| Ok(parse_dig_short(out)))),
            )
            .await?;
        if dig.success {
            facts.addresses = decode(&dig.parsed);
        } else {
            ctx.degrade(facts, "dig", &dig).await;
        }

        let curl = ctx
            .invoke(
                "curl",
                format!("curl -sI --max-time 30 http://{}", target),
                Some(typed_parser(|out: &str| Ok(parse_server_header(out)))),
            )
            .await?;
        if curl.success {
            facts.web_server = decode(&curl.parsed);
        } else {
            ctx.degrade(facts, "curl", &curl).await;
        }

        let nmap = ctx
            .invoke(
                "nmap",
                format!("nmap --top-ports 1000 --open -T4 -Pn {}", target),
                Some(typed_parser(|out: &str| Ok(parse_nmap(out)))),
            )
            .await?;
        let discovered: Vec<PortRecord> = decode(&nmap.parsed);
        if !nmap.success && discovered.is_empty() {
            ctx.degrade(facts, "nmap", &nmap).await;
        }
        facts.candidate_ports = discovered
            .iter()
            .filter(|p| p.is_open())
            .map(|p| p.port)
            .collect();

        ctx.log(
            LogLevel::Info,
            format!(
                "Resolved {} addresses, {} candidate ports",
                facts.addresses.len(),
                facts.candidate_ports.len()
            ),
        )
        .await;
        Ok(())
    }
}
