// ABOUTME: Vulnerability-scan stage running nuclei against every open web service
// ABOUTME: Findings from each URL accumulate into the scan facts

use super::decode;
use crate::error::Result;
use crate::fsm::{open_web_ports, web_url};
use crate::model::{Finding, ScanFacts, StageKind};
use crate::parsers::parse_nuclei;
use crate::runner::{Stage, StageContext};
use async_trait::async_trait;
use recon_sandbox::{typed_parser, LogLevel};

pub struct VulnScanStage;

#[async_trait]
impl Stage for VulnScanStage {
    fn kind(&self) -> StageKind {
        StageKind::VulnScan
    }

    async fn run(&self, ctx: &StageContext<'_>, facts: &mut ScanFacts) -> Result<()> {
        for port in open_web_ports(facts) {
            let url = web_url(ctx.target, port);
            let nuclei = ctx
                .invoke(
                    "nuclei",
                    format!("nuclei -u {} -jsonl -silent", url),
                    Some(typed_parser(parse_nuclei)),
                )
                .await?;
            if !nuclei.success {
                ctx.degrade(facts, "nuclei", &nuclei).await;
            }
            let found: Vec<Finding> = decode(&nuclei.parsed);
            ctx.log(LogLevel::Info, format!("{} findings on {}", found.len(), url))
                .await;
            facts.findings.extend(found);
        }
        Ok(())
    }
}
