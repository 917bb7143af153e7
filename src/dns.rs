//! A, MX and CNAME lookup written to a results file.

use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioResolver;
use serde::Serialize;

use crate::cli::DnsClientOpt;
use crate::report::{Outcome, Reporter};
use crate::utils::{ensure_parent_dir, Logger};

/// Records per type. Serialized in A, MX, CNAME order.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DnsResults {
    #[serde(rename = "A")]
    pub a: Vec<String>,
    #[serde(rename = "MX")]
    pub mx: Vec<String>,
    #[serde(rename = "CNAME")]
    pub cname: Vec<String>,
}

impl DnsResults {
    fn sections(&self) -> [(&'static str, &[String]); 3] {
        [("A", &self.a), ("MX", &self.mx), ("CNAME", &self.cname)]
    }

    /// Text written to the results file.
    pub fn render(&self, domain: &str, at: DateTime<Utc>) -> String {
        let mut out = format!(
            "DNS Results for {} @ {}Z\n\n",
            domain,
            at.format("%Y-%m-%dT%H:%M:%S%.6f")
        );
        for (kind, values) in self.sections() {
            out.push_str(&format!("=== {} Records ===\n", kind));
            if values.is_empty() {
                out.push_str("- (none)\n");
            }
            for value in values {
                out.push_str(&format!("- {}\n", value));
            }
            out.push('\n');
        }
        out
    }
}

/// Resolves all three types. A type that fails to resolve is left empty.
pub async fn query(domain: &str, logger: &Logger) -> DnsResults {
    match TokioResolver::builder(TokioConnectionProvider::default()) {
        Ok(builder) => {
            let resolver = builder.build();
            let mut results = DnsResults::default();

            match resolver.ipv4_lookup(domain).await {
                Ok(lookup) => results.a = lookup.iter().map(|a| a.to_string()).collect(),
                Err(e) => logger.info(&format!("No A records: {}", e)).await,
            }
            match resolver.mx_lookup(domain).await {
                Ok(lookup) => {
                    results.mx = lookup
                        .iter()
                        .map(|mx| format!("{} {}", mx.preference(), mx.exchange()))
                        .collect()
                }
                Err(e) => logger.info(&format!("No MX records: {}", e)).await,
            }
            match resolver.lookup(domain, RecordType::CNAME).await {
                Ok(lookup) => {
                    results.cname = lookup
                        .iter()
                        .filter_map(|rdata| match rdata {
                            RData::CNAME(name) => Some(name.to_string()),
                            _ => None,
                        })
                        .collect()
                }
                Err(e) => logger.info(&format!("No CNAME records: {}", e)).await,
            }
            results
        }
        Err(e) => {
            logger
                .warn(&format!(
                    "Resolver unavailable ({}), falling back to system lookup for A records",
                    e
                ))
                .await;
            DnsResults {
                a: system_a(domain).await,
                ..DnsResults::default()
            }
        }
    }
}

/// IPv4 addresses from the platform resolver, in answer order.
async fn system_a(domain: &str) -> Vec<String> {
    let mut addrs = Vec::new();
    if let Ok(resolved) = tokio::net::lookup_host((domain, 0)).await {
        for addr in resolved {
            if let IpAddr::V4(ip) = addr.ip() {
                let ip = ip.to_string();
                if !addrs.contains(&ip) {
                    addrs.push(ip);
                }
            }
        }
    }
    addrs
}

pub async fn write_results(path: &Path, domain: &str, results: &DnsResults) -> Result<()> {
    ensure_parent_dir(path).with_context(|| format!("Failed to create directory for {:?}", path))?;
    tokio::fs::write(path, results.render(domain, Utc::now()))
        .await
        .with_context(|| format!("Failed to write {:?}", path))
}

/// The whole `dns-client` run. Never fails; the outcome is what got reported.
pub async fn run_client(opt: &DnsClientOpt, logger: &Logger) -> Outcome {
    let reporter = Reporter::new(logger, "DNS error");

    let result: Result<()> = async {
        let domain = opt.domain.trim();
        if domain.is_empty() {
            anyhow::bail!("empty domain");
        }
        logger.info(&format!("DNS query for {}", domain)).await;

        let results = query(domain, logger).await;
        write_results(&opt.out, domain, &results).await?;

        reporter.console(&format!("Results written to {}", opt.out.display()));
        reporter.console(&serde_json::to_string_pretty(&results)?);
        Ok(())
    }
    .await;

    reporter.finish(&result, "DNS lookup complete").await
}
