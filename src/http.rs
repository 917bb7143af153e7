//! HTTP GET then POST, printing status, headers and the start of the body.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};

use crate::cli::HttpClientOpt;
use crate::report::{Outcome, Reporter, Step};
use crate::utils::Logger;

/// Characters of body shown on the console.
pub const BODY_PREVIEW: usize = 500;

/// First `limit` characters, with ` ...` appended when something was cut.
pub fn preview(body: &str, limit: usize) -> String {
    match body.char_indices().nth(limit) {
        Some((cut, _)) => format!("{} ...", &body[..cut]),
        None => body.to_string(),
    }
}

fn headers_json(headers: &reqwest::header::HeaderMap) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        map.insert(
            name.to_string(),
            Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        );
    }
    Value::Object(map)
}

async fn show(label: &str, response: reqwest::Response, reporter: &Reporter<'_>) -> Result<()> {
    reporter.console(&format!("{} status: {}", label, response.status().as_u16()));
    reporter.console(&format!("{} headers: {}", label, headers_json(response.headers())));
    let body = response
        .text()
        .await
        .with_context(|| format!("{} body", label))?;
    reporter.console(&format!("{} body: {}", label, preview(&body, BODY_PREVIEW)));
    Ok(())
}

/// The whole `http-client` run. Never fails; the outcome is what got reported.
pub async fn run_client(opt: &HttpClientOpt, logger: &Logger) -> Outcome {
    let reporter = Reporter::new(logger, "HTTP error");

    let result: Result<()> = async {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(opt.timeout))
            .user_agent(concat!("protoprobe/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let mut failures = Vec::new();

        logger.info(&format!("Sending GET to {}", opt.url)).await;
        let get = async {
            let response = client
                .get(&opt.url)
                .send()
                .await
                .with_context(|| format!("GET {}", opt.url))?;
            show("GET", response, &reporter).await
        }
        .await;
        if let Err(err) = get {
            reporter.step_failed(Step::Transfer, "GET request", &err).await;
            failures.push(format!("{:#}", err));
        }

        logger.info(&format!("Sending POST to {}", opt.post_url)).await;
        let post = async {
            let response = client
                .post(&opt.post_url)
                .json(&json!({ "data": opt.post_data }))
                .send()
                .await
                .with_context(|| format!("POST {}", opt.post_url))?;
            show("POST", response, &reporter).await
        }
        .await;
        if let Err(err) = post {
            reporter.step_failed(Step::Transfer, "POST request", &err).await;
            failures.push(format!("{:#}", err));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "{} HTTP request(s) failed: {}",
                failures.len(),
                failures.join("; ")
            ))
        }
    }
    .await;

    reporter.finish(&result, "HTTP requests complete").await
}
