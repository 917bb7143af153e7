//! Console and log reporting shared by the client utilities.
//!
//! A [`Reporter`] is consumed by [`Reporter::finish`], so every controller
//! run emits exactly one terminal record. Nothing here returns an error:
//! reporting is best effort.

use std::fmt;

use crate::utils::Logger;

/// Steps worth a structured log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Connect,
    Auth,
    List,
    Transfer,
    Send,
    Verify,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::Connect => "connect",
            Step::Auth => "auth",
            Step::List => "list",
            Step::Transfer => "transfer",
            Step::Send => "send",
            Step::Verify => "verify",
        })
    }
}

/// Terminal record of one controller run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(String),
    Failure(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

pub struct Reporter<'a> {
    logger: &'a Logger,
    label: &'static str,
}

impl<'a> Reporter<'a> {
    /// `label` prefixes the console error line, e.g. `"FTP error"`.
    pub fn new(logger: &'a Logger, label: &'static str) -> Self {
        Self { logger, label }
    }

    pub async fn step(&self, step: Step, message: &str) {
        self.logger.info(&format!("[{}] {}", step, message)).await;
    }

    pub async fn warn(&self, step: Step, message: &str) {
        self.logger.warn(&format!("[{}] {}", step, message)).await;
    }

    /// Failure of a sub-operation that does not end the run.
    pub async fn step_failed(&self, step: Step, what: &str, err: &anyhow::Error) {
        self.logger
            .exception(&format!("[{}] {} failed", step, what), err)
            .await;
        println!("{}: {:#}", self.label, err);
    }

    pub fn console(&self, line: &str) {
        println!("{}", line);
    }

    /// Emits the single terminal record for the run.
    pub async fn finish<T>(self, result: &anyhow::Result<T>, summary: &str) -> Outcome {
        match result {
            Ok(_) => {
                self.logger.info(summary).await;
                Outcome::Success(summary.to_string())
            }
            Err(err) => {
                self.logger.exception(self.label, err).await;
                println!("{}: {:#}", self.label, err);
                Outcome::Failure(format!("{:#}", err))
            }
        }
    }
}
