//! SMTP mail dispatch client and a local debug sink.

mod client;
mod dispatch;
mod message;
mod response;
mod server;
mod session;
mod transport;

use std::time::Duration;

pub use self::client::SmtpClient;
pub use self::dispatch::{dispatch, DispatchConfig, DispatchState, MailDispatch, SecurityMode};
pub use self::message::{dot_stuff, envelope_address, MailMessage};
pub use self::response::Response;
pub use self::server::{SmtpDebugServer, SmtpServerConfig};
pub use self::session::{AuthStage, SmtpSession};
pub use self::transport::MailTransport;

use crate::cli::SmtpClientOpt;
use crate::endpoint::{Credentials, Endpoint};
use crate::report::{Outcome, Reporter};
use crate::utils::Logger;

impl SmtpClientOpt {
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            mode: if self.starttls {
                SecurityMode::StartTls
            } else {
                SecurityMode::Plain
            },
            helo_name: self.helo_name.clone(),
            accept_invalid_certs: self.insecure,
        }
    }

    pub fn message(&self) -> MailMessage {
        MailMessage::new(&self.from_addr, &self.to_addr, &self.subject, &self.body)
    }
}

/// The whole `smtp-client` run. Never fails; the outcome is what got reported.
pub async fn run_client(opt: &SmtpClientOpt, logger: &Logger) -> Outcome {
    let reporter = Reporter::new(logger, "SMTP error");

    if opt.username.is_some() != opt.password.is_some() {
        logger
            .warn("Login skipped: both --username and --password are required")
            .await;
    }

    let result: anyhow::Result<()> = async {
        let endpoint = Endpoint::new(&opt.host, opt.port, Duration::from_secs(opt.timeout))?;
        let credentials = Credentials::new(opt.username.clone(), opt.password.clone());
        dispatch(
            &endpoint,
            &opt.dispatch_config(),
            &credentials,
            &opt.message(),
            logger,
            &reporter,
        )
        .await
    }
    .await;

    if result.is_ok() {
        reporter.console("Email sent successfully.");
    }
    reporter.finish(&result, "SMTP session complete").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use structopt::StructOpt;

    #[test]
    fn starttls_flag_selects_mode() {
        let args = [
            "smtp-client",
            "--host",
            "127.0.0.1",
            "--port",
            "587",
            "--from",
            "Demo <demo@local>",
            "--to",
            "receiver@local",
        ];
        let opt = SmtpClientOpt::from_iter(&args);
        assert_eq!(opt.dispatch_config().mode, SecurityMode::Plain);
        assert_eq!(opt.message().envelope_from(), "demo@local");

        let mut with_tls = args.to_vec();
        with_tls.extend(["--starttls", "--insecure"]);
        let config = SmtpClientOpt::from_iter(&with_tls).dispatch_config();
        assert_eq!(config.mode, SecurityMode::StartTls);
        assert!(config.accept_invalid_certs);
    }

    #[tokio::test]
    async fn unreachable_server_is_reported_not_raised() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let opt = SmtpClientOpt::from_iter(&[
            "smtp-client",
            "--host",
            "127.0.0.1",
            "--port",
            port.to_string().as_str(),
            "--from",
            "a@b",
            "--to",
            "c@d",
            "--timeout",
            "2",
        ]);
        let outcome = run_client(&opt, &Logger::console("smtp_client")).await;
        assert!(!outcome.is_success());
    }
}
