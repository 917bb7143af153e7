//! Mail dispatch: one message over one SMTP connection.

use std::fmt;

use anyhow::Context;

use crate::endpoint::{Credentials, Endpoint};
use crate::error::{NetError, Result};
use crate::report::{Reporter, Step};
use crate::smtp::{MailMessage, MailTransport, SmtpClient};
use crate::utils::Logger;

/// Chosen before the first EHLO and fixed for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    Plain,
    StartTls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Init,
    Connected,
    TlsNegotiating,
    Ready,
    Sent,
    Closed,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Drives `Init -> Connected -> [TlsNegotiating] -> Ready -> Sent -> Closed`.
pub struct MailDispatch<T: MailTransport> {
    transport: Option<T>,
    state: DispatchState,
    mode: SecurityMode,
    helo_name: String,
    logger: Logger,
}

impl MailDispatch<SmtpClient> {
    /// Opens the connection and reads the greeting.
    pub async fn connect(&mut self, endpoint: &Endpoint, accept_invalid_certs: bool) -> Result<()> {
        let client = SmtpClient::connect(endpoint, accept_invalid_certs).await?;
        self.logger
            .info(&format!(
                "Connected to {} ({})",
                endpoint,
                client.greeting().message()
            ))
            .await;
        self.attach(client)
    }
}

impl<T: MailTransport> MailDispatch<T> {
    pub fn new(mode: SecurityMode, helo_name: impl Into<String>, logger: Logger) -> Self {
        Self {
            transport: None,
            state: DispatchState::Init,
            mode,
            helo_name: helo_name.into(),
            logger,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn mode(&self) -> SecurityMode {
        self.mode
    }

    /// Hands over an already greeted connection.
    pub fn attach(&mut self, transport: T) -> Result<()> {
        self.require(DispatchState::Init, "attach")?;
        self.transport = Some(transport);
        self.state = DispatchState::Connected;
        Ok(())
    }

    fn require(&self, expected: DispatchState, operation: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(NetError::Protocol(format!(
                "{} is not allowed in state {}",
                operation, self.state
            )))
        }
    }

    fn transport(&mut self) -> Result<&mut T> {
        self.transport
            .as_mut()
            .ok_or_else(|| NetError::Protocol("SMTP connection already closed".to_string()))
    }

    /// EHLO, then STARTTLS and a second EHLO in StartTls mode, then AUTH when
    /// credentials are present. Leaves the dispatch in `Ready`.
    pub async fn negotiate(&mut self, credentials: &Credentials) -> Result<()> {
        self.require(DispatchState::Connected, "negotiate")?;
        let helo_name = self.helo_name.clone();

        let mut capabilities = self.transport()?.ehlo(&helo_name).await?;

        if self.mode == SecurityMode::StartTls {
            self.state = DispatchState::TlsNegotiating;
            if !capabilities.iter().any(|cap| cap == "STARTTLS") {
                return Err(NetError::Tls(
                    "STARTTLS extension not supported by server".to_string(),
                ));
            }
            self.transport()?.starttls().await?;
            self.logger.info("STARTTLS negotiated").await;
            capabilities = self.transport()?.ehlo(&helo_name).await?;
        }
        self.state = DispatchState::Ready;

        if let Some((username, password)) = credentials.pair() {
            self.transport()?
                .authenticate(username, password, &capabilities)
                .await?;
            self.logger.info(&format!("Logged in as {}", username)).await;
        }
        Ok(())
    }

    /// Sends the one message of this run. Only valid in `Ready`.
    pub async fn send(&mut self, message: &MailMessage) -> Result<()> {
        match self.state {
            DispatchState::Ready => {}
            DispatchState::Sent => return Err(NetError::Send("message already sent".to_string())),
            other => {
                return Err(NetError::Send(format!(
                    "cannot send in state {}",
                    other
                )))
            }
        }

        let content = message.render();
        let result = self
            .transport()?
            .send_mail(message.envelope_from(), message.envelope_to(), &content)
            .await;
        match result {
            Ok(()) => {}
            Err(NetError::Protocol(detail)) => return Err(NetError::Send(detail)),
            Err(err) => return Err(err),
        }

        self.state = DispatchState::Sent;
        self.logger
            .info(&format!("Email sent to {}", message.to_addr))
            .await;
        Ok(())
    }

    /// QUIT (best effort) and release the connection. Safe to call twice.
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(err) = transport.quit().await {
                self.logger
                    .warn(&format!("QUIT failed, dropping connection: {}", err))
                    .await;
            }
        }
        self.state = DispatchState::Closed;
    }
}

/// Connection settings for one dispatch run.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub mode: SecurityMode,
    pub helo_name: String,
    /// Accept any certificate during STARTTLS.
    pub accept_invalid_certs: bool,
}

/// Connects, negotiates, sends `message` and always closes.
pub async fn dispatch(
    endpoint: &Endpoint,
    config: &DispatchConfig,
    credentials: &Credentials,
    message: &MailMessage,
    logger: &Logger,
    reporter: &Reporter<'_>,
) -> anyhow::Result<()> {
    let mut controller: MailDispatch<SmtpClient> =
        MailDispatch::new(config.mode, config.helo_name.as_str(), logger.clone());
    controller
        .connect(endpoint, config.accept_invalid_certs)
        .await
        .with_context(|| format!("SMTP connect to {}", endpoint))?;
    reporter
        .step(Step::Connect, &format!("SMTP session open with {}", endpoint))
        .await;

    let result = run_session(&mut controller, credentials, message, reporter).await;
    controller.close().await;
    result
}

async fn run_session<T: MailTransport>(
    controller: &mut MailDispatch<T>,
    credentials: &Credentials,
    message: &MailMessage,
    reporter: &Reporter<'_>,
) -> anyhow::Result<()> {
    controller.negotiate(credentials).await.context(match controller.state() {
        DispatchState::TlsNegotiating => "SMTP STARTTLS",
        DispatchState::Ready => "SMTP login",
        _ => "SMTP EHLO",
    })?;
    if let Some((username, _)) = credentials.pair() {
        reporter
            .step(Step::Auth, &format!("Authenticated as {}", username))
            .await;
    }

    controller
        .send(message)
        .await
        .with_context(|| format!("SMTP send to {}", message.envelope_to()))?;
    reporter
        .step(Step::Send, &format!("Message accepted for {}", message.to_addr))
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    #[derive(Default)]
    struct MockTransport {
        recorder: Recorder,
        starttls_offered: bool,
        tls_active: bool,
        fail_on: Option<&'static str>,
    }

    impl MockTransport {
        fn record(&self, call: impl Into<String>) -> Result<()> {
            let call = call.into();
            self.recorder.calls.lock().unwrap().push(call.clone());
            match self.fail_on {
                Some(step) if call.starts_with(step) => {
                    Err(NetError::Protocol(format!("554 {} refused", step)))
                }
                _ => Ok(()),
            }
        }
    }

    #[async_trait]
    impl MailTransport for MockTransport {
        async fn ehlo(&mut self, name: &str) -> Result<Vec<String>> {
            self.record(format!("EHLO {}", name))?;
            let mut caps = vec!["AUTH PLAIN LOGIN".to_string()];
            if self.starttls_offered && !self.tls_active {
                caps.push("STARTTLS".to_string());
            }
            Ok(caps)
        }

        async fn starttls(&mut self) -> Result<()> {
            self.record("STARTTLS")?;
            self.tls_active = true;
            Ok(())
        }

        async fn authenticate(&mut self, username: &str, _: &str, _: &[String]) -> Result<()> {
            self.record(format!("AUTH {}", username))?;
            if self.fail_on == Some("BADPASS") {
                return Err(NetError::Auth("535 Authentication failed".to_string()));
            }
            Ok(())
        }

        async fn send_mail(&mut self, from: &str, to: &str, content: &str) -> Result<()> {
            assert!(content.contains("Subject: test"));
            self.record(format!("SEND {} {}", from, to))
        }

        async fn quit(&mut self) -> Result<()> {
            self.record("QUIT")
        }
    }

    fn message() -> MailMessage {
        MailMessage::new("demo@local", "receiver@local", "test", "body")
    }

    fn controller(mode: SecurityMode, transport: MockTransport) -> MailDispatch<MockTransport> {
        let mut ctl = MailDispatch::new(mode, "localhost", Logger::console("smtp_client"));
        ctl.attach(transport).unwrap();
        ctl
    }

    fn credentials() -> Credentials {
        Credentials::new(Some("user".into()), Some("secret".into()))
    }

    #[tokio::test]
    async fn starttls_sends_two_ehlo_before_auth() {
        let recorder = Recorder::default();
        let transport = MockTransport {
            recorder: recorder.clone(),
            starttls_offered: true,
            ..Default::default()
        };
        let mut ctl = controller(SecurityMode::StartTls, transport);

        ctl.negotiate(&credentials()).await.unwrap();
        assert_eq!(ctl.state(), DispatchState::Ready);
        ctl.send(&message()).await.unwrap();
        ctl.close().await;

        assert_eq!(
            recorder.calls(),
            vec![
                "EHLO localhost",
                "STARTTLS",
                "EHLO localhost",
                "AUTH user",
                "SEND demo@local receiver@local",
                "QUIT"
            ]
        );
        assert_eq!(ctl.state(), DispatchState::Closed);
    }

    #[tokio::test]
    async fn plain_without_credentials_skips_auth() {
        let recorder = Recorder::default();
        let transport = MockTransport {
            recorder: recorder.clone(),
            ..Default::default()
        };
        let mut ctl = controller(SecurityMode::Plain, transport);

        ctl.negotiate(&Credentials::anonymous()).await.unwrap();
        ctl.send(&message()).await.unwrap();
        assert_eq!(ctl.state(), DispatchState::Sent);

        assert_eq!(recorder.count("EHLO"), 1);
        assert_eq!(recorder.count("AUTH"), 0);
        assert_eq!(recorder.count("SEND"), 1);
    }

    #[tokio::test]
    async fn second_send_is_rejected_without_traffic() {
        let recorder = Recorder::default();
        let transport = MockTransport {
            recorder: recorder.clone(),
            ..Default::default()
        };
        let mut ctl = controller(SecurityMode::Plain, transport);
        ctl.negotiate(&Credentials::anonymous()).await.unwrap();
        ctl.send(&message()).await.unwrap();
        let before = recorder.calls().len();

        let err = ctl.send(&message()).await.unwrap_err();
        assert!(matches!(&err, NetError::Send(msg) if msg == "message already sent"));
        assert_eq!(recorder.calls().len(), before);
    }

    #[tokio::test]
    async fn send_before_negotiate_is_rejected() {
        let mut ctl = controller(SecurityMode::Plain, MockTransport::default());
        assert!(matches!(ctl.send(&message()).await, Err(NetError::Send(_))));
        assert_eq!(ctl.state(), DispatchState::Connected);
    }

    #[tokio::test]
    async fn starttls_requires_server_support() {
        let recorder = Recorder::default();
        let transport = MockTransport {
            recorder: recorder.clone(),
            ..Default::default()
        };
        let mut ctl = controller(SecurityMode::StartTls, transport);

        assert!(matches!(
            ctl.negotiate(&credentials()).await,
            Err(NetError::Tls(_))
        ));
        assert_eq!(recorder.count("STARTTLS"), 0);
        assert_eq!(recorder.count("AUTH"), 0);
    }

    #[tokio::test]
    async fn every_failure_still_closes() {
        for step in ["EHLO", "STARTTLS", "BADPASS", "SEND"] {
            let recorder = Recorder::default();
            let transport = MockTransport {
                recorder: recorder.clone(),
                starttls_offered: true,
                fail_on: Some(step),
                ..Default::default()
            };
            let mut ctl = controller(SecurityMode::StartTls, transport);
            let logger = Logger::console("smtp_client");
            let reporter = Reporter::new(&logger, "SMTP error");

            let result = run_session(&mut ctl, &credentials(), &message(), &reporter).await;
            ctl.close().await;

            assert!(result.is_err(), "{} should fail", step);
            assert_eq!(recorder.calls().last().map(String::as_str), Some("QUIT"));
            assert_eq!(ctl.state(), DispatchState::Closed);
            assert_eq!(recorder.count("SEND"), usize::from(step == "SEND"));
        }
    }

    #[tokio::test]
    async fn rejected_message_becomes_send_error() {
        let transport = MockTransport {
            fail_on: Some("SEND"),
            ..Default::default()
        };
        let mut ctl = controller(SecurityMode::Plain, transport);
        ctl.negotiate(&Credentials::anonymous()).await.unwrap();
        assert!(matches!(ctl.send(&message()).await, Err(NetError::Send(_))));
        assert_eq!(ctl.state(), DispatchState::Ready);
    }
}
