use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use protoprobe::report::Reporter;
use protoprobe::smtp::{
    self, DispatchConfig, DispatchState, MailDispatch, MailMessage, MailTransport, SecurityMode,
    SmtpClient, SmtpDebugServer, SmtpServerConfig,
};
use protoprobe::tls;
use protoprobe::utils::Logger;
use protoprobe::{Credentials, Endpoint, NetError, Result};

async fn start_server(data_dir: PathBuf) -> (Arc<SmtpDebugServer>, Endpoint) {
    start_server_with(data_dir, None).await
}

async fn start_server_with(
    data_dir: PathBuf,
    acceptor: Option<tokio_rustls::TlsAcceptor>,
) -> (Arc<SmtpDebugServer>, Endpoint) {
    let config = SmtpServerConfig {
        address: "127.0.0.1".into(),
        port: 0,
        hostname: "smtp.local".into(),
        data_dir: Some(data_dir),
    };
    let server = Arc::new(
        SmtpDebugServer::new(config, acceptor, Logger::console("smtp_debug_server")).unwrap(),
    );
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(server.clone().serve(listener));
    let endpoint = Endpoint::new("127.0.0.1", port, Duration::from_secs(5)).unwrap();
    (server, endpoint)
}

/// Real client that counts AUTH attempts.
struct Counting {
    inner: SmtpClient,
    auth: Arc<AtomicUsize>,
}

#[async_trait]
impl MailTransport for Counting {
    async fn ehlo(&mut self, name: &str) -> Result<Vec<String>> {
        MailTransport::ehlo(&mut self.inner, name).await
    }

    async fn starttls(&mut self) -> Result<()> {
        MailTransport::starttls(&mut self.inner).await
    }

    async fn authenticate(&mut self, user: &str, pass: &str, caps: &[String]) -> Result<()> {
        self.auth.fetch_add(1, Ordering::SeqCst);
        self.inner.authenticate(user, pass, caps).await
    }

    async fn send_mail(&mut self, from: &str, to: &str, content: &str) -> Result<()> {
        self.inner.send_mail(from, to, content).await
    }

    async fn quit(&mut self) -> Result<()> {
        MailTransport::quit(&mut self.inner).await
    }
}

fn message() -> MailMessage {
    MailMessage::new(
        "demo@local",
        "receiver@local",
        "Local test",
        "Hello.\n.leading dot line\n",
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn plain_send_without_credentials() {
    let data = tempfile::tempdir().unwrap();
    let (server, endpoint) = start_server(data.path().to_path_buf()).await;

    let auth = Arc::new(AtomicUsize::new(0));
    let client = SmtpClient::connect(&endpoint, false).await.unwrap();
    let mut dispatch: MailDispatch<Counting> =
        MailDispatch::new(SecurityMode::Plain, "localhost", Logger::console("smtp_client"));
    dispatch
        .attach(Counting {
            inner: client,
            auth: auth.clone(),
        })
        .unwrap();

    dispatch.negotiate(&Credentials::anonymous()).await.unwrap();
    dispatch.send(&message()).await.unwrap();
    assert_eq!(dispatch.state(), DispatchState::Sent);
    assert!(matches!(
        dispatch.send(&message()).await,
        Err(NetError::Send(_))
    ));
    dispatch.close().await;

    assert_eq!(auth.load(Ordering::SeqCst), 0);
    assert_eq!(server.received(), 1);

    let saved: Vec<_> = std::fs::read_dir(data.path()).unwrap().collect();
    assert_eq!(saved.len(), 1);
    let content = std::fs::read_to_string(saved[0].as_ref().unwrap().path()).unwrap();
    assert!(content.contains("X-Debug-MailFrom: demo@local"));
    assert!(content.contains("Subject: Local test"));
    assert!(content.contains("\r\n.leading dot line\r\n"));
}

#[tokio::test(flavor = "multi_thread")]
async fn credentials_are_accepted_by_debug_server() {
    let data = tempfile::tempdir().unwrap();
    let (server, endpoint) = start_server(data.path().to_path_buf()).await;

    let logger = Logger::console("smtp_client");
    let reporter = Reporter::new(&logger, "SMTP error");
    let config = DispatchConfig {
        mode: SecurityMode::Plain,
        helo_name: "localhost".into(),
        accept_invalid_certs: false,
    };
    let credentials = Credentials::new(Some("user".into()), Some("12345".into()));
    smtp::dispatch(&endpoint, &config, &credentials, &message(), &logger, &reporter)
        .await
        .unwrap();

    assert_eq!(server.received(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn starttls_refused_when_not_offered() {
    let data = tempfile::tempdir().unwrap();
    let (server, endpoint) = start_server(data.path().to_path_buf()).await;

    let logger = Logger::console("smtp_client");
    let reporter = Reporter::new(&logger, "SMTP error");
    let config = DispatchConfig {
        mode: SecurityMode::StartTls,
        helo_name: "localhost".into(),
        accept_invalid_certs: true,
    };
    let err = smtp::dispatch(&endpoint, &config, &Credentials::anonymous(), &message(), &logger, &reporter)
        .await
        .unwrap_err();

    assert!(err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<NetError>(), Some(NetError::Tls(_)))));
    assert_eq!(server.received(), 0);
}

/// Self-signed certificate and PKCS#8 key written as PEM files under `dir`.
fn self_signed_acceptor(dir: &std::path::Path) -> tokio_rustls::TlsAcceptor {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();
    tls::load_acceptor(&cert_path, &key_path).unwrap()
}

/// Real client that records the command sequence.
struct Recording {
    inner: SmtpClient,
    events: Arc<Mutex<Vec<String>>>,
}

impl Recording {
    fn push(&self, event: &str) {
        self.events.lock().unwrap().push(event.to_string());
    }
}

#[async_trait]
impl MailTransport for Recording {
    async fn ehlo(&mut self, name: &str) -> Result<Vec<String>> {
        let tag = if self.inner.is_encrypted() { "EHLO tls" } else { "EHLO plain" };
        self.push(tag);
        MailTransport::ehlo(&mut self.inner, name).await
    }

    async fn starttls(&mut self) -> Result<()> {
        self.push("STARTTLS");
        MailTransport::starttls(&mut self.inner).await
    }

    async fn authenticate(&mut self, user: &str, pass: &str, caps: &[String]) -> Result<()> {
        self.push("AUTH");
        self.inner.authenticate(user, pass, caps).await
    }

    async fn send_mail(&mut self, from: &str, to: &str, content: &str) -> Result<()> {
        self.push("SEND");
        self.inner.send_mail(from, to, content).await
    }

    async fn quit(&mut self) -> Result<()> {
        MailTransport::quit(&mut self.inner).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn starttls_upgrade_then_login_and_send() {
    let data = tempfile::tempdir().unwrap();
    let certs = tempfile::tempdir().unwrap();
    let acceptor = self_signed_acceptor(certs.path());
    let (server, endpoint) = start_server_with(data.path().to_path_buf(), Some(acceptor)).await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let client = SmtpClient::connect(&endpoint, true).await.unwrap();
    let mut dispatch: MailDispatch<Recording> =
        MailDispatch::new(SecurityMode::StartTls, "localhost", Logger::console("smtp_client"));
    dispatch
        .attach(Recording {
            inner: client,
            events: events.clone(),
        })
        .unwrap();

    let credentials = Credentials::new(Some("user".into()), Some("12345".into()));
    dispatch.negotiate(&credentials).await.unwrap();
    assert_eq!(dispatch.state(), DispatchState::Ready);
    dispatch.send(&message()).await.unwrap();
    dispatch.close().await;

    assert_eq!(
        *events.lock().unwrap(),
        vec!["EHLO plain", "STARTTLS", "EHLO tls", "AUTH", "SEND"]
    );
    assert_eq!(server.received(), 1);

    let saved: Vec<_> = std::fs::read_dir(data.path()).unwrap().collect();
    assert_eq!(saved.len(), 1);
    let content = std::fs::read_to_string(saved[0].as_ref().unwrap().path()).unwrap();
    assert!(content.contains("X-Debug-MailFrom: demo@local"));
}

#[tokio::test(flavor = "multi_thread")]
async fn dispatch_over_starttls_with_credentials() {
    let data = tempfile::tempdir().unwrap();
    let certs = tempfile::tempdir().unwrap();
    let acceptor = self_signed_acceptor(certs.path());
    let (server, endpoint) = start_server_with(data.path().to_path_buf(), Some(acceptor)).await;

    let logger = Logger::console("smtp_client");
    let reporter = Reporter::new(&logger, "SMTP error");
    let config = DispatchConfig {
        mode: SecurityMode::StartTls,
        helo_name: "localhost".into(),
        accept_invalid_certs: true,
    };
    let credentials = Credentials::new(Some("user".into()), Some("12345".into()));
    smtp::dispatch(&endpoint, &config, &credentials, &message(), &logger, &reporter)
        .await
        .unwrap();

    assert_eq!(server.received(), 1);
}
