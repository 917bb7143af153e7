//! Local SMTP sink that accepts everything and prints what it receives.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Local;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::smtp::session::{AuthStage, SmtpSession};
use crate::utils::Logger;

#[derive(Debug, Clone)]
pub struct SmtpServerConfig {
    pub address: String,
    pub port: u16,
    pub hostname: String,
    /// Received messages are also written here as `.eml` files.
    pub data_dir: Option<PathBuf>,
}

/// How a conversation loop ended.
enum Ending {
    Closed,
    StartTls,
}

pub struct SmtpDebugServer {
    pub config: SmtpServerConfig,
    logger: Logger,
    tls_acceptor: Option<TlsAcceptor>,
    received: AtomicU64,
}

impl SmtpDebugServer {
    /// STARTTLS is offered only when `tls_acceptor` is set.
    pub fn new(
        config: SmtpServerConfig,
        tls_acceptor: Option<TlsAcceptor>,
        logger: Logger,
    ) -> Result<Self> {
        if let Some(data_dir) = &config.data_dir {
            if !data_dir.exists() {
                std::fs::create_dir_all(data_dir)
                    .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;
            }
        }

        Ok(Self {
            config,
            logger,
            tls_acceptor,
            received: AtomicU64::new(0),
        })
    }

    /// Messages accepted since start.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.config.address, self.config.port);
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        self.logger.info(&format!("Listening on {}", local)).await;

        loop {
            match listener.accept().await {
                Ok((stream, client_addr)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_client(stream, client_addr).await {
                            this.logger.peer(&client_addr, &format!("Error: {:#}", e)).await;
                        }
                    });
                }
                Err(e) => {
                    self.logger
                        .error(&format!("Accept error on {}: {}", local, e))
                        .await;
                }
            }
        }
    }

    pub async fn handle_client(&self, stream: TcpStream, client_addr: SocketAddr) -> Result<()> {
        self.logger.peer(&client_addr, "New connection").await;

        let mut session = SmtpSession::new(client_addr, self.tls_acceptor.is_some());
        let mut reader = BufReader::new(stream);
        let banner = format!("220 {} SMTP debug server ready\r\n", self.config.hostname);
        reader.write_all(banner.as_bytes()).await?;

        if let Ending::StartTls = self.converse(&mut reader, &mut session).await? {
            // Pipelined bytes sent before the handshake are not trusted.
            if !reader.buffer().is_empty() {
                self.logger
                    .peer(&client_addr, "Data received before TLS handshake, closing")
                    .await;
                return Ok(());
            }
            let acceptor = match &self.tls_acceptor {
                Some(acceptor) => acceptor.clone(),
                None => return Ok(()),
            };

            match acceptor.accept(reader.into_inner()).await {
                Ok(tls_stream) => {
                    self.logger.peer(&client_addr, "TLS session established").await;
                    session.reset_all();
                    session.tls_active = true;
                    let mut reader = BufReader::new(tls_stream);
                    self.converse(&mut reader, &mut session).await?;
                }
                Err(e) => {
                    self.logger
                        .peer(&client_addr, &format!("TLS handshake failed: {}", e))
                        .await;
                }
            }
        }

        self.logger.peer(&client_addr, "Connection closed").await;
        Ok(())
    }

    /// Reads commands until QUIT, EOF or an accepted STARTTLS.
    async fn converse<S>(
        &self,
        reader: &mut BufReader<S>,
        session: &mut SmtpSession,
    ) -> Result<Ending>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let client_addr = session.client_addr;
        let tag = if session.tls_active { " (TLS)" } else { "" };
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => return Ok(Ending::Closed),
                Ok(_) => {}
                Err(e) => {
                    self.logger
                        .peer(&client_addr, &format!("Read error: {}", e))
                        .await;
                    return Ok(Ending::Closed);
                }
            }
            let cmd_line = line.trim_end_matches(&['\r', '\n'][..]);

            if session.expecting_data {
                if cmd_line == "." {
                    self.deliver(session).await;
                    session.reset();
                    reader.write_all(b"250 OK: Message accepted\r\n").await?;
                } else {
                    let unstuffed = cmd_line.strip_prefix('.').filter(|rest| rest.starts_with('.'));
                    session.data.push(unstuffed.unwrap_or(cmd_line).to_string());
                }
                continue;
            }

            let shown = if session.auth != AuthStage::Idle || is_auth_with_secret(cmd_line) {
                "AUTH ****"
            } else {
                cmd_line
            };
            self.logger
                .peer(&client_addr, &format!(">>{} {}", tag, shown))
                .await;

            let response = self.process_command(cmd_line, session).await;
            self.logger
                .peer(&client_addr, &format!("<<{} {}", tag, response.trim_end()))
                .await;
            reader.write_all(response.as_bytes()).await?;
            reader.flush().await?;

            if response.starts_with("221") {
                return Ok(Ending::Closed);
            }
            if response.starts_with("354") {
                session.expecting_data = true;
            }
            if response.starts_with("220") && cmd_line.eq_ignore_ascii_case("STARTTLS") {
                return Ok(Ending::StartTls);
            }
        }
    }

    async fn process_command(&self, cmd_line: &str, session: &mut SmtpSession) -> String {
        if session.auth != AuthStage::Idle {
            return self.continue_auth(cmd_line, session).await;
        }

        let (verb, rest) = match cmd_line.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (cmd_line, ""),
        };
        if verb.is_empty() {
            return "500 Syntax error\r\n".to_string();
        }

        match verb.to_uppercase().as_str() {
            "EHLO" => {
                let name = if rest.is_empty() { "unknown" } else { rest };
                session.helo = Some(name.to_string());

                let mut response = format!("250-{} Hello {}\r\n", self.config.hostname, name);
                if session.offers_starttls() {
                    response.push_str("250-STARTTLS\r\n");
                }
                response.push_str("250-AUTH PLAIN LOGIN\r\n");
                response.push_str("250 8BITMIME\r\n");
                response
            }

            "HELO" => {
                let name = if rest.is_empty() { "unknown" } else { rest };
                session.helo = Some(name.to_string());
                format!("250 {}\r\n", self.config.hostname)
            }

            "STARTTLS" => {
                if session.offers_starttls() {
                    "220 Ready to start TLS\r\n".to_string()
                } else {
                    "454 TLS not available\r\n".to_string()
                }
            }

            "AUTH" => self.start_auth(rest, session).await,

            "MAIL" => match path_argument(rest, "FROM:") {
                Some(from) => {
                    session.mail_from = Some(from);
                    "250 OK\r\n".to_string()
                }
                None => "501 Syntax error in parameters\r\n".to_string(),
            },

            "RCPT" => {
                if session.mail_from.is_none() {
                    return "503 Bad sequence of commands\r\n".to_string();
                }
                match path_argument(rest, "TO:") {
                    Some(to) => {
                        session.rcpt_to.push(to);
                        "250 OK\r\n".to_string()
                    }
                    None => "501 Syntax error in parameters\r\n".to_string(),
                }
            }

            "DATA" => {
                if session.mail_from.is_none() || session.rcpt_to.is_empty() {
                    return "503 Bad sequence of commands\r\n".to_string();
                }
                "354 Start mail input; end with <CRLF>.<CRLF>\r\n".to_string()
            }

            "RSET" => {
                session.reset();
                "250 OK\r\n".to_string()
            }

            "NOOP" => "250 OK\r\n".to_string(),

            "VRFY" => "252 Cannot verify user\r\n".to_string(),

            "QUIT" => "221 Bye\r\n".to_string(),

            _ => "500 Command not recognized\r\n".to_string(),
        }
    }

    /// Every mechanism and credential is accepted.
    async fn start_auth(&self, rest: &str, session: &mut SmtpSession) -> String {
        let mut parts = rest.split_whitespace();
        let mechanism = parts.next().map(str::to_uppercase);
        let initial = parts.next();

        match (mechanism.as_deref(), initial) {
            (Some("PLAIN"), Some(token)) => self.accept_plain(token, session).await,
            (Some("PLAIN"), None) => {
                session.auth = AuthStage::PlainResponse;
                "334 \r\n".to_string()
            }
            (Some("LOGIN"), Some(user)) => {
                session.user = decode(user);
                session.auth = AuthStage::LoginPassword;
                "334 UGFzc3dvcmQ6\r\n".to_string()
            }
            (Some("LOGIN"), None) => {
                session.auth = AuthStage::LoginUser;
                "334 VXNlcm5hbWU6\r\n".to_string()
            }
            _ => "504 Unrecognized authentication type\r\n".to_string(),
        }
    }

    async fn continue_auth(&self, line: &str, session: &mut SmtpSession) -> String {
        if line == "*" {
            session.auth = AuthStage::Idle;
            return "501 Authentication cancelled\r\n".to_string();
        }
        match session.auth {
            AuthStage::PlainResponse => {
                session.auth = AuthStage::Idle;
                self.accept_plain(line, session).await
            }
            AuthStage::LoginUser => {
                session.user = decode(line);
                session.auth = AuthStage::LoginPassword;
                "334 UGFzc3dvcmQ6\r\n".to_string()
            }
            AuthStage::LoginPassword | AuthStage::Idle => {
                session.auth = AuthStage::Idle;
                self.authenticated(session).await
            }
        }
    }

    async fn accept_plain(&self, token: &str, session: &mut SmtpSession) -> String {
        // authzid NUL authcid NUL passwd
        session.user = decode(token).and_then(|text| text.split('\0').nth(1).map(str::to_string));
        self.authenticated(session).await
    }

    async fn authenticated(&self, session: &SmtpSession) -> String {
        self.logger
            .peer(
                &session.client_addr,
                &format!(
                    "AUTH accepted for {}",
                    session.user.as_deref().unwrap_or("<unknown>")
                ),
            )
            .await;
        "235 Authentication successful\r\n".to_string()
    }

    /// Prints the message and saves it when a data directory is configured.
    async fn deliver(&self, session: &SmtpSession) {
        let count = self.received.fetch_add(1, Ordering::SeqCst) + 1;
        let from = session.mail_from.as_deref().unwrap_or("");
        let to = session.rcpt_to.join(", ");
        let details = format!(
            "From: {}\nTo: {}\n\n{}",
            from,
            to,
            session.data.join("\n")
        );
        self.logger
            .log_verbose(
                &session.client_addr,
                "SMTP DEBUG SERVER RECEIVED MESSAGE",
                &details,
            )
            .await;

        if let Err(e) = self.save_email_data(session, count).await {
            self.logger
                .peer(&session.client_addr, &format!("Failed to save email: {:#}", e))
                .await;
        }
    }

    async fn save_email_data(&self, session: &SmtpSession, count: u64) -> Result<()> {
        let data_dir = match &self.config.data_dir {
            Some(dir) => dir,
            None => return Ok(()),
        };

        let client_addr = session.client_addr;
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let filename = format!(
            "{}_{}_{}.eml",
            timestamp,
            client_addr.ip().to_string().replace(['.', ':'], "_"),
            count
        );
        let filepath = data_dir.join(filename);

        let mut content = String::new();
        content.push_str(&format!("X-Debug-Client: {}\r\n", client_addr));
        content.push_str(&format!(
            "X-Debug-Date: {}\r\n",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
        if let Some(helo) = &session.helo {
            content.push_str(&format!("X-Debug-HELO: {}\r\n", helo));
        }
        if let Some(mail_from) = &session.mail_from {
            content.push_str(&format!("X-Debug-MailFrom: {}\r\n", mail_from));
        }
        for rcpt in &session.rcpt_to {
            content.push_str(&format!("X-Debug-RcptTo: {}\r\n", rcpt));
        }
        content.push_str(&session.data.join("\r\n"));
        content.push_str("\r\n");

        tokio::fs::write(&filepath, content)
            .await
            .with_context(|| format!("Failed to write {:?}", filepath))?;
        self.logger
            .peer(&client_addr, &format!("Email saved to: {:?}", filepath))
            .await;
        Ok(())
    }
}

/// `FROM:<a@b> SIZE=10` gives `a@b`. The keyword is matched case-insensitively.
fn path_argument(rest: &str, keyword: &str) -> Option<String> {
    let head = rest.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let path = rest[keyword.len()..].trim_start();
    let path = path.split_whitespace().next().unwrap_or("");
    Some(path.trim_start_matches('<').trim_end_matches('>').to_string())
}

fn decode(token: &str) -> Option<String> {
    STANDARD
        .decode(token.trim())
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn is_auth_with_secret(cmd_line: &str) -> bool {
    let mut parts = cmd_line.split_whitespace();
    matches!(parts.next(), Some(verb) if verb.eq_ignore_ascii_case("AUTH")) && parts.nth(1).is_some()
}
