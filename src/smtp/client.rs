//! SMTP client connection with STARTTLS support.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::endpoint::{deadline, Endpoint};
use crate::error::{NetError, Result};
use crate::smtp::message::dot_stuff;
use crate::smtp::{MailTransport, Response};
use crate::tls;

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// An SMTP client connection that can be either plain TCP or TLS-wrapped.
enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await,
            Self::Tls(stream) => stream.write_all(data).await,
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf).await,
            Self::Tls(stream) => stream.read(buf).await,
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::Tls(stream) => stream.shutdown().await,
        }
    }
}

/// A single SMTP connection. Commands are strictly sequential.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    host: String,
    timeout: Duration,
    accept_invalid_certs: bool,
    greeting: Response,
}

impl SmtpClient {
    /// Connects and reads the 220 greeting.
    pub async fn connect(endpoint: &Endpoint, accept_invalid_certs: bool) -> Result<Self> {
        let timeout = endpoint.timeout();
        let stream = deadline("connect", timeout, async {
            TcpStream::connect(endpoint.addr())
                .await
                .map_err(NetError::Connection)
        })
        .await?;

        let mut client = Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            host: endpoint.host().to_string(),
            timeout,
            accept_invalid_certs,
            greeting: Response::new(0, Vec::new()),
        };

        let greeting = client.read_response().await?;
        if greeting.code != 220 {
            return Err(NetError::Protocol(format!(
                "Unexpected greeting: {} {}",
                greeting.code,
                greeting.message()
            )));
        }
        client.greeting = greeting;
        Ok(client)
    }

    pub fn greeting(&self) -> &Response {
        &self.greeting
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.connection, Some(ClientConnection::Tls(_)))
    }

    fn connection(&mut self) -> Result<&mut ClientConnection> {
        self.connection.as_mut().ok_or_else(|| {
            NetError::Connection(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "SMTP connection closed",
            ))
        })
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let timeout = self.timeout;
        let connection = self.connection()?;
        deadline("SMTP write", timeout, async {
            connection.send(data).await.map_err(NetError::Connection)
        })
        .await
    }

    /// Sends a command and reads the response.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.write_raw(format!("{}\r\n", command).as_bytes()).await?;
        self.read_response().await
    }

    /// Sends `command` and fails unless the reply code is `expected`.
    async fn expect(&mut self, command: &str, label: &str, expected: u16) -> Result<Response> {
        let response = self.command(command).await?;
        if response.code == expected {
            Ok(response)
        } else {
            Err(NetError::Protocol(format!(
                "{} rejected: {} {}",
                label,
                response.code,
                response.message()
            )))
        }
    }

    pub async fn ehlo(&mut self, name: &str) -> Result<Response> {
        self.expect(&format!("EHLO {}", name), "EHLO", 250).await
    }

    /// Sends STARTTLS and upgrades the connection to TLS.
    pub async fn starttls(&mut self) -> Result<()> {
        if self.is_encrypted() {
            return Err(NetError::Tls("Connection is already TLS".to_string()));
        }
        self.expect("STARTTLS", "STARTTLS", 220).await?;

        // Anything buffered past the 220 was sent before the handshake and
        // must not be trusted.
        if self.buffer_pos != 0 {
            return Err(NetError::Protocol(
                "Server sent data after STARTTLS reply".to_string(),
            ));
        }

        let stream = match self.connection.take() {
            Some(ClientConnection::Plain(stream)) => stream,
            _ => return Err(NetError::Tls("No plain connection to upgrade".to_string())),
        };
        let connector = tls::client_connector(self.accept_invalid_certs)?;
        let name = tls::server_name(&self.host)?;
        let tls_stream = deadline("TLS handshake", self.timeout, async {
            connector
                .connect(name, stream)
                .await
                .map_err(|e| NetError::Tls(e.to_string()))
        })
        .await?;

        self.connection = Some(ClientConnection::Tls(Box::new(tls_stream)));
        Ok(())
    }

    /// AUTH PLAIN when advertised, otherwise AUTH LOGIN.
    pub async fn login(&mut self, username: &str, password: &str, capabilities: &[String]) -> Result<()> {
        let mechanisms: Vec<&str> = capabilities
            .iter()
            .filter_map(|cap| cap.strip_prefix("AUTH"))
            .flat_map(|rest| rest.trim_start_matches('=').split_whitespace())
            .collect();

        if mechanisms.is_empty() {
            return Err(NetError::Auth(
                "AUTH extension not supported by server".to_string(),
            ));
        }

        let response = if mechanisms.contains(&"PLAIN") {
            let token = STANDARD.encode(format!("\0{}\0{}", username, password));
            self.command(&format!("AUTH PLAIN {}", token)).await?
        } else if mechanisms.contains(&"LOGIN") {
            let challenge = self.command("AUTH LOGIN").await?;
            if challenge.code != 334 {
                return Err(auth_error(&challenge));
            }
            let challenge = self.command(&STANDARD.encode(username)).await?;
            if challenge.code != 334 {
                return Err(auth_error(&challenge));
            }
            self.command(&STANDARD.encode(password)).await?
        } else {
            return Err(NetError::Auth(format!(
                "No supported authentication mechanism in {:?}",
                mechanisms
            )));
        };

        if response.code == 235 {
            Ok(())
        } else {
            Err(auth_error(&response))
        }
    }

    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.expect(&format!("MAIL FROM:<{}>", from), "MAIL FROM", 250)
            .await
    }

    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        let response = self.command(&format!("RCPT TO:<{}>", to)).await?;
        if response.code == 250 || response.code == 251 {
            Ok(response)
        } else {
            Err(NetError::Protocol(format!(
                "RCPT TO rejected: {} {}",
                response.code,
                response.message()
            )))
        }
    }

    /// DATA, the dot-stuffed content and the terminating dot line.
    pub async fn data(&mut self, content: &str) -> Result<Response> {
        self.expect("DATA", "DATA", 354).await?;

        let mut payload = dot_stuff(content);
        if !payload.ends_with("\r\n") {
            payload.push_str("\r\n");
        }
        payload.push_str(".\r\n");
        self.write_raw(payload.as_bytes()).await?;

        let response = self.read_response().await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(NetError::Protocol(format!(
                "Message rejected: {} {}",
                response.code,
                response.message()
            )))
        }
    }

    /// Sends QUIT and closes the connection, whatever the reply.
    pub async fn quit(&mut self) -> Result<Response> {
        let response = self.command("QUIT").await;
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.shutdown().await;
        }
        response
    }

    /// Reads a complete SMTP response from the server.
    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(NetError::Protocol(format!(
                        "Response too large (exceeds {} bytes)",
                        MAX_BUFFER_SIZE
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let timeout = self.timeout;
            let pos = self.buffer_pos;
            let connection = self
                .connection
                .as_mut()
                .ok_or_else(|| NetError::Protocol("SMTP connection closed".to_string()))?;
            let buffer = &mut self.buffer[pos..];
            let n = deadline("SMTP reply", timeout, async {
                connection.read(buffer).await.map_err(NetError::Connection)
            })
            .await?;
            if n == 0 {
                return Err(NetError::Connection(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Connection closed unexpectedly",
                )));
            }
            self.buffer_pos += n;
        }
    }
}

fn auth_error(response: &Response) -> NetError {
    NetError::Auth(format!("{} {}", response.code, response.message()))
}

#[async_trait]
impl MailTransport for SmtpClient {
    async fn ehlo(&mut self, name: &str) -> Result<Vec<String>> {
        Ok(SmtpClient::ehlo(self, name).await?.capabilities())
    }

    async fn starttls(&mut self) -> Result<()> {
        SmtpClient::starttls(self).await
    }

    async fn authenticate(
        &mut self,
        username: &str,
        password: &str,
        capabilities: &[String],
    ) -> Result<()> {
        self.login(username, password, capabilities).await
    }

    async fn send_mail(&mut self, from: &str, to: &str, content: &str) -> Result<()> {
        self.mail_from(from).await?;
        self.rcpt_to(to).await?;
        self.data(content).await?;
        Ok(())
    }

    async fn quit(&mut self) -> Result<()> {
        SmtpClient::quit(self).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let endpoint = Endpoint::new("127.0.0.1", port, Duration::from_millis(100)).unwrap();
        assert!(matches!(
            SmtpClient::connect(&endpoint, false).await,
            Err(NetError::Timeout { .. })
        ));
    }
}
