//! Local FTP server for exercising the transfer client.
//!
//! One configured user with full access plus `anonymous` with read-only
//! access, both rooted at the same home directory. Passive mode only.

use std::net::{IpAddr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

use crate::ftp::status;
use crate::utils::Logger;

const DATA_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct FtpServerConfig {
    pub address: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub home: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    None,
    ReadOnly,
    Full,
}

struct ClientSession {
    client_addr: SocketAddr,
    local_ip: IpAddr,
    user: Option<String>,
    access: Access,
    passive: Option<TcpListener>,
}

impl ClientSession {
    fn new(client_addr: SocketAddr, local_ip: IpAddr) -> Self {
        Self {
            client_addr,
            local_ip,
            user: None,
            access: Access::None,
            passive: None,
        }
    }
}

pub struct FtpTestServer {
    pub config: FtpServerConfig,
    logger: Logger,
}

impl FtpTestServer {
    /// Creates the home directory when missing.
    pub fn new(config: FtpServerConfig, logger: Logger) -> Result<Self> {
        if !config.home.exists() {
            std::fs::create_dir_all(&config.home).with_context(|| {
                format!("Failed to create home directory: {:?}", config.home)
            })?;
        }
        Ok(Self { config, logger })
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.config.address, self.config.port);
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        self.logger
            .info(&format!("Listening on {}", local))
            .await;

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

    /// Maps a client path onto the home directory, refusing anything that
    /// would escape it.
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name.trim_start_matches('/'));
        if relative.as_os_str().is_empty() {
            return None;
        }
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        Some(self.config.home.join(relative))
    }

    fn login(&self, session: &mut ClientSession, password: &str) -> String {
        let user = session.user.clone().unwrap_or_default();
        if user == self.config.user && password == self.config.password {
            session.access = Access::Full;
            format!("{} User {} logged in.\r\n", status::LOGGED_IN, user)
        } else if user.eq_ignore_ascii_case("anonymous") {
            session.access = Access::ReadOnly;
            format!("{} Anonymous access granted (read-only).\r\n", status::LOGGED_IN)
        } else {
            session.access = Access::None;
            format!("{} Login incorrect.\r\n", status::NOT_LOGGED_IN)
        }
    }

    async fn process_command(&self, cmd: &str, arg: &str, session: &mut ClientSession) -> String {
        match cmd {
            "USER" => {
                session.user = Some(arg.to_string());
                session.access = Access::None;
                format!("{} Username ok, send password.\r\n", status::NEED_PASSWORD)
            }
            "PASS" => {
                if session.user.is_none() {
                    return format!("{} Login with USER first.\r\n", status::BAD_SEQUENCE);
                }
                self.login(session, arg)
            }
            "SYST" => format!("{} UNIX Type: L8\r\n", status::SYSTEM),
            "FEAT" => "211-Features:\r\n PASV\r\n SIZE\r\n211 End\r\n".to_string(),
            "NOOP" => format!("{} NOOP ok.\r\n", status::COMMAND_OK),
            "QUIT" => format!("{} Goodbye.\r\n", status::CLOSING),
            _ if session.access == Access::None => {
                format!("{} Please login with USER and PASS.\r\n", status::NOT_LOGGED_IN)
            }
            "TYPE" => match arg.to_ascii_uppercase().as_str() {
                "I" | "L 8" => format!("{} Type set to: Binary.\r\n", status::COMMAND_OK),
                "A" | "A N" => format!("{} Type set to: ASCII.\r\n", status::COMMAND_OK),
                _ => format!("{} Unsupported type.\r\n", status::NOT_IMPLEMENTED),
            },
            "PWD" | "XPWD" => {
                format!("{} \"/\" is the current directory.\r\n", status::PATH_CREATED)
            }
            "CWD" => match arg {
                "" | "/" | "." => format!(
                    "{} \"/\" is the current directory.\r\n",
                    status::REQUESTED_FILE_ACTION_OK
                ),
                _ => format!("{} No such directory.\r\n", status::FILE_UNAVAILABLE),
            },
            "PASV" => self.enter_passive(session).await,
            "SIZE" => match self.resolve(arg) {
                Some(path) => match tokio::fs::metadata(&path).await {
                    Ok(metadata) if metadata.is_file() => {
                        format!("{} {}\r\n", status::FILE, metadata.len())
                    }
                    _ => format!("{} {}: No such file.\r\n", status::FILE_UNAVAILABLE, arg),
                },
                None => format!("{} Invalid path.\r\n", status::FILE_UNAVAILABLE),
            },
            "DELE" => {
                if session.access != Access::Full {
                    return format!("{} Permission denied.\r\n", status::FILE_UNAVAILABLE);
                }
                let removed = match self.resolve(arg) {
                    Some(path) => tokio::fs::remove_file(&path).await.is_ok(),
                    None => false,
                };
                if removed {
                    format!("{} File removed.\r\n", status::REQUESTED_FILE_ACTION_OK)
                } else {
                    format!("{} {}: No such file.\r\n", status::FILE_UNAVAILABLE, arg)
                }
            }
            _ => format!("{} Command not recognized.\r\n", status::SYNTAX_ERROR),
        }
    }

    async fn enter_passive(&self, session: &mut ClientSession) -> String {
        let ip = match session.local_ip {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => {
                return format!(
                    "{} PASV requires an IPv4 control connection.\r\n",
                    status::CANNOT_OPEN_DATA_CONNECTION
                )
            }
        };
        match TcpListener::bind(SocketAddr::new(IpAddr::V4(ip), 0)).await {
            Ok(listener) => {
                let port = match listener.local_addr() {
                    Ok(addr) => addr.port(),
                    Err(_) => {
                        return format!(
                            "{} Can't open passive connection.\r\n",
                            status::CANNOT_OPEN_DATA_CONNECTION
                        )
                    }
                };
                session.passive = Some(listener);
                let [a, b, c, d] = ip.octets();
                format!(
                    "{} Entering Passive Mode ({},{},{},{},{},{}).\r\n",
                    status::PASSIVE_MODE,
                    a,
                    b,
                    c,
                    d,
                    port >> 8,
                    port & 0xff
                )
            }
            Err(_) => format!(
                "{} Can't open passive connection.\r\n",
                status::CANNOT_OPEN_DATA_CONNECTION
            ),
        }
    }

    async fn open_data(&self, session: &mut ClientSession) -> Option<TcpStream> {
        let listener = session.passive.take()?;
        match time::timeout(DATA_ACCEPT_TIMEOUT, listener.accept()).await {
            Ok(Ok((stream, _))) => Some(stream),
            _ => None,
        }
    }

    /// LIST, NLST, STOR and RETR. Writes both the preliminary and the final reply.
    async fn data_command<W>(
        &self,
        cmd: &str,
        arg: &str,
        session: &mut ClientSession,
        writer: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if session.access == Access::None {
            let reply = format!("{} Please login with USER and PASS.\r\n", status::NOT_LOGGED_IN);
            writer.write_all(reply.as_bytes()).await?;
            return Ok(());
        }

        let target = match cmd {
            "LIST" | "NLST" => None,
            _ => match self.resolve(arg) {
                Some(path) => Some(path),
                None => {
                    let reply = format!("{} Invalid path.\r\n", status::FILE_UNAVAILABLE);
                    writer.write_all(reply.as_bytes()).await?;
                    return Ok(());
                }
            },
        };

        let refusal = match (cmd, &target) {
            ("STOR", _) if session.access != Access::Full => Some("Permission denied."),
            ("RETR", Some(path)) if !path.is_file() => Some("No such file."),
            _ => None,
        };
        if let Some(reason) = refusal {
            let reply = format!("{} {}\r\n", status::FILE_UNAVAILABLE, reason);
            writer.write_all(reply.as_bytes()).await?;
            return Ok(());
        }

        let mut data = match self.open_data(session).await {
            Some(data) => data,
            None => {
                let reply = format!(
                    "{} Use PASV first.\r\n",
                    status::CANNOT_OPEN_DATA_CONNECTION
                );
                writer.write_all(reply.as_bytes()).await?;
                return Ok(());
            }
        };
        let opening = format!("{} Data connection opened.\r\n", status::ABOUT_TO_SEND);
        writer.write_all(opening.as_bytes()).await?;

        let transferred: Result<u64> = async {
            match (cmd, target) {
                ("STOR", Some(path)) => {
                    let mut file = tokio::fs::File::create(&path).await?;
                    let n = tokio::io::copy(&mut data, &mut file).await?;
                    file.flush().await?;
                    Ok(n)
                }
                ("RETR", Some(path)) => {
                    let mut file = tokio::fs::File::open(&path).await?;
                    let n = tokio::io::copy(&mut file, &mut data).await?;
                    Ok(n)
                }
                _ => {
                    let listing = self.listing(cmd == "NLST").await?;
                    data.write_all(listing.as_bytes()).await?;
                    Ok(listing.len() as u64)
                }
            }
        }
        .await;
        let _ = data.shutdown().await;
        drop(data);

        let reply = match transferred {
            Ok(n) => {
                self.logger
                    .peer(&session.client_addr, &format!("{} {} ({} bytes)", cmd, arg, n))
                    .await;
                format!("{} Transfer complete.\r\n", status::CLOSING_DATA_CONNECTION)
            }
            Err(e) => {
                self.logger
                    .peer(&session.client_addr, &format!("{} {} failed: {:#}", cmd, arg, e))
                    .await;
                format!("451 Transfer aborted: {}\r\n", e)
            }
        };
        writer.write_all(reply.as_bytes()).await?;
        Ok(())
    }

    async fn listing(&self, names_only: bool) -> Result<String> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.config.home).await?;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let line = if names_only {
                name.clone()
            } else {
                let modified: DateTime<Local> = metadata
                    .modified()
                    .map(DateTime::from)
                    .unwrap_or_else(|_| Local::now());
                format!(
                    "{}rw-r--r-- 1 owner group {:>10} {} {}",
                    if metadata.is_dir() { 'd' } else { '-' },
                    metadata.len(),
                    modified.format("%b %d %H:%M"),
                    name
                )
            };
            entries.push((name, line));
        }
        entries.sort();

        let mut out = String::new();
        for (_, line) in entries {
            out.push_str(&line);
            out.push_str("\r\n");
        }
        Ok(out)
    }

    async fn handle_client(&self, stream: TcpStream, client_addr: SocketAddr) -> Result<()> {
        let local_ip = stream.local_addr()?.ip();
        self.logger.peer(&client_addr, "New connection").await;

        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);

        let banner = format!("{} protoprobe FTP test server ready.\r\n", status::READY);
        writer.write_all(banner.as_bytes()).await?;

        let mut line = String::new();
        let mut session = ClientSession::new(client_addr, local_ip);

        loop {
            line.clear();

            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let cmd_line = line.trim_end();
                    let (cmd, arg) = match cmd_line.split_once(' ') {
                        Some((cmd, arg)) => (cmd.to_ascii_uppercase(), arg.trim()),
                        None => (cmd_line.to_ascii_uppercase(), ""),
                    };
                    if cmd == "PASS" {
                        self.logger.peer(&client_addr, ">> PASS ****").await;
                    } else {
                        self.logger.peer(&client_addr, &format!(">> {}", cmd_line)).await;
                    }

                    if matches!(cmd.as_str(), "LIST" | "NLST" | "STOR" | "RETR") {
                        self.data_command(&cmd, arg, &mut session, &mut writer).await?;
                        continue;
                    }

                    let resp = self.process_command(&cmd, arg, &mut session).await;
                    self.logger
                        .peer(&client_addr, &format!("<< {}", resp.trim_end()))
                        .await;
                    writer.write_all(resp.as_bytes()).await?;

                    if cmd == "QUIT" {
                        break;
                    }
                }
                Err(e) => {
                    self.logger
                        .peer(&client_addr, &format!("Read error: {}", e))
                        .await;
                    break;
                }
            }
        }

        self.logger.peer(&client_addr, "Connection closed").await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(home: &Path) -> FtpTestServer {
        FtpTestServer::new(
            FtpServerConfig {
                address: "127.0.0.1".into(),
                port: 0,
                user: "user".into(),
                password: "12345".into(),
                home: home.to_path_buf(),
            },
            Logger::console("ftp_server"),
        )
        .unwrap()
    }

    #[test]
    fn resolve_stays_inside_home() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        assert_eq!(server.resolve("/a.txt"), Some(dir.path().join("a.txt")));
        assert_eq!(server.resolve("../etc/passwd"), None);
        assert_eq!(server.resolve(""), None);
    }

    #[tokio::test]
    async fn anonymous_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let mut session = ClientSession::new(addr, addr.ip());

        server.process_command("USER", "anonymous", &mut session).await;
        let reply = server.process_command("PASS", "guest@", &mut session).await;
        assert!(reply.starts_with("230"));
        assert_eq!(session.access, Access::ReadOnly);

        let reply = server.process_command("DELE", "a.txt", &mut session).await;
        assert!(reply.starts_with("550 Permission denied"));
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let mut session = ClientSession::new(addr, addr.ip());

        server.process_command("USER", "user", &mut session).await;
        let reply = server.process_command("PASS", "nope", &mut session).await;
        assert!(reply.starts_with("530"));
        let reply = server.process_command("SIZE", "a.txt", &mut session).await;
        assert!(reply.starts_with("530"));
    }

    #[tokio::test]
    async fn size_reports_file_length() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"12345").unwrap();
        let server = server(dir.path());
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let mut session = ClientSession::new(addr, addr.ip());
        session.access = Access::Full;

        assert_eq!(
            server.process_command("SIZE", "a.txt", &mut session).await,
            "213 5\r\n"
        );
        assert!(server
            .process_command("SIZE", "b.txt", &mut session)
            .await
            .starts_with("550"));
    }
}
