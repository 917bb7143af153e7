//! FTP control connection.
use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Duration;

use regex::Regex;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;

use crate::endpoint::{deadline, Endpoint};
use crate::error::{NetError, Result};
use crate::ftp::status;

lazy_static::lazy_static! {
    // This regex extracts IP and Port details from PASV command response.
    // The regex looks for the pattern (h1,h2,h3,h4,p1,p2).
    static ref PORT_RE: Regex = Regex::new(r"\((\d+),(\d+),(\d+),(\d+),(\d+),(\d+)\)").unwrap();

    // This regex extracts file size from SIZE command response.
    static ref SIZE_RE: Regex = Regex::new(r"\s+(\d+)\s*$").unwrap();
}

const CHUNK_SIZE: usize = 64 * 1024;

/// A reply code and the text of its last line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line(pub u32, pub String);

/// Stream to interface with the FTP server. This interface is only for the command stream.
pub struct FtpStream {
    reader: BufReader<TcpStream>,
    timeout: Duration,
    welcome_msg: Option<String>,
}

impl FtpStream {
    /// Opens the control connection and reads the 220 greeting.
    pub async fn connect(endpoint: &Endpoint) -> Result<FtpStream> {
        let timeout = endpoint.timeout();
        let stream = deadline("connect", timeout, async {
            TcpStream::connect(endpoint.addr())
                .await
                .map_err(NetError::Connection)
        })
        .await?;

        let mut ftp_stream = FtpStream {
            reader: BufReader::new(stream),
            timeout,
            welcome_msg: None,
        };
        let Line(_, welcome) = ftp_stream.read_response(status::READY).await?;
        ftp_stream.welcome_msg = Some(welcome.trim_end().to_string());

        Ok(ftp_stream)
    }

    /// Get welcome message from the server on connect.
    pub fn welcome_msg(&self) -> Option<&str> {
        self.welcome_msg.as_deref()
    }

    /// Log in to the FTP server. A 530 reply becomes [`NetError::Auth`].
    pub async fn login(&mut self, user: &str, password: &str) -> Result<()> {
        self.write_str(format!("USER {}\r\n", user)).await?;
        let Line(code, line) = self.read_reply().await?;
        match code {
            status::LOGGED_IN => return Ok(()),
            status::NEED_PASSWORD => {}
            status::NOT_LOGGED_IN => return Err(NetError::Auth(line.trim_end().to_string())),
            _ => {
                return Err(NetError::Protocol(format!(
                    "Unexpected USER response: {}",
                    line.trim_end()
                )))
            }
        }

        self.write_str(format!("PASS {}\r\n", password)).await?;
        let Line(code, line) = self.read_reply().await?;
        match code {
            status::LOGGED_IN => Ok(()),
            status::NOT_LOGGED_IN => Err(NetError::Auth(line.trim_end().to_string())),
            _ => Err(NetError::Protocol(format!(
                "Unexpected PASS response: {}",
                line.trim_end()
            ))),
        }
    }

    /// Switches to image (binary) transfer type.
    pub async fn binary(&mut self) -> Result<()> {
        self.write_str("TYPE I\r\n").await?;
        self.read_response(status::COMMAND_OK).await?;
        Ok(())
    }

    /// Quits the current FTP session.
    pub async fn quit(&mut self) -> Result<()> {
        self.write_str("QUIT\r\n").await?;
        self.read_response(status::CLOSING).await?;
        Ok(())
    }

    /// Runs the PASV command.
    async fn pasv(&mut self) -> Result<SocketAddr> {
        self.write_str("PASV\r\n").await?;
        // PASV response format : 227 Entering Passive Mode (h1,h2,h3,h4,p1,p2).
        let Line(_, line) = self.read_response(status::PASSIVE_MODE).await?;
        let caps = PORT_RE
            .captures(&line)
            .ok_or_else(|| NetError::Protocol(format!("Invalid PASV response: {}", line)))?;

        let octet = |idx: usize| {
            caps[idx]
                .parse::<u8>()
                .map_err(|_| NetError::Protocol(format!("Invalid PASV response: {}", line)))
        };
        let port = (u16::from(octet(5)?) << 8) + u16::from(octet(6)?);

        // The advertised host is ignored in favour of the control peer, which
        // keeps NATed servers working.
        let ip = self
            .reader
            .get_ref()
            .peer_addr()
            .map_err(NetError::Connection)?
            .ip();
        Ok(SocketAddr::new(ip, port))
    }

    /// Opens a passive data connection, then issues `cmd` on the control channel.
    async fn data_command(&mut self, cmd: &str) -> Result<TcpStream> {
        let addr = self.pasv().await?;
        let stream = deadline("data connection", self.timeout, async {
            TcpStream::connect(addr).await.map_err(NetError::Connection)
        })
        .await?;
        self.write_str(cmd).await?;
        Ok(stream)
    }

    /// This stores a file on the server. Returns the number of bytes sent.
    pub async fn put<R>(&mut self, filename: &str, r: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let stor_command = format!("STOR {}\r\n", filename);
        let mut data_stream = self.data_command(&stor_command).await?;
        self.read_response_in(&[status::ALREADY_OPEN, status::ABOUT_TO_SEND])
            .await?;

        let bytes = pump("STOR", self.timeout, r, &mut data_stream).await?;
        data_stream.shutdown().await.map_err(NetError::Connection)?;
        drop(data_stream);

        self.read_response_in(&[
            status::CLOSING_DATA_CONNECTION,
            status::REQUESTED_FILE_ACTION_OK,
        ])
        .await?;
        Ok(bytes)
    }

    /// Streams `filename` from the server into `w`. Returns the number of bytes received.
    pub async fn retr<W>(&mut self, filename: &str, w: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let retr_command = format!("RETR {}\r\n", filename);
        let mut data_stream = self.data_command(&retr_command).await?;
        self.read_response_in(&[status::ABOUT_TO_SEND, status::ALREADY_OPEN])
            .await?;

        let bytes = pump("RETR", self.timeout, &mut data_stream, w).await?;
        drop(data_stream);

        self.read_response_in(&[
            status::CLOSING_DATA_CONNECTION,
            status::REQUESTED_FILE_ACTION_OK,
        ])
        .await?;
        Ok(bytes)
    }

    /// Execute a command which returns list of strings in a separate stream
    async fn list_command(&mut self, cmd: Cow<'_, str>) -> Result<Vec<String>> {
        let data_stream = BufReader::new(self.data_command(&cmd).await?);
        self.read_response_in(&[status::ABOUT_TO_SEND, status::ALREADY_OPEN])
            .await?;
        let lines = deadline(
            "LIST",
            self.timeout,
            Self::get_lines_from_stream(data_stream),
        )
        .await?;
        self.read_response_in(&[
            status::CLOSING_DATA_CONNECTION,
            status::REQUESTED_FILE_ACTION_OK,
        ])
        .await?;
        Ok(lines)
    }

    /// Consume a stream and return a vector of lines
    async fn get_lines_from_stream<R>(data_stream: R) -> Result<Vec<String>>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines: Vec<String> = Vec::new();

        let mut lines_stream = data_stream.lines();
        loop {
            let line = lines_stream
                .next_line()
                .await
                .map_err(NetError::Connection)?;

            match line {
                Some(line) => {
                    if line.is_empty() {
                        continue;
                    }
                    lines.push(line);
                }
                None => break Ok(lines),
            }
        }
    }

    /// Execute `LIST` command which returns the detailed file listing in human readable format.
    pub async fn list(&mut self, pathname: Option<&str>) -> Result<Vec<String>> {
        let command = pathname.map_or("LIST\r\n".into(), |path| {
            format!("LIST {}\r\n", path).into()
        });
        self.list_command(command).await
    }

    /// Retrieves the size of the file in bytes at `pathname`.
    /// `None` when the reply carries no parsable size.
    pub async fn size(&mut self, pathname: &str) -> Result<Option<u64>> {
        self.write_str(format!("SIZE {}\r\n", pathname)).await?;
        let Line(_, content) = self.read_response(status::FILE).await?;

        match SIZE_RE.captures(&content) {
            Some(caps) => Ok(caps[1].parse().ok()),
            None => Ok(None),
        }
    }

    async fn write_str<S: AsRef<str>>(&mut self, command: S) -> Result<()> {
        let timeout = self.timeout;
        let stream = self.reader.get_mut();
        deadline("command write", timeout, async {
            stream
                .write_all(command.as_ref().as_bytes())
                .await
                .map_err(NetError::Connection)
        })
        .await
    }

    async fn read_line(&mut self, line: &mut String) -> Result<()> {
        let timeout = self.timeout;
        let reader = &mut self.reader;
        let n = deadline("reply", timeout, async {
            reader.read_line(line).await.map_err(NetError::Connection)
        })
        .await?;
        if n == 0 {
            return Err(NetError::Connection(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "control connection closed by server",
            )));
        }
        Ok(())
    }

    pub async fn read_response(&mut self, expected_code: u32) -> Result<Line> {
        self.read_response_in(&[expected_code]).await
    }

    /// Reads one reply and checks its code against `expected_code`.
    pub async fn read_response_in(&mut self, expected_code: &[u32]) -> Result<Line> {
        let Line(code, line) = self.read_reply().await?;
        if expected_code.iter().any(|ec| code == *ec) {
            Ok(Line(code, line))
        } else {
            Err(NetError::Protocol(format!(
                "Expected code {:?}, got response: {}",
                expected_code,
                line.trim_end()
            )))
        }
    }

    /// Retrieve a complete (possibly multi-line) reply.
    async fn read_reply(&mut self) -> Result<Line> {
        let mut line = String::new();
        self.read_line(&mut line).await?;

        let digits = match line.get(0..3) {
            Some(digits) if line.len() >= 4 => digits.to_string(),
            _ => {
                return Err(NetError::Protocol(format!(
                    "error: could not read reply code: {}",
                    line.trim_end()
                )))
            }
        };

        let code: u32 = digits.parse().map_err(|err| {
            NetError::Protocol(format!("error: could not parse reply code: {}", err))
        })?;

        // multiple line reply
        // loop while the line does not begin with the code and a space
        let expected = format!("{} ", digits);
        while line.get(0..4) != Some(expected.as_str()) {
            line.clear();
            self.read_line(&mut line).await?;
        }

        Ok(Line(code, line))
    }
}

/// Copies `reader` into `writer`, applying `idle` to every chunk rather than
/// to the whole transfer.
async fn pump<R, W>(operation: &str, idle: Duration, reader: &mut R, writer: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = deadline(operation, idle, async {
            reader.read(&mut buf).await.map_err(NetError::Connection)
        })
        .await?;
        if n == 0 {
            break;
        }
        deadline(operation, idle, async {
            writer.write_all(&buf[..n]).await.map_err(NetError::Connection)
        })
        .await?;
        total += n as u64;
    }
    deadline(operation, idle, async {
        writer.flush().await.map_err(NetError::Connection)
    })
    .await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn list_command_dos_newlines() {
        let data_stream = BufReader::new(Cursor::new(
            b"Hello\r\nWorld\r\n\r\nBe\r\nHappy\r\n".to_vec(),
        ));

        assert_eq!(
            FtpStream::get_lines_from_stream(data_stream).await.unwrap(),
            ["Hello", "World", "Be", "Happy"]
                .iter()
                .map(<&str>::to_string)
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn list_command_unix_newlines() {
        let data_stream = BufReader::new(Cursor::new(b"Hello\nWorld\n\nBe\nHappy\n".to_vec()));

        assert_eq!(
            FtpStream::get_lines_from_stream(data_stream).await.unwrap(),
            ["Hello", "World", "Be", "Happy"]
                .iter()
                .map(<&str>::to_string)
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn pump_counts_bytes() {
        let mut source = Cursor::new(vec![7u8; CHUNK_SIZE + 11]);
        let mut sink = Vec::new();
        let n = pump("test", Duration::from_secs(1), &mut source, &mut sink)
            .await
            .unwrap();
        assert_eq!(n, (CHUNK_SIZE + 11) as u64);
        assert_eq!(sink.len(), CHUNK_SIZE + 11);
    }

    #[test]
    fn size_regex_reads_trailing_number() {
        let caps = SIZE_RE.captures("213 11\r\n").unwrap();
        assert_eq!(&caps[1], "11");
    }

    /// Serves `script` to the first client, then keeps the socket open.
    async fn scripted_server(script: &'static [u8]) -> Endpoint {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(script).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        Endpoint::new("127.0.0.1", port, Duration::from_millis(500)).unwrap()
    }

    #[tokio::test]
    async fn multibyte_continuation_line_in_greeting() {
        let endpoint = scripted_server(
            "220-Welcome\r\n日本語のサーバーです\r\n220 ready\r\n".as_bytes(),
        )
        .await;
        let stream = FtpStream::connect(&endpoint).await.unwrap();
        assert_eq!(stream.welcome_msg(), Some("220 ready"));
    }

    #[tokio::test]
    async fn multibyte_first_line_is_a_protocol_error() {
        let endpoint = scripted_server("日本語\r\n".as_bytes()).await;
        assert!(matches!(
            FtpStream::connect(&endpoint).await,
            Err(NetError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let endpoint = scripted_server(b"").await;
        let endpoint = Endpoint::new(endpoint.host(), endpoint.port(), Duration::from_millis(100)).unwrap();
        assert!(matches!(
            FtpStream::connect(&endpoint).await,
            Err(NetError::Timeout { .. })
        ));
    }
}
