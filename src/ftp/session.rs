use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::ftp::FtpStream;

/// An authenticated FTP session, as seen by the transfer controller.
#[async_trait]
pub trait FtpSession: Send {
    /// Detailed listing of the current directory.
    async fn list(&mut self) -> Result<Vec<String>>;

    /// Stores `source` as `remote_name`, returning the bytes sent.
    async fn store(
        &mut self,
        remote_name: &str,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64>;

    /// Streams `remote_name` into `sink`, returning the bytes received.
    async fn retrieve(
        &mut self,
        remote_name: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64>;

    async fn size(&mut self, remote_name: &str) -> Result<Option<u64>>;

    async fn quit(&mut self) -> Result<()>;
}

#[async_trait]
impl FtpSession for FtpStream {
    async fn list(&mut self) -> Result<Vec<String>> {
        FtpStream::list(self, None).await
    }

    async fn store(
        &mut self,
        remote_name: &str,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64> {
        self.put(remote_name, source).await
    }

    async fn retrieve(
        &mut self,
        remote_name: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        self.retr(remote_name, sink).await
    }

    async fn size(&mut self, remote_name: &str) -> Result<Option<u64>> {
        FtpStream::size(self, remote_name).await
    }

    async fn quit(&mut self) -> Result<()> {
        FtpStream::quit(self).await
    }
}
