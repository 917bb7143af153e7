//! Error taxonomy shared by the FTP and SMTP controllers.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while driving a protocol session.
#[derive(Error, Debug)]
pub enum NetError {
    /// Network failure on the control or data connection.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// A connect or command did not complete before the endpoint deadline.
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout { operation: String, after: Duration },

    /// The server rejected the supplied credentials.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Upload source does not exist. Raised before anything is sent.
    #[error("local file not found: {}", .0.display())]
    LocalFileNotFound(PathBuf),

    /// Local filesystem failure while preparing or writing a download.
    #[error("local I/O error on {}: {source}", .path.display())]
    LocalIo { path: PathBuf, source: io::Error },

    /// The server answered with something we did not expect.
    #[error("unexpected server response: {0}")]
    Protocol(String),

    /// Remote and local sizes differ after a download. Advisory only.
    #[error("size mismatch: remote_size={remote}, local_size={local}")]
    VerificationMismatch { remote: u64, local: u64 },

    #[error("TLS error: {0}")]
    Tls(String),

    /// Terminal failure of a mail dispatch.
    #[error("send failed: {0}")]
    Send(String),
}

impl NetError {
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Whether this condition is a warning rather than a failure.
    pub fn is_advisory(&self) -> bool {
        matches!(self, Self::VerificationMismatch { .. })
    }
}

pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_mismatch_is_advisory() {
        assert!(NetError::VerificationMismatch { remote: 3, local: 2 }.is_advisory());
        assert!(!NetError::Auth("530 Login incorrect".into()).is_advisory());
        assert!(!NetError::LocalFileNotFound("a.txt".into()).is_advisory());
    }

    #[test]
    fn timeout_message_names_operation() {
        let err = NetError::timeout("connect", Duration::from_secs(20));
        assert_eq!(err.to_string(), "connect timed out after 20s");
    }
}
