use std::future::Future;
use std::time::Duration;

use crate::error::{NetError, Result};

/// Remote address plus the deadline applied to every network call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    timeout: Duration,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Result<Self> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(NetError::Protocol("empty host".to_string()));
        }
        if port == 0 {
            return Err(NetError::Protocol("port must be in 1..=65535".to_string()));
        }
        Ok(Self { host, port, timeout })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Optional login. Both parts must be non-empty for it to count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        Self { username, password }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Returns the pair when both username and password are non-empty.
    pub fn pair(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }

    pub fn is_present(&self) -> bool {
        self.pair().is_some()
    }
}

/// Runs `fut` under `after`, mapping expiry to [`NetError::Timeout`].
pub async fn deadline<T, F>(operation: &str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(NetError::timeout(operation, after)),
    }
}
