use async_trait::async_trait;

use crate::error::Result;

/// The SMTP operations the dispatch controller needs from a connection.
#[async_trait]
pub trait MailTransport: Send {
    /// Sends EHLO and returns the advertised capability keywords.
    async fn ehlo(&mut self, name: &str) -> Result<Vec<String>>;

    /// Issues STARTTLS and upgrades the connection in place.
    async fn starttls(&mut self) -> Result<()>;

    /// Authenticates with a mechanism chosen from `capabilities`.
    async fn authenticate(
        &mut self,
        username: &str,
        password: &str,
        capabilities: &[String],
    ) -> Result<()>;

    /// MAIL FROM, RCPT TO, DATA and the message content.
    async fn send_mail(&mut self, from: &str, to: &str, content: &str) -> Result<()>;

    async fn quit(&mut self) -> Result<()>;
}
