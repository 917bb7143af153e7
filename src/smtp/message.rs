//! Plain-text message rendering and DATA encoding.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from_addr: String,
    pub to_addr: String,
    pub subject: String,
    pub body: String,
}

impl MailMessage {
    pub fn new(
        from_addr: impl Into<String>,
        to_addr: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from_addr: from_addr.into(),
            to_addr: to_addr.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Bare address used in MAIL FROM.
    pub fn envelope_from(&self) -> &str {
        envelope_address(&self.from_addr)
    }

    /// Bare address used in RCPT TO.
    pub fn envelope_to(&self) -> &str {
        envelope_address(&self.to_addr)
    }

    /// Renders the message with the current time and a fresh Message-ID.
    pub fn render(&self) -> String {
        let now = Utc::now();
        let message_id = format!(
            "<{}.{}@{}>",
            now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp()),
            std::process::id(),
            domain_of(self.envelope_from())
        );
        self.render_at(now, &message_id)
    }

    pub fn render_at(&self, date: DateTime<Utc>, message_id: &str) -> String {
        let encoding = if self.body.is_ascii() { "7bit" } else { "8bit" };

        let mut out = String::new();
        out.push_str(&format!("From: {}\r\n", self.from_addr));
        out.push_str(&format!("To: {}\r\n", self.to_addr));
        out.push_str(&format!("Subject: {}\r\n", encode_header(&self.subject)));
        out.push_str(&format!("Date: {}\r\n", date.to_rfc2822()));
        out.push_str(&format!("Message-ID: {}\r\n", message_id));
        out.push_str("MIME-Version: 1.0\r\n");
        out.push_str("Content-Type: text/plain; charset=\"utf-8\"\r\n");
        out.push_str(&format!("Content-Transfer-Encoding: {}\r\n", encoding));
        out.push_str("\r\n");
        out.push_str(&normalize_newlines(&self.body));
        if !out.ends_with("\r\n") {
            out.push_str("\r\n");
        }
        out
    }
}

/// `Name <a@b>` gives `a@b`; anything else is returned trimmed.
pub fn envelope_address(addr: &str) -> &str {
    let addr = addr.trim();
    match (addr.rfind('<'), addr.rfind('>')) {
        (Some(start), Some(end)) if start < end => addr[start + 1..end].trim(),
        _ => addr,
    }
}

fn domain_of(addr: &str) -> &str {
    match addr.rsplit_once('@') {
        Some((_, domain)) if !domain.is_empty() => domain,
        _ => "localhost",
    }
}

/// RFC 2047 base64 encoded-word for non-ASCII header values.
fn encode_header(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?utf-8?b?{}?=", STANDARD.encode(value))
    }
}

/// Every line ending becomes CRLF.
pub fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n").replace('\n', "\r\n")
}

/// Normalizes line endings and doubles a leading dot on every line.
pub fn dot_stuff(content: &str) -> String {
    let normalized = normalize_newlines(content);
    let mut out = String::with_capacity(normalized.len() + 8);
    for (i, line) in normalized.split("\r\n").enumerate() {
        if i > 0 {
            out.push_str("\r\n");
        }
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
    }
    out
}
