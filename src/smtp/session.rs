use std::net::SocketAddr;

/// Where an AUTH exchange stands between continuation lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStage {
    Idle,
    PlainResponse,
    LoginUser,
    LoginPassword,
}

/// Per-connection state of the debug server.
pub struct SmtpSession {
    pub client_addr: SocketAddr,
    pub helo: Option<String>,
    pub mail_from: Option<String>,
    pub rcpt_to: Vec<String>,
    pub data: Vec<String>,
    pub auth: AuthStage,
    pub user: Option<String>,
    pub tls_active: bool,
    pub starttls_available: bool,
    pub expecting_data: bool,
}

impl SmtpSession {
    pub fn new(client_addr: SocketAddr, starttls_available: bool) -> Self {
        Self {
            client_addr,
            helo: None,
            mail_from: None,
            rcpt_to: Vec::new(),
            data: Vec::new(),
            auth: AuthStage::Idle,
            user: None,
            tls_active: false,
            starttls_available,
            expecting_data: false,
        }
    }

    /// Clears the current transaction (RSET, end of DATA).
    pub fn reset(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
        self.data.clear();
        self.expecting_data = false;
    }

    /// Forgets everything learned before a TLS upgrade.
    pub fn reset_all(&mut self) {
        self.reset();
        self.helo = None;
        self.auth = AuthStage::Idle;
        self.user = None;
    }

    pub fn offers_starttls(&self) -> bool {
        self.starttls_available && !self.tls_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SmtpSession {
        SmtpSession::new("127.0.0.1:40000".parse().unwrap(), true)
    }

    #[test]
    fn reset_keeps_helo() {
        let mut s = session();
        s.helo = Some("client".into());
        s.mail_from = Some("a@b".into());
        s.rcpt_to.push("c@d".into());
        s.reset();
        assert_eq!(s.helo.as_deref(), Some("client"));
        assert!(s.mail_from.is_none() && s.rcpt_to.is_empty());
    }

    #[test]
    fn upgrade_forgets_state() {
        let mut s = session();
        s.helo = Some("client".into());
        s.user = Some("user".into());
        assert!(s.offers_starttls());
        s.reset_all();
        s.tls_active = true;
        assert!(s.helo.is_none() && s.user.is_none());
        assert!(!s.offers_starttls());
    }
}
