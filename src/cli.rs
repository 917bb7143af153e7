//! Command-line options for every utility.
//!
//! The client utilities always exit 0: failures are logged and reported, not
//! turned into a process error. Scripts that chain them (see `run-all`) rely
//! on that.

use std::path::PathBuf;

use structopt::StructOpt;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "ftp-client",
    about = "FTP client: upload, list, download, verify"
)]
pub struct FtpClientOpt {
    #[structopt(long = "host")]
    pub host: String,

    #[structopt(long = "port", default_value = "21")]
    pub port: u16,

    /// Login name (anonymous when omitted)
    #[structopt(long = "user")]
    pub user: Option<String>,

    #[structopt(long = "password")]
    pub password: Option<String>,

    /// Local file to upload
    #[structopt(long = "upload", parse(from_os_str))]
    pub upload: Option<PathBuf>,

    /// Remote filename for the upload
    #[structopt(long = "remote-name")]
    pub remote_name: Option<String>,

    /// Remote filename to download
    #[structopt(long = "download")]
    pub download: Option<String>,

    /// Local directory to save downloads
    #[structopt(long = "download-dir", default_value = "downloads", parse(from_os_str))]
    pub download_dir: PathBuf,

    /// Seconds allowed for every connect and command
    #[structopt(long = "timeout", default_value = "20")]
    pub timeout: u64,

    #[structopt(long = "log", default_value = "logs/ftp.log", parse(from_os_str))]
    pub log_file: PathBuf,
}

#[derive(Debug, StructOpt, Clone)]
#[structopt(name = "smtp-client", about = "SMTP client (supports STARTTLS)")]
pub struct SmtpClientOpt {
    /// SMTP host (e.g. 127.0.0.1 or smtp.gmail.com)
    #[structopt(long = "host")]
    pub host: String,

    /// SMTP port (e.g. 8025 for the local debug server, 587 for submission)
    #[structopt(long = "port")]
    pub port: u16,

    /// Upgrade the session with STARTTLS before authenticating
    #[structopt(long = "starttls")]
    pub starttls: bool,

    #[structopt(long = "username")]
    pub username: Option<String>,

    #[structopt(long = "password")]
    pub password: Option<String>,

    #[structopt(long = "from")]
    pub from_addr: String,

    #[structopt(long = "to")]
    pub to_addr: String,

    #[structopt(long = "subject", default_value = "Protocol probe test")]
    pub subject: String,

    #[structopt(long = "body", default_value = "Hello from the protoprobe SMTP client.")]
    pub body: String,

    /// Name announced in EHLO
    #[structopt(long = "helo-name", default_value = "localhost")]
    pub helo_name: String,

    /// Accept any TLS certificate (self-signed test servers)
    #[structopt(long = "insecure")]
    pub insecure: bool,

    #[structopt(long = "timeout", default_value = "20")]
    pub timeout: u64,

    #[structopt(long = "log", default_value = "logs/smtp.log", parse(from_os_str))]
    pub log_file: PathBuf,
}

#[derive(Debug, StructOpt, Clone)]
#[structopt(name = "dns-client", about = "DNS A/MX/CNAME lookup and log to file")]
pub struct DnsClientOpt {
    /// Domain to query (e.g. example.com)
    #[structopt(long = "domain")]
    pub domain: String,

    /// Path to write the results to
    #[structopt(long = "out", default_value = "logs/dns_results.txt", parse(from_os_str))]
    pub out: PathBuf,

    #[structopt(long = "log", default_value = "logs/dns.log", parse(from_os_str))]
    pub log_file: PathBuf,
}

#[derive(Debug, StructOpt, Clone)]
#[structopt(name = "http-client", about = "HTTP GET/POST client")]
pub struct HttpClientOpt {
    #[structopt(long = "url", default_value = "https://httpbin.org/get")]
    pub url: String,

    #[structopt(long = "post-url", default_value = "https://httpbin.org/post")]
    pub post_url: String,

    /// Value sent as {"data": <value>} in the POST body
    #[structopt(long = "post-data", default_value = r#"{"hello": "world"}"#)]
    pub post_data: String,

    #[structopt(long = "timeout", default_value = "15")]
    pub timeout: u64,

    #[structopt(long = "log", default_value = "logs/http.log", parse(from_os_str))]
    pub log_file: PathBuf,
}

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "smtp-debug-server",
    about = "Local SMTP server that prints every received message"
)]
pub struct SmtpServerOpt {
    #[structopt(long = "host", default_value = "127.0.0.1")]
    pub address: String,

    #[structopt(long = "port", default_value = "8025")]
    pub port: u16,

    /// Name announced in the banner and EHLO reply
    #[structopt(long = "hostname", default_value = "smtp.local")]
    pub hostname: String,

    /// TLS certificate file (enables STARTTLS)
    #[structopt(long = "tls-cert", parse(from_os_str))]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file
    #[structopt(long = "tls-key", parse(from_os_str))]
    pub tls_key: Option<PathBuf>,

    /// Directory to save received messages as .eml files
    #[structopt(long = "data", parse(from_os_str))]
    pub data_dir: Option<PathBuf>,

    /// Print message content unfiltered
    #[structopt(short = "r", long = "raw")]
    pub raw_display: bool,

    #[structopt(long = "log", parse(from_os_str))]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, StructOpt, Clone)]
#[structopt(name = "ftp-test-server", about = "Run a local FTP server for testing")]
pub struct FtpServerOpt {
    #[structopt(long = "host", default_value = "127.0.0.1")]
    pub address: String,

    #[structopt(long = "port", default_value = "2121")]
    pub port: u16,

    #[structopt(long = "user", default_value = "user")]
    pub user: String,

    #[structopt(long = "password", default_value = "12345")]
    pub password: String,

    #[structopt(long = "home", default_value = "./ftp_home", parse(from_os_str))]
    pub home: PathBuf,

    #[structopt(long = "log", parse(from_os_str))]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "run-all",
    about = "Run the HTTP, SMTP, FTP and DNS demos against local servers"
)]
pub struct RunAllOpt {
    #[structopt(long = "smtp-port", default_value = "8025")]
    pub smtp_port: u16,

    #[structopt(long = "ftp-port", default_value = "2121")]
    pub ftp_port: u16,

    #[structopt(long = "domain", default_value = "example.com")]
    pub domain: String,

    /// Skip the HTTP demo (needs internet access)
    #[structopt(long = "skip-http")]
    pub skip_http: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ftp_defaults() {
        let opt = FtpClientOpt::from_iter(&["ftp-client", "--host", "127.0.0.1"]);
        assert_eq!(opt.port, 21);
        assert_eq!(opt.download_dir, PathBuf::from("downloads"));
        assert_eq!(opt.log_file, PathBuf::from("logs/ftp.log"));
        assert!(opt.user.is_none());
    }

    #[test]
    fn smtp_flags() {
        let opt = SmtpClientOpt::from_iter(&[
            "smtp-client",
            "--host",
            "127.0.0.1",
            "--port",
            "8025",
            "--from",
            "demo@local",
            "--to",
            "receiver@local",
            "--starttls",
        ]);
        assert!(opt.starttls);
        assert_eq!(opt.port, 8025);
        assert_eq!(opt.from_addr, "demo@local");
        assert_eq!(opt.timeout, 20);
    }

    #[test]
    fn smtp_requires_recipient() {
        let result = SmtpClientOpt::from_iter_safe(&[
            "smtp-client",
            "--host",
            "127.0.0.1",
            "--port",
            "8025",
            "--from",
            "demo@local",
        ]);
        assert!(result.is_err());
    }
}
