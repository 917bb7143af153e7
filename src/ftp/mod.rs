//! FTP transfer client, its session abstraction and a local test server.

mod server;
mod session;
pub mod status;
mod stream;
mod transfer;

use std::time::Duration;

pub use self::server::{FtpServerConfig, FtpTestServer};
pub use self::session::FtpSession;
pub use self::stream::{FtpStream, Line};
pub use self::transfer::{
    transfer, Direction, RunReport, TransferController, TransferPlan, TransferRequest,
    TransferResult, Verification,
};

use crate::cli::FtpClientOpt;
use crate::endpoint::{Credentials, Endpoint};
use crate::report::{Outcome, Reporter};
use crate::utils::Logger;

impl FtpClientOpt {
    /// Upload needs both `--upload` and `--remote-name`.
    pub fn plan(&self) -> TransferPlan {
        TransferPlan {
            upload: match (&self.upload, &self.remote_name) {
                (Some(local), Some(remote)) => Some(TransferRequest::upload(local, remote)),
                _ => None,
            },
            download: self
                .download
                .as_ref()
                .map(|remote| TransferRequest::download(remote, &self.download_dir)),
        }
    }
}

/// The whole `ftp-client` run. Never fails; the outcome is what got reported.
pub async fn run_client(opt: &FtpClientOpt, logger: &Logger) -> Outcome {
    let reporter = Reporter::new(logger, "FTP error");

    if opt.upload.is_some() != opt.remote_name.is_some() {
        logger
            .warn("Upload skipped: both --upload and --remote-name are required")
            .await;
    }

    let result: anyhow::Result<RunReport> = async {
        let endpoint = Endpoint::new(&opt.host, opt.port, Duration::from_secs(opt.timeout))?;
        let credentials = Credentials::new(opt.user.clone(), opt.password.clone());
        let report = transfer(&endpoint, &credentials, &opt.plan(), logger, &reporter).await?;

        let failures = report.failures();
        if failures.is_empty() {
            Ok(report)
        } else {
            let detail: Vec<String> = failures.iter().map(|err| err.to_string()).collect();
            Err(anyhow::anyhow!(
                "{} FTP operation(s) failed: {}",
                failures.len(),
                detail.join("; ")
            ))
        }
    }
    .await;

    reporter.finish(&result, "FTP session complete").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use structopt::StructOpt;

    #[test]
    fn upload_needs_both_flags() {
        let opt = FtpClientOpt::from_iter(&["ftp-client", "--host", "h", "--upload", "a.txt"]);
        assert!(opt.plan().upload.is_none());

        let opt = FtpClientOpt::from_iter(&[
            "ftp-client",
            "--host",
            "h",
            "--upload",
            "a.txt",
            "--remote-name",
            "b.txt",
            "--download",
            "b.txt",
            "--download-dir",
            "dl",
        ]);
        let plan = opt.plan();
        assert_eq!(plan.upload.unwrap().remote_name, "b.txt");
        assert_eq!(
            plan.download.unwrap().local_path,
            std::path::Path::new("dl").join("b.txt")
        );
    }
}
