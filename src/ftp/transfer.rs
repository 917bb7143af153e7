//! Upload / list / download / verify sequence over one FTP session.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::io::AsyncWriteExt;

use crate::endpoint::{Credentials, Endpoint};
use crate::error::{NetError, Result};
use crate::ftp::{FtpSession, FtpStream};
use crate::report::{Reporter, Step};
use crate::utils::Logger;

const ANONYMOUS_USER: &str = "anonymous";
const ANONYMOUS_PASSWORD: &str = "anonymous@";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub direction: Direction,
    pub local_path: PathBuf,
    pub remote_name: String,
}

impl TransferRequest {
    pub fn upload(local_path: impl Into<PathBuf>, remote_name: impl Into<String>) -> Self {
        Self {
            direction: Direction::Upload,
            local_path: local_path.into(),
            remote_name: remote_name.into(),
        }
    }

    /// The local file is `download_dir` joined with the last segment of `remote_name`.
    pub fn download(remote_name: impl Into<String>, download_dir: impl AsRef<Path>) -> Self {
        let remote_name = remote_name.into();
        let local_path = download_dir.as_ref().join(remote_basename(&remote_name));
        Self {
            direction: Direction::Download,
            local_path,
            remote_name,
        }
    }
}

fn remote_basename(name: &str) -> &str {
    name.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or(name)
}

/// Outcome of the size comparison that follows a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Verified,
    Mismatch { remote: u64, local: u64 },
    /// One of the sizes could not be resolved.
    Indeterminate,
    /// Uploads are not re-checked against the server.
    NotChecked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub direction: Direction,
    pub bytes_transferred: u64,
    pub remote_size: Option<u64>,
    pub local_size: Option<u64>,
    pub verified: bool,
}

impl TransferResult {
    fn uploaded(bytes_transferred: u64, local_size: u64) -> Self {
        Self {
            direction: Direction::Upload,
            bytes_transferred,
            remote_size: None,
            local_size: Some(local_size),
            verified: false,
        }
    }

    fn downloaded(bytes_transferred: u64, remote_size: Option<u64>, local_size: Option<u64>) -> Self {
        let verified = matches!((remote_size, local_size), (Some(r), Some(l)) if r == l);
        Self {
            direction: Direction::Download,
            bytes_transferred,
            remote_size,
            local_size,
            verified,
        }
    }

    pub fn verification(&self) -> Verification {
        if self.direction == Direction::Upload {
            return Verification::NotChecked;
        }
        match (self.remote_size, self.local_size) {
            (Some(remote), Some(local)) if remote == local => Verification::Verified,
            (Some(remote), Some(local)) => Verification::Mismatch { remote, local },
            _ => Verification::Indeterminate,
        }
    }

    /// The advisory error for a size mismatch, if there is one.
    pub fn mismatch(&self) -> Option<NetError> {
        match self.verification() {
            Verification::Mismatch { remote, local } => {
                Some(NetError::VerificationMismatch { remote, local })
            }
            _ => None,
        }
    }
}

struct OptSize(Option<u64>);

impl fmt::Display for OptSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(size) => write!(f, "{}", size),
            None => f.write_str("unknown"),
        }
    }
}

/// What one invocation asked for. The listing always runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferPlan {
    pub upload: Option<TransferRequest>,
    pub download: Option<TransferRequest>,
}

/// What happened during [`TransferController::run`].
#[derive(Debug, Default)]
pub struct RunReport {
    pub listing: Option<Vec<String>>,
    pub upload: Option<Result<TransferResult>>,
    pub download: Option<Result<TransferResult>>,
}

impl RunReport {
    pub fn failures(&self) -> Vec<&NetError> {
        [&self.upload, &self.download]
            .into_iter()
            .flatten()
            .filter_map(|result| result.as_ref().err())
            .collect()
    }
}

/// Drives one FTP session. The session is released by [`close`](Self::close)
/// or, failing that, when the controller is dropped.
pub struct TransferController<S: FtpSession> {
    session: Option<S>,
    logger: Logger,
}

impl TransferController<FtpStream> {
    /// Connects, logs in (anonymously without credentials) and selects binary mode.
    pub async fn connect(
        endpoint: &Endpoint,
        credentials: &Credentials,
        logger: Logger,
    ) -> Result<Self> {
        let mut stream = FtpStream::connect(endpoint).await?;
        logger
            .info(&format!(
                "Connected to {} ({})",
                endpoint,
                stream.welcome_msg().unwrap_or("no greeting text")
            ))
            .await;

        let (user, password) = credentials
            .pair()
            .unwrap_or((ANONYMOUS_USER, ANONYMOUS_PASSWORD));

        let authenticated = async {
            stream.login(user, password).await?;
            stream.binary().await
        }
        .await;

        if let Err(err) = authenticated {
            let _ = stream.quit().await;
            return Err(err);
        }
        logger.info(&format!("Logged in as {}", user)).await;

        Ok(Self::new(stream, logger))
    }
}

impl<S: FtpSession> TransferController<S> {
    pub fn new(session: S, logger: Logger) -> Self {
        Self {
            session: Some(session),
            logger,
        }
    }

    fn session(&mut self) -> Result<&mut S> {
        self.session
            .as_mut()
            .ok_or_else(|| NetError::Protocol("FTP session already closed".to_string()))
    }

    pub async fn list(&mut self) -> Result<Vec<String>> {
        let lines = self.session()?.list().await?;
        self.logger
            .info(&format!("Directory listing returned {} entries", lines.len()))
            .await;
        Ok(lines)
    }

    /// Uploads `request.local_path`. A missing or unreadable source fails
    /// before any command reaches the server.
    pub async fn upload(&mut self, request: &TransferRequest) -> Result<TransferResult> {
        let local_size = match tokio::fs::metadata(&request.local_path).await {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => return Err(NetError::LocalFileNotFound(request.local_path.clone())),
        };
        let mut source = tokio::fs::File::open(&request.local_path)
            .await
            .map_err(|_| NetError::LocalFileNotFound(request.local_path.clone()))?;

        let bytes = self
            .session()?
            .store(&request.remote_name, &mut source)
            .await?;

        self.logger
            .info(&format!(
                "Uploaded {} -> {} ({} bytes)",
                request.local_path.display(),
                request.remote_name,
                bytes
            ))
            .await;
        Ok(TransferResult::uploaded(bytes, local_size))
    }

    /// Downloads `request.remote_name`, then compares the server's SIZE with
    /// the local file.
    pub async fn download(&mut self, request: &TransferRequest) -> Result<TransferResult> {
        if let Some(dir) = request.local_path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|source| NetError::LocalIo {
                        path: dir.to_path_buf(),
                        source,
                    })?;
            }
        }

        let mut sink = tokio::fs::File::create(&request.local_path)
            .await
            .map_err(|source| NetError::LocalIo {
                path: request.local_path.clone(),
                source,
            })?;
        let bytes = self
            .session()?
            .retrieve(&request.remote_name, &mut sink)
            .await?;
        sink.flush().await.map_err(|source| NetError::LocalIo {
            path: request.local_path.clone(),
            source,
        })?;
        drop(sink);

        self.logger
            .info(&format!(
                "Downloaded {} -> {} ({} bytes)",
                request.remote_name,
                request.local_path.display(),
                bytes
            ))
            .await;

        let remote_size = match self.session()?.size(&request.remote_name).await {
            Ok(size) => size,
            Err(err) => {
                self.logger
                    .warn(&format!("SIZE {} failed: {}", request.remote_name, err))
                    .await;
                None
            }
        };
        let local_size = tokio::fs::metadata(&request.local_path)
            .await
            .ok()
            .map(|metadata| metadata.len());

        Ok(TransferResult::downloaded(bytes, remote_size, local_size))
    }

    /// Listing, then upload, then download. Each step is attempted on its own
    /// and reported as it completes.
    pub async fn run(&mut self, plan: &TransferPlan, reporter: &Reporter<'_>) -> RunReport {
        let mut report = RunReport::default();

        reporter.console("Directory listing:");
        reporter.step(Step::List, "Listing remote directory").await;
        match self.list().await {
            Ok(lines) => {
                for line in &lines {
                    reporter.console(line);
                }
                report.listing = Some(lines);
            }
            Err(err) => {
                let err = anyhow::Error::new(err).context("LIST");
                reporter.step_failed(Step::List, "directory listing", &err).await;
            }
        }

        if let Some(request) = &plan.upload {
            let result = self.upload(request).await;
            match &result {
                Ok(_) => {
                    reporter
                        .step(
                            Step::Transfer,
                            &format!(
                                "Uploaded {} -> {}",
                                request.local_path.display(),
                                request.remote_name
                            ),
                        )
                        .await;
                    reporter.console(&format!(
                        "Uploaded: {} -> {}",
                        request.local_path.display(),
                        request.remote_name
                    ));
                }
                Err(err) => {
                    let err = anyhow::anyhow!("{}", err)
                        .context(format!("STOR {}", request.remote_name));
                    reporter.step_failed(Step::Transfer, "upload", &err).await;
                }
            }
            report.upload = Some(result);
        }

        if let Some(request) = &plan.download {
            let result = self.download(request).await;
            match &result {
                Ok(transfer) => {
                    reporter
                        .step(
                            Step::Transfer,
                            &format!(
                                "Downloaded {} -> {}",
                                request.remote_name,
                                request.local_path.display()
                            ),
                        )
                        .await;
                    reporter.console(&format!(
                        "Downloaded: {} -> {}",
                        request.remote_name,
                        request.local_path.display()
                    ));
                    report_verification(transfer, reporter).await;
                }
                Err(err) => {
                    let err = anyhow::anyhow!("{}", err)
                        .context(format!("RETR {}", request.remote_name));
                    reporter.step_failed(Step::Transfer, "download", &err).await;
                }
            }
            report.download = Some(result);
        }

        report
    }

    /// Sends QUIT (best effort) and drops the connection.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.quit().await {
                self.logger
                    .warn(&format!("QUIT failed, dropping connection: {}", err))
                    .await;
            }
        }
    }
}

async fn report_verification(transfer: &TransferResult, reporter: &Reporter<'_>) {
    match transfer.verification() {
        Verification::Verified => {
            reporter
                .step(Step::Verify, "remote and local sizes match")
                .await;
            reporter.console("Verification OK: file sizes match.");
        }
        Verification::Mismatch { .. } | Verification::Indeterminate => {
            let detail = format!(
                "remote_size={}, local_size={}",
                OptSize(transfer.remote_size),
                OptSize(transfer.local_size)
            );
            let label = match transfer.mismatch() {
                Some(err) => {
                    reporter.warn(Step::Verify, &err.to_string()).await;
                    "WARNING"
                }
                None => {
                    reporter
                        .warn(Step::Verify, &format!("sizes unresolved: {}", detail))
                        .await;
                    "INDETERMINATE"
                }
            };
            reporter.console(&format!("Verification {}: {}", label, detail));
        }
        Verification::NotChecked => {}
    }
}

/// Connects, runs `plan` and closes the session.
pub async fn transfer(
    endpoint: &Endpoint,
    credentials: &Credentials,
    plan: &TransferPlan,
    logger: &Logger,
    reporter: &Reporter<'_>,
) -> anyhow::Result<RunReport> {
    let mut controller = TransferController::connect(endpoint, credentials, logger.clone())
        .await
        .with_context(|| format!("FTP session to {}", endpoint))?;
    reporter
        .step(Step::Auth, &format!("Authenticated on {}", endpoint))
        .await;

    let report = controller.run(plan, reporter).await;
    controller.close().await;
    Ok(report)
}
