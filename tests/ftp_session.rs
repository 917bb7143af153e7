use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use protoprobe::ftp::{self, FtpServerConfig, FtpTestServer, TransferPlan, TransferRequest};
use protoprobe::report::Reporter;
use protoprobe::utils::Logger;
use protoprobe::{Credentials, Endpoint, NetError};

async fn start_server(home: PathBuf) -> Endpoint {
    let config = FtpServerConfig {
        address: "127.0.0.1".into(),
        port: 0,
        user: "user".into(),
        password: "12345".into(),
        home,
    };
    let server = Arc::new(FtpTestServer::new(config, Logger::console("ftp_test_server")).unwrap());
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(server.serve(listener));
    Endpoint::new("127.0.0.1", port, Duration::from_secs(5)).unwrap()
}

fn user() -> Credentials {
    Credentials::new(Some("user".into()), Some("12345".into()))
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_then_download_verifies() {
    let home = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let endpoint = start_server(home.path().to_path_buf()).await;

    let sample = work.path().join("sample_upload.txt");
    std::fs::write(&sample, "Hello FTP.\n").unwrap();
    let plan = TransferPlan {
        upload: Some(TransferRequest::upload(&sample, "uploaded_sample.txt")),
        download: Some(TransferRequest::download(
            "uploaded_sample.txt",
            work.path().join("downloads"),
        )),
    };

    let logger = Logger::console("ftp_client");
    let reporter = Reporter::new(&logger, "FTP error");
    let report = ftp::transfer(&endpoint, &user(), &plan, &logger, &reporter)
        .await
        .unwrap();

    assert!(report.failures().is_empty());
    let upload = report.upload.unwrap().unwrap();
    assert_eq!(upload.bytes_transferred, 11);
    assert!(!upload.verified);

    let download = report.download.unwrap().unwrap();
    assert_eq!(download.bytes_transferred, 11);
    assert_eq!(download.remote_size, Some(11));
    assert_eq!(download.local_size, Some(11));
    assert!(download.verified);

    assert_eq!(
        std::fs::read(home.path().join("uploaded_sample.txt")).unwrap(),
        b"Hello FTP.\n"
    );
    assert_eq!(
        std::fs::read(work.path().join("downloads").join("uploaded_sample.txt")).unwrap(),
        b"Hello FTP.\n"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn anonymous_can_list_but_not_upload() {
    let home = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    std::fs::write(home.path().join("readme.txt"), "public\n").unwrap();
    let endpoint = start_server(home.path().to_path_buf()).await;

    let sample = work.path().join("up.txt");
    std::fs::write(&sample, "data").unwrap();
    let plan = TransferPlan {
        upload: Some(TransferRequest::upload(&sample, "up.txt")),
        download: Some(TransferRequest::download("readme.txt", work.path())),
    };

    let logger = Logger::console("ftp_client");
    let reporter = Reporter::new(&logger, "FTP error");
    let report = ftp::transfer(&endpoint, &Credentials::anonymous(), &plan, &logger, &reporter)
        .await
        .unwrap();

    let listing = report.listing.as_ref().unwrap();
    assert_eq!(listing.len(), 1);
    assert!(listing[0].ends_with("readme.txt"));
    assert!(report.upload.as_ref().unwrap().is_err());
    assert!(!home.path().join("up.txt").exists());
    assert!(report.download.as_ref().unwrap().as_ref().unwrap().verified);
    assert_eq!(report.failures().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_password_is_an_auth_error() {
    let home = tempfile::tempdir().unwrap();
    let endpoint = start_server(home.path().to_path_buf()).await;

    let logger = Logger::console("ftp_client");
    let reporter = Reporter::new(&logger, "FTP error");
    let credentials = Credentials::new(Some("user".into()), Some("wrong".into()));
    let err = ftp::transfer(&endpoint, &credentials, &TransferPlan::default(), &logger, &reporter)
        .await
        .unwrap_err();

    assert!(err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<NetError>(), Some(NetError::Auth(_)))));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_remote_file_fails_download_only() {
    let home = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let endpoint = start_server(home.path().to_path_buf()).await;

    let plan = TransferPlan {
        upload: None,
        download: Some(TransferRequest::download("absent.txt", work.path())),
    };
    let logger = Logger::console("ftp_client");
    let reporter = Reporter::new(&logger, "FTP error");
    let report = ftp::transfer(&endpoint, &user(), &plan, &logger, &reporter)
        .await
        .unwrap();

    assert!(report.listing.unwrap().is_empty());
    assert!(report.download.unwrap().is_err());
}
