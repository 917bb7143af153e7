//! Runs every client demo in turn. The SMTP and FTP demos expect
//! `smtp-debug-server` and `ftp-test-server` to be running locally.

use std::path::{Path, PathBuf};

use protoprobe::cli::{DnsClientOpt, FtpClientOpt, HttpClientOpt, RunAllOpt, SmtpClientOpt};
use protoprobe::report::Outcome;
use protoprobe::utils::Logger;
use protoprobe::{dns, ftp, http, smtp};
use structopt::StructOpt;

const SAMPLE_UPLOAD: &str = "sample_upload.txt";

fn announce(args: &[String]) {
    println!("\n$ {}", args.join(" "));
}

fn logger_for(log_file: &Path, component: &str) -> Logger {
    Logger::new(Some(log_file.to_path_buf()), component).unwrap_or_else(|e| {
        eprintln!("[WARNING] Cannot open log file {:?}: {:#}", log_file, e);
        Logger::console(component)
    })
}

fn note(outcome: Outcome) {
    if let Outcome::Failure(reason) = outcome {
        println!("Command failed: {}", reason);
    }
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn ensure_sample(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::write(path, "Hello FTP.\n")?;
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opt = RunAllOpt::from_args();

    if !opt.skip_http {
        let argv = args(&[
            "http-client",
            "--url",
            "https://httpbin.org/get",
            "--post-url",
            "https://httpbin.org/post",
        ]);
        announce(&argv);
        let http_opt = HttpClientOpt::from_iter(&argv);
        let logger = logger_for(&http_opt.log_file, "http_client");
        note(http::run_client(&http_opt, &logger).await);
        logger.flush().await;
    }

    let smtp_port = opt.smtp_port.to_string();
    let argv = args(&[
        "smtp-client",
        "--host",
        "127.0.0.1",
        "--port",
        smtp_port.as_str(),
        "--from",
        "demo@local",
        "--to",
        "receiver@local",
        "--subject",
        "Protocol probe orchestrator test",
        "--body",
        "Hello from run-all via local SMTP!",
    ]);
    announce(&argv);
    let smtp_opt = SmtpClientOpt::from_iter(&argv);
    let logger = logger_for(&smtp_opt.log_file, "smtp_client");
    note(smtp::run_client(&smtp_opt, &logger).await);
    logger.flush().await;

    let sample = PathBuf::from(SAMPLE_UPLOAD);
    if let Err(e) = ensure_sample(&sample) {
        println!("Cannot create {}: {}", SAMPLE_UPLOAD, e);
    }
    let ftp_port = opt.ftp_port.to_string();
    let argv = args(&[
        "ftp-client",
        "--host",
        "127.0.0.1",
        "--port",
        ftp_port.as_str(),
        "--user",
        "user",
        "--password",
        "12345",
        "--upload",
        SAMPLE_UPLOAD,
        "--remote-name",
        "uploaded_sample.txt",
        "--download",
        "uploaded_sample.txt",
        "--download-dir",
        "downloads",
    ]);
    announce(&argv);
    let ftp_opt = FtpClientOpt::from_iter(&argv);
    let logger = logger_for(&ftp_opt.log_file, "ftp_client");
    note(ftp::run_client(&ftp_opt, &logger).await);
    logger.flush().await;

    let argv = args(&["dns-client", "--domain", opt.domain.as_str(), "--out", "logs/dns_results.txt"]);
    announce(&argv);
    let dns_opt = DnsClientOpt::from_iter(&argv);
    let logger = logger_for(&dns_opt.log_file, "dns_client");
    note(dns::run_client(&dns_opt, &logger).await);
    logger.flush().await;
}
