use std::sync::Arc;

use anyhow::Result;
use protoprobe::cli::FtpServerOpt;
use protoprobe::ftp::{FtpServerConfig, FtpTestServer};
use protoprobe::utils::Logger;
use structopt::StructOpt;

#[tokio::main]
async fn main() -> Result<()> {
    let opt = FtpServerOpt::from_args();

    println!("==========================================");
    println!("FTP test server v{}", env!("CARGO_PKG_VERSION"));
    println!("==========================================");

    let logger = match Logger::new(opt.log_file.clone(), "ftp_test_server") {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("[ERROR] Failed to open log file: {:#}", e);
            std::process::exit(1);
        }
    };

    let config = FtpServerConfig {
        address: opt.address.clone(),
        port: opt.port,
        user: opt.user.clone(),
        password: opt.password.clone(),
        home: opt.home.clone(),
    };
    let server = match FtpTestServer::new(config, logger) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            eprintln!("[ERROR] Failed to create server: {:#}", e);
            std::process::exit(1);
        }
    };
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("[ERROR] {:#}", e);
            std::process::exit(1);
        }
    };

    println!("[INFO] PID: {}", std::process::id());
    println!("[INFO] User: {} (full access), anonymous (read-only)", opt.user);
    println!("[INFO] Home: {:?}", opt.home);
    println!("[INFO] Press Ctrl+C to stop");

    server.serve(listener).await
}
