use std::sync::Arc;

use anyhow::Result;
use protoprobe::cli::SmtpServerOpt;
use protoprobe::smtp::{SmtpDebugServer, SmtpServerConfig};
use protoprobe::tls;
use protoprobe::utils::Logger;
use structopt::StructOpt;

#[tokio::main]
async fn main() -> Result<()> {
    let opt = SmtpServerOpt::from_args();

    println!("==========================================");
    println!("SMTP debug server v{}", env!("CARGO_PKG_VERSION"));
    println!("==========================================");

    let logger = match Logger::new(opt.log_file.clone(), "smtp_debug_server") {
        Ok(logger) => logger.with_raw_display(opt.raw_display),
        Err(e) => {
            eprintln!("[ERROR] Failed to open log file: {:#}", e);
            std::process::exit(1);
        }
    };

    let tls_acceptor = match (&opt.tls_cert, &opt.tls_key) {
        (Some(cert), Some(key)) => match tls::load_acceptor(cert, key) {
            Ok(acceptor) => {
                eprintln!("[INFO] STARTTLS enabled with certificate: {:?}", cert);
                Some(acceptor)
            }
            Err(e) => {
                eprintln!("[ERROR] Failed to load TLS material: {:#}", e);
                std::process::exit(1);
            }
        },
        (None, None) => None,
        _ => {
            eprintln!("[WARNING] --tls-cert and --tls-key must be given together, STARTTLS disabled");
            None
        }
    };

    let config = SmtpServerConfig {
        address: opt.address.clone(),
        port: opt.port,
        hostname: opt.hostname.clone(),
        data_dir: opt.data_dir.clone(),
    };
    let server = match SmtpDebugServer::new(config, tls_acceptor, logger) {
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
    println!("[INFO] Hostname: {}", opt.hostname);
    if let Some(data_dir) = &opt.data_dir {
        println!("[INFO] Saving messages to {:?}", data_dir);
    }
    println!("[INFO] Press Ctrl+C to stop");

    server.serve(listener).await
}
