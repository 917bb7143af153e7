use protoprobe::cli::FtpClientOpt;
use protoprobe::ftp;
use protoprobe::utils::Logger;
use structopt::StructOpt;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opt = FtpClientOpt::from_args();

    let logger = match Logger::new(Some(opt.log_file.clone()), "ftp_client") {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("[WARNING] Cannot open log file {:?}: {:#}", opt.log_file, e);
            Logger::console("ftp_client")
        }
    };

    ftp::run_client(&opt, &logger).await;
    logger.flush().await;
}
