use protoprobe::cli::SmtpClientOpt;
use protoprobe::smtp;
use protoprobe::utils::Logger;
use structopt::StructOpt;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opt = SmtpClientOpt::from_args();

    let logger = match Logger::new(Some(opt.log_file.clone()), "smtp_client") {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("[WARNING] Cannot open log file {:?}: {:#}", opt.log_file, e);
            Logger::console("smtp_client")
        }
    };

    smtp::run_client(&opt, &logger).await;
    logger.flush().await;
}
