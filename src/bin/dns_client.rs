use protoprobe::cli::DnsClientOpt;
use protoprobe::dns;
use protoprobe::utils::Logger;
use structopt::StructOpt;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opt = DnsClientOpt::from_args();

    let logger = match Logger::new(Some(opt.log_file.clone()), "dns_client") {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("[WARNING] Cannot open log file {:?}: {:#}", opt.log_file, e);
            Logger::console("dns_client")
        }
    };

    dns::run_client(&opt, &logger).await;
    logger.flush().await;
}
