use protoprobe::cli::HttpClientOpt;
use protoprobe::http;
use protoprobe::utils::Logger;
use structopt::StructOpt;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opt = HttpClientOpt::from_args();

    let logger = match Logger::new(Some(opt.log_file.clone()), "http_client") {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("[WARNING] Cannot open log file {:?}: {:#}", opt.log_file, e);
            Logger::console("http_client")
        }
    };

    http::run_client(&opt, &logger).await;
    logger.flush().await;
}
