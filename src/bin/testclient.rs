//! External verification driver: derives the test identifier sequence,
//! assigns each identifier to two providing hosts round-robin, then checks
//! every host's view of every identifier. Exits non-zero the moment a
//! missing or inconsistent provider set is detected.

use clap::Parser;
use dht_tester::{config, content::ContentId, rpc, tester};
use std::{process, time::Duration};

#[derive(Debug, Parser)]
#[command(name = "testclient", about = "round-robin verification driver for dht-tester")]
struct Args {
    /// length of time to run verification, in seconds
    #[arg(long, default_value_t = config::DEFAULT_DURATION_SECS)]
    duration: u64,

    /// number of test cids to generate; must match the harness
    #[arg(long, default_value_t = config::DEFAULT_NUM_TEST_CIDS)]
    num_test_cids: usize,

    /// prefix length for lookups; 0 looks up the full double-hash
    #[arg(long, default_value_t = 0)]
    prefix_length: u64,

    /// endpoint of the server
    #[arg(long, default_value = config::DEFAULT_RPC_ENDPOINT)]
    endpoint: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let prefix_length = match config::validate_prefix_length(args.prefix_length) {
        Ok(prefix_length) => prefix_length,
        Err(error) => {
            eprintln!("testclient: {}", error);
            process::exit(1);
        }
    };

    let cids = ContentId::test_set(args.num_test_cids);
    let client = rpc::Client::new(args.endpoint);
    let deadline = Duration::from_secs(args.duration);

    match tester::run(&client, &cids, prefix_length, true, deadline).await {
        Ok(tester::Outcome::Verified) => {
            log::info!("verification completed: all hosts agree on all providers");
        }
        Ok(tester::Outcome::DeadlineExpired) => {
            log::info!("duration budget expired before verification finished");
        }
        Err(failure) => {
            log::error!("verification failed: {}", failure);

            let mut source = std::error::Error::source(&failure);
            while let Some(cause) = source {
                log::error!("    caused by: {}", cause);
                source = cause.source();
            }

            process::exit(1);
        }
    }
}
