//! Harness process: bring up the fleet, seed the overlay with the test
//! identifiers, serve the control plane for the configured duration, then
//! shut everything down.

use clap::Parser;
use dht_tester::{
    config::{self, HarnessConfig},
    fleet::{Fleet, FleetContext},
    rpc,
};
use std::{net::SocketAddr, process, time::Duration};
use tokio::time;

#[derive(Debug, Parser)]
#[command(name = "dht-tester", about = "test a fleet of nodes running a kademlia DHT")]
struct Args {
    /// number of nodes to run
    #[arg(long, default_value_t = config::DEFAULT_COUNT)]
    count: usize,

    /// length of time to run the simulation, in seconds
    #[arg(long, default_value_t = config::DEFAULT_DURATION_SECS)]
    duration: u64,

    /// automatically provide and look up test cids
    #[arg(long)]
    auto: bool,

    /// prefix length for lookups; 0 looks up the full double-hash
    #[arg(long, default_value_t = 0)]
    prefix_length: u64,

    /// number of test cids to generate
    #[arg(long, default_value_t = config::DEFAULT_NUM_TEST_CIDS)]
    num_test_cids: usize,

    /// log level: one of [error|warn|info|debug]
    #[arg(long, default_value = "info")]
    log: String,

    /// address for the rpc server to listen on
    #[arg(long, default_value = "127.0.0.1:9000")]
    rpc_addr: SocketAddr,

    /// base listening port; node i listens on base-port + i
    #[arg(long, default_value_t = config::DEFAULT_BASE_PORT)]
    base_port: u16,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(error) = run(args).await {
        print_error(error.as_ref());
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let level = config::parse_log_level(&args.log)?;
    pretty_env_logger::formatted_builder()
        .filter_level(level)
        .init();

    let config = HarnessConfig {
        count: args.count,
        duration: Duration::from_secs(args.duration),
        auto_test: args.auto,
        prefix_length: config::validate_prefix_length(args.prefix_length)?,
        num_test_cids: args.num_test_cids,
        base_port: args.base_port,
        rpc_addr: args.rpc_addr,
        ..HarnessConfig::default()
    };
    config.validate()?;

    let ctx = FleetContext::new(config.num_test_cids);
    let fleet = Fleet::build(&config, &ctx).await?;

    // Seed the overlay: one host provides each test identifier.
    for (i, cid) in ctx.test_cids.iter().enumerate() {
        if let Some(node) = fleet.get(i % config.count) {
            node.provide(std::slice::from_ref(cid)).await;
        }
    }

    let server = rpc::Server::start(fleet.clone(), config.rpc_addr).await?;

    log::info!("running for {}s", config.duration.as_secs());
    time::sleep(config.duration).await;

    fleet.shutdown().await?;
    server.stop().await;

    Ok(())
}

fn print_error(error: &dyn std::error::Error) {
    eprintln!("dht-tester: {}", error);

    let mut source = error.source();
    while let Some(cause) = source {
        eprintln!("    caused by: {}", cause);
        source = cause.source();
    }
}
