//! CLI client for a running harness: provide identifiers, look them up, or
//! ask for a node's peer identifier, all through the control plane.

use clap::{Parser, Subcommand};
use dht_tester::{config, content::ContentId, rpc};
use std::process;

#[derive(Debug, Parser)]
#[command(name = "dht-tester-cli", about = "CLI for dht-tester")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// provide cids
    #[command(visible_alias = "p")]
    Provide {
        /// comma-separated list of cids to provide
        #[arg(long, value_delimiter = ',', required = true)]
        cids: Vec<String>,

        /// index of the host which should provide
        #[arg(long, default_value_t = 0)]
        host_index: usize,

        /// endpoint of the server
        #[arg(long, default_value = config::DEFAULT_RPC_ENDPOINT)]
        endpoint: String,
    },

    /// look up providers for a cid
    #[command(visible_alias = "l")]
    Lookup {
        /// cid to look up
        #[arg(long)]
        cid: String,

        /// index of the host which should look up
        #[arg(long, default_value_t = 0)]
        host_index: usize,

        /// prefix length for the lookup; 0 looks up the full double-hash
        #[arg(long, default_value_t = 0)]
        prefix_length: u64,

        /// endpoint of the server
        #[arg(long, default_value = config::DEFAULT_RPC_ENDPOINT)]
        endpoint: String,
    },

    /// get the peer id for a specific host index
    Id {
        /// index of the host
        #[arg(long, default_value_t = 0)]
        host_index: usize,

        /// endpoint of the server
        #[arg(long, default_value = config::DEFAULT_RPC_ENDPOINT)]
        endpoint: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(error) = run(Cli::parse()).await {
        eprintln!("dht-tester-cli: {}", error);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Provide {
            cids,
            host_index,
            endpoint,
        } => {
            let client = rpc::Client::new(endpoint);

            // Skip identifiers that fail to parse, provide the rest.
            let mut parsed = Vec::with_capacity(cids.len());
            for cid in &cids {
                match cid.parse::<ContentId>() {
                    Ok(cid) => parsed.push(cid),
                    Err(_) => println!("failed to decode cid string: {}", cid),
                }
            }

            client.provide(host_index, &parsed).await?;
            Ok(())
        }
        Command::Lookup {
            cid,
            host_index,
            prefix_length,
            endpoint,
        } => {
            // Validated before any network call.
            let prefix_length = config::validate_prefix_length(prefix_length)?;
            let cid: ContentId = cid.parse()?;

            let client = rpc::Client::new(endpoint);
            let providers = client.lookup(host_index, &cid, prefix_length).await?;

            println!("found {} providers for cid {}", providers.len(), cid);
            for (i, provider) in providers.iter().enumerate() {
                println!("\tprovider {}: {} {:?}", i, provider.id, provider.addrs);
            }
            Ok(())
        }
        Command::Id {
            host_index,
            endpoint,
        } => {
            let client = rpc::Client::new(endpoint);
            let id = client.id(host_index).await?;

            println!("peer ID of host {}: {}", host_index, id);
            Ok(())
        }
    }
}
