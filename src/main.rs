//! carmine server executable
//!
//! Parses the command line, initializes logging and runs the node until
//! shutdown.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use carmine::config::{self, Config};
use carmine::error::Result;
use carmine::server::Server;

/// An in-memory key/value cache server with primary/replica replication
#[derive(Parser, Debug)]
#[command(name = "carmine")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(
        short = 'p',
        long = "port",
        value_name = "PORT",
        env = "PORT",
        default_value_t = config::DEFAULT_PORT
    )]
    port: u16,

    /// Primary to replicate from, as "<host> <port>"
    #[arg(
        short = 'r',
        long = "replicaof",
        value_name = "HOST PORT",
        env = "REPLICA_OF",
        default_value = ""
    )]
    replicaof: String,
}

impl Cli {
    fn into_config(self) -> Result<Config> {
        let replica_of = if self.replicaof.is_empty() {
            None
        } else {
            Some(config::parse_replica_of(&self.replicaof)?)
        };
        Ok(Config {
            bind: "0.0.0.0".to_string(),
            port: self.port,
            replica_of,
        })
    }
}

async fn server_main(config: Config) -> Result<()> {
    let server = Server::new(config).await?;

    if let Some((host, port)) = server.context().config.replica_of.clone() {
        info!("starting as replica of {host}:{port}");
        server.attach_to_primary().await?;
    }

    server.run().await
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match server_main(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server exited: {e}");
            ExitCode::FAILURE
        }
    }
}
