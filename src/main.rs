use std::process;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::Parser;
use regex::bytes::Regex;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use redis_resharding_proxy::engine::connection::handle_slave;
use redis_resharding_proxy::engine::ProxyConfig;

/// Transparent proxy between a Redis master and a replicating slave that
/// keeps only the keys matching PATTERN, so a slave can be populated with a
/// subset of the master's keyspace.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Master Redis host
    #[arg(long, default_value = "localhost")]
    master_host: String,

    /// Master Redis port
    #[arg(long, default_value_t = 6379)]
    master_port: u16,

    /// Proxy listening interface, default is on all interfaces
    #[arg(long, default_value = "")]
    proxy_host: String,

    /// Proxy port for listening
    #[arg(long, default_value_t = 6380)]
    proxy_port: u16,

    /// Regular expression to match against the Redis keys
    pattern: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => process::exit(0),
                _ => process::exit(1),
            }
        }
    };

    let key_pattern = match Regex::new(&cli.pattern) {
        Ok(pattern) => pattern,
        Err(err) => {
            eprintln!("wrong format of regular expression: {}", err);
            process::exit(1);
        }
    };

    let config = Arc::new(ProxyConfig {
        master_host: cli.master_host,
        master_port: cli.master_port,
        key_pattern,
    });

    info!(
        "redis resharding proxy configured for Redis master at {}:{}",
        config.master_host, config.master_port
    );
    info!(
        "waiting for connection from slave at {}:{}",
        cli.proxy_host, cli.proxy_port
    );

    let bind_host = if cli.proxy_host.is_empty() {
        "0.0.0.0"
    } else {
        cli.proxy_host.as_str()
    };

    let listener = match TcpListener::bind((bind_host, cli.proxy_port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("unable to listen on {}:{}: {}", bind_host, cli.proxy_port, err);
            process::exit(1);
        }
    };

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_slave(config.clone(), stream));
            }
            Err(err) => {
                error!("unable to accept: {}", err);
            }
        }
    }
}
