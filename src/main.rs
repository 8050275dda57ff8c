//! kvi: a sharded in-memory key-value server.
//!
//! This is the binary entry point: flag parsing, logging setup, signal
//! wiring, and the run loop. Everything else lives in the library.

use kvi::{Config, ConfigError, LogLevel, Server, VERSION};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };

    if cli.help {
        print_help();
        return Ok(());
    }
    if cli.version {
        println!("kvi {VERSION}");
        return Ok(());
    }

    let mut config = Config::default();
    if !cli.ips.is_empty() {
        config.ips = cli.ips;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(shards) = cli.shards {
        config.shards = shards;
    }
    if let Some(accepters) = cli.accepters {
        config.accepters = accepters;
    }
    if let Some(loglevel) = cli.loglevel {
        config.loglevel = loglevel;
    }
    if let Err(err) = config.validate() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.loglevel.directive()));
    fmt().with_env_filter(filter).with_target(false).init();

    info!("kvi {VERSION} starting");

    let server = match Server::bind(config).await {
        Ok(server) => Arc::new(server),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };

    let signal_server = server.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("received shutdown signal");
        signal_server.shutdown();
    });

    server.run().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// CLI arguments.
struct CliArgs {
    ips: Vec<IpAddr>,
    port: Option<u16>,
    shards: Option<usize>,
    accepters: Option<usize>,
    loglevel: Option<LogLevel>,
    help: bool,
    version: bool,
}

fn parse_args(args: &[String]) -> Result<CliArgs, ConfigError> {
    let mut cli = CliArgs {
        ips: Vec::new(),
        port: None,
        shards: None,
        accepters: None,
        loglevel: None,
        help: false,
        version: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--ip" => {
                i += 1;
                let value = args.get(i).ok_or(ConfigError::MissingValue("--ip"))?;
                let ip = value.parse().map_err(|_| ConfigError::InvalidValue {
                    flag: "--ip",
                    value: value.clone(),
                })?;
                cli.ips.push(ip);
            }
            "--port" => {
                i += 1;
                let value = parse_positive(args.get(i), "--port")?;
                let port = u16::try_from(value).map_err(|_| ConfigError::InvalidValue {
                    flag: "--port",
                    value: value.to_string(),
                })?;
                cli.port = Some(port);
            }
            "--shards" => {
                i += 1;
                cli.shards = Some(parse_positive(args.get(i), "--shards")?);
            }
            "--accepters" => {
                i += 1;
                cli.accepters = Some(parse_positive(args.get(i), "--accepters")?);
            }
            "--log" => {
                i += 1;
                let value = args.get(i).ok_or(ConfigError::MissingValue("--log"))?;
                let level = LogLevel::parse(value).ok_or_else(|| ConfigError::InvalidValue {
                    flag: "--log",
                    value: value.clone(),
                })?;
                cli.loglevel = Some(level);
            }
            "--help" => cli.help = true,
            "--version" => cli.version = true,
            other => return Err(ConfigError::UnknownFlag(other.to_string())),
        }
        i += 1;
    }

    Ok(cli)
}

fn parse_positive(value: Option<&String>, flag: &'static str) -> Result<usize, ConfigError> {
    let value = value.ok_or(ConfigError::MissingValue(flag))?;
    let parsed: usize = value.parse().map_err(|_| ConfigError::InvalidValue {
        flag,
        value: value.clone(),
    })?;
    if parsed == 0 {
        return Err(ConfigError::NotPositive(flag));
    }
    Ok(parsed)
}

fn print_help() {
    println!(
        r"kvi {VERSION} - a sharded in-memory key-value server

USAGE:
    kvi [OPTIONS]

OPTIONS:
        --ip <ADDR>         Listen address; may be repeated (default: 0.0.0.0)
        --port <PORT>       Listening port (default: 20252)
        --shards <NUM>      Number of shards (default: host CPU count)
        --accepters <NUM>   Accepter tasks per listener (default: 1)
        --log <LEVEL>       Log level: debug, info, warn, error, none (default: info)
        --help              Print this help message
        --version           Print version information

SIGNALS:
    SIGINT/SIGTERM  Graceful shutdown
"
    );
}
