use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Result, bail};
use clap::{Parser, builder::PossibleValuesParser};
use log::{LevelFilter, info};
use tokio::runtime;

mod body;
mod config;
mod context;
mod http;
mod logger;
mod reader;
mod relay;
mod tcp;
mod tls;
mod zc;

use crate::{config::Config, logger::Logger};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(
        long,
        value_parser=PossibleValuesParser::new(["error", "warn", "info", "debug", "trace"]),
        default_value = "info",
        help = "Log level",
    )]
    pub(crate) log_level: String,
    #[arg(
        short,
        long,
        help = "Path to the configuration file, built-in defaults are used if not set"
    )]
    config: Option<PathBuf>,
    #[arg(
        short,
        long,
        help = "Address to listen on, overrides the one of the configuration"
    )]
    bind: Option<SocketAddr>,
}

fn main() -> Result<()> {
    // Start by parsing the cli arguments.
    let args = Args::parse();

    // Set the log level.
    let log_level = match args.log_level.as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        x => bail!("Invalid log_level: {}", x),
    };
    Logger::init(log_level)?;

    // Parse the configuration file, if any.
    let mut config = match args.config {
        Some(path) => Config::from_file(path)?,
        None => {
            info!("No configuration file given, using defaults");
            Config::default()
        }
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    // Start the listener and handle incoming connections.
    runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(tcp::listen_and_proxy(Arc::new(config)))
}
