use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sideband::carrier::http::HttpCarrier;
use sideband::config::{Config, LogConfig};
use sideband::crypto;
use sideband::runtime::Engine;

#[derive(Parser, Debug)]
#[command(author, about = "SOCKS5 proxy tunneled through a social platform", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        default_value = "config.json",
        help = "Path to configuration file"
    )]
    config: PathBuf,

    #[arg(long, help = "Print version and exit")]
    version: bool,

    #[arg(long, help = "Generate a fresh 32-byte hex secret and exit")]
    secret: bool,
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{err}");
            1
        }
    };

    std::process::exit(code);
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    if args.version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if args.secret {
        println!("{}", crypto::generate_secret());
        return Ok(());
    }

    let cfg = Config::load_from_file(&args.config)?;
    cfg.validate()?;

    init_tracing(&cfg.log)?;

    let carrier = Arc::new(HttpCarrier::new(cfg.api.clone()));
    let engine = Engine::new(cfg, carrier)?;

    engine.validate_platform().await?;

    let handle = engine.clone().start().await?;

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
        engine.shutdown();
    });

    handle.wait().await?;

    Ok(())
}

fn init_tracing(log: &LogConfig) -> Result<(), std::io::Error> {
    let filter = EnvFilter::builder()
        .with_default_directive(log.level_as_tracing().into())
        .from_env_lossy();

    if log.output.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log.output)?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    }

    Ok(())
}
