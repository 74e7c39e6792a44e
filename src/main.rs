use std::process;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use acp::{config, is_cancelled, strategy};

#[derive(Parser)]
#[command(name = "acp")]
#[command(about = "Transfer files between your devices over a direct encrypted connection")]
#[command(version)]
struct Cli {
    /// Save files to target directory / rename received file ("-" for stdout)
    #[arg(short = 'd', value_name = "TARGET", default_value = ".")]
    destination: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Initialize config or display current config
    #[arg(long)]
    setup: bool,

    /// Initialize config with the specified value
    #[arg(long = "setup-with", value_name = "JSON")]
    setup_with: Option<String>,

    /// Files or directories to send; with none given, receive instead
    files: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if cli.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    if cli.setup || cli.setup_with.is_some() {
        if let Err(e) = config::setup(cli.setup_with.as_deref(), &config::config_path()) {
            eprintln!("{e}");
            process::exit(1);
        }
        return;
    }

    let conf = match config::load(&config::config_path()) {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    if let Err(e) = strategy::transfer(&conf, &cli.files, &cli.destination, &cancel).await {
        // a user-initiated abort exits silently
        if !is_cancelled(&e) {
            eprintln!("{e}");
        }
        process::exit(1);
    }
}
