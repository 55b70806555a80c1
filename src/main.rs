//! Crypto price alerts - main entry point
//!
//! This binary provides two subcommands:
//! - replay: Feed a recorded price stream through the alert engine
//! - check-config: Validate a settings file

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "crypto-alerts")]
#[command(about = "Price alert and regime decision engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a CSV of price samples through the engine
    Replay {
        /// Path to settings file
        #[arg(short, long, default_value = "configs/btc.json")]
        config: String,

        /// Sample CSV (timestamp_ms,price[,volume])
        #[arg(short, long)]
        input: String,

        /// Manual anchor price set before the first sample
        #[arg(long)]
        anchor: Option<f64>,

        /// 4h candle CSV for the auto-anchor
        #[arg(long)]
        candles_4h: Option<String>,

        /// 1d candle CSV for the auto-anchor
        #[arg(long)]
        candles_1d: Option<String>,
    },

    /// Validate a settings file
    CheckConfig {
        /// Path to settings file
        #[arg(short, long, default_value = "configs/btc.json")]
        config: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Replay { .. } => "replay",
        Commands::CheckConfig { .. } => "check_config",
    };
    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Replay {
            config,
            input,
            anchor,
            candles_4h,
            candles_1d,
        } => commands::replay::run(config, input, anchor, candles_4h, candles_1d),

        Commands::CheckConfig { config } => commands::check_config::run(config),
    }
}
