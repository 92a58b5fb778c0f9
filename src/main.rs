//! Portfolio monitor - main entry point
//!
//! This binary provides three subcommands:
//! - run: Run the monitoring loop (paper collaborators or a broker feed)
//! - status: Show persisted state and the most recent audit entries
//! - check-config: Load a configuration file and report validation warnings

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "portfolio-monitor")]
#[command(about = "Volatility-aware portfolio monitor with agent escalation and rule-based fallback", long_about = None)]
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
    /// Run the monitoring loop
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/monitor.json")]
        config: String,

        /// Directory for the state database and JSON backup
        #[arg(long)]
        state_dir: Option<String>,

        /// Paper quote file (prices, volatility index, RSI)
        #[arg(long, default_value = "configs/paper_quotes.json")]
        feed: String,

        /// Paper account seed file
        #[arg(long, default_value = "configs/paper_portfolio.json")]
        portfolio: String,

        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },

    /// Show persisted monitor state and recent audit entries
    Status {
        /// Directory holding the state database
        #[arg(long, default_value = "state")]
        state_dir: String,

        /// Number of audit entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Validate a configuration file
    CheckConfig {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/monitor.json")]
        config: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);
    let json = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        let console_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(false);
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(file_appender)
            .with_target(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);

        // Same format without ANSI colors
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
    }

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Status { .. } => "status",
        Commands::CheckConfig { .. } => "check_config",
    };

    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Run {
            config,
            state_dir,
            feed,
            portfolio,
            once,
        } => commands::run::run(config, state_dir, feed, portfolio, once),

        Commands::Status { state_dir, limit } => commands::status::run(state_dir, limit),

        Commands::CheckConfig { config } => commands::check_config::run(config),
    }
}
