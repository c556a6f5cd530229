//! Main entry point for the Rust Pooling Proxy

use clap::{Parser, Subcommand};
use rust_pooling_proxy::{
    cli::ServerArgs, init_logger_with_config, log_error, log_info, runtime::run_with_runtime,
    ProxyConfig,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rust-pooling-proxy")]
#[command(about = "HTTP/1.1 forwarding proxy with pooled upstream connections and per-path byte stats")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (YAML); defaults are used when it does not exist
    #[arg(short, long, global = true, default_value = "config.yml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    #[command(name = "server")]
    Server(ServerArgs),

    /// Print the effective configuration and exit
    #[command(name = "check-config")]
    CheckConfig,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ProxyConfig::load_config(&cli.config).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {:#}", e);
        std::process::exit(1);
    });

    if cli.verbose {
        config.log_level = "debug".to_string();
    } else if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    // Held until exit so buffered file logs are flushed.
    let _log_guard = init_logger_with_config(&config.log_level, &config.logging);

    match cli.command.unwrap_or(Commands::Server(ServerArgs::default())) {
        Commands::CheckConfig => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
        Commands::Server(args) => {
            log_info!("🚀 Starting Rust Pooling Proxy");
            log_info!("📋 Version: {}", env!("CARGO_PKG_VERSION"));

            let runtime_config = config.runtime.clone();
            let result = run_with_runtime(&runtime_config, args.start_server(config));
            if let Err(e) = &result {
                log_error!("Server error: {:#}", e);
            }
            result
        }
    }
}
