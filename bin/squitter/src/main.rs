//! Ingests BaseStation (SBS-1) aircraft feeds, throttles redundant messages per aircraft, and writes the remaining
//! records to a sink in batches.

use clap::Parser as _;
use tracing::{error, info};

mod cli;
use self::cli::{Action, Cli};

mod config;
use self::config::IngestConfiguration;

mod logging;
use self::logging::initialize_logging;

mod run;
use self::run::run;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match IngestConfiguration::load(&cli) {
        Ok(config) => config,
        Err(e) => fatal_and_exit(format!("{:#}", e)),
    };

    if let Some(Action::CheckConfig) = cli.action {
        print_summary(&config);
        return;
    }

    if let Err(e) = initialize_logging(cli.log_level(), config.log_level.as_deref(), config.log_format_json) {
        fatal_and_exit(format!("Failed to initialize logging: {:#}", e));
    }

    info!(version = env!("CARGO_PKG_VERSION"), "squitter starting...");

    match run(config).await {
        Ok(_) => info!("squitter stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

fn print_summary(config: &IngestConfiguration) {
    println!("Configuration is valid.");
    println!("  batch size: {}", config.batch_size);
    match config.max_batch_age {
        Some(age) => println!("  max batch age: {:?}", age),
        None => println!("  max batch age: disabled"),
    }
    println!("  sink: {}", config.sink);
    for feed in &config.feeds {
        let accepted = feed.accepted().unwrap_or_default();
        println!(
            "  feed {} (source {}): mlat={}, timezone={}, accepts {:?}, position required={}",
            feed.address(),
            feed.source_id,
            feed.is_mlat(),
            feed.timezone(),
            accepted,
            feed.require_position
        );
    }
}
