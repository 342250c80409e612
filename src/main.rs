//! powertrail - power telemetry rollup, retention and cost service.

mod config;
mod db;
mod metering;
mod pipeline;
mod query;
mod scheduler;
mod status;
mod web;

use config::Config;
use db::Store;
use pipeline::Pipeline;
use scheduler::Scheduler;
use web::Server;

use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "powertrail", version, about = "Power telemetry rollup and retention")]
struct Cli {
    /// Overrides POWERTRAIL_DB_PATH.
    #[arg(long, global = true)]
    db_path: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the rollup and retention pipeline once and print its report.
    Run,
    /// Start the scheduler and the HTTP API.
    Serve {
        /// Overrides POWERTRAIL_HTTP_PORT.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("powertrail=info".parse()?))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut cfg = Config::load();
    if let Some(path) = cli.db_path {
        cfg.db_path = path;
    }
    if let Command::Serve { port: Some(port) } = cli.command {
        cfg.http_port = port;
    }
    cfg.validate()?;
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Store::new(&cfg.db_path)?;
    tracing::info!("Database initialized successfully");

    match cli.command {
        Command::Run => {
            let pipeline = Pipeline::new(store, &cfg);
            let report = tokio::task::spawn_blocking(move || pipeline.run(Utc::now())).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.is_failed() {
                std::process::exit(1);
            }
        }
        Command::Serve { .. } => {
            tracing::info!("Starting powertrail on port {}...", cfg.http_port);

            let scheduler = Arc::new(Scheduler::new(store.clone(), &cfg));
            scheduler.start();

            let server = Server::new(cfg, store, scheduler);
            server.start().await?;
        }
    }

    Ok(())
}
