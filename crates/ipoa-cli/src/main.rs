use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ipoa_core::{normalize_record, AnalysisItem, IpoRecord};
use ipoa_sync::{AppConfig, Services};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ipoa-cli")]
#[command(about = "IPO Agent: scrape, reconcile and score upcoming IPOs")]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace). RUST_LOG wins when set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP service (default).
    Serve,
    /// Run one scrape-extract-reconcile pass and print its summary.
    Sync,
    /// Score the records currently in the sheet and print the result.
    Analyze,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Config error: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(cli.command.unwrap_or(Commands::Serve), config).await {
        error!("fatal: {err:#}");
        std::process::exit(1);
    }
}

async fn run(command: Commands, config: AppConfig) -> Result<()> {
    match command {
        Commands::Serve => ipoa_web::serve(&config).await,
        Commands::Sync => {
            let services = Services::from_config(&config)?;
            let summary = services.pipeline.run_once().await?;
            info!(run_id = %summary.run_id, outcome = ?summary.outcome, "sync complete");
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("encoding sync summary")?
            );
            Ok(())
        }
        Commands::Analyze => {
            let services = Services::from_config(&config)?;
            let records: Vec<IpoRecord> = services
                .store
                .fetch_all()
                .await
                .iter()
                .map(normalize_record)
                .filter(|r| !r.natural_key().is_empty())
                .collect();
            let items = match services.analyst.analyze(&records).await {
                Ok(items) => items,
                Err(err) => vec![AnalysisItem::error(err.to_string())],
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&items).context("encoding analysis")?
            );
            Ok(())
        }
    }
}
