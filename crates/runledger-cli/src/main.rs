mod render;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use runledger_config::{AppConfig, ConfigLoader};
use runledger_db::RecordStore;
use runledger_engine::open_record_store;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "runledger", version, about = "Inspect and reconcile the migration ledger")]
struct Cli {
    /// Config file (YAML or TOML). Defaults to ~/.runledger/config.yml.
    #[arg(long, short, global = true, env = "RUNLEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite ledger file, overriding the configured path.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Table holding the migration records.
    #[arg(long, global = true)]
    collection: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the migration table if it does not exist.
    Init,
    /// List every registered migration in execution order.
    #[command(alias = "status")]
    List,
    /// Print one migration record as JSON.
    Show { key: String },
    /// Return a stuck (running) or failed migration to pending.
    Reset { key: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    if config.database.path.is_none() {
        anyhow::bail!("no ledger configured: pass --db or set database.path / RUNLEDGER_DB_PATH");
    }
    let store = open_record_store(&config.database).context("failed to open migration ledger")?;

    match cli.command {
        Command::Init => {
            store.ensure_collection().await?;
            info!("migration table {} is ready", store.collection());
        }
        Command::List => {
            let records = store.list_records().await?;
            print!("{}", render::records_table(&records));
        }
        Command::Show { key } => match store.find_by_key(&key).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => {
                eprintln!("migration {key} not found");
                return Ok(ExitCode::FAILURE);
            }
        },
        Command::Reset { key } => {
            if store.reset(&key).await? {
                println!("migration {key} reset to pending");
            } else {
                eprintln!("migration {key} was not reset (missing, pending or applied)");
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let loader = match &cli.config {
        Some(path) => ConfigLoader::with_file(path),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load().context("failed to load configuration")?;

    if let Some(db) = &cli.db {
        config.database.path = Some(db.clone());
    }
    if let Some(collection) = &cli.collection {
        config.database.collection = collection.clone();
    }
    Ok(config)
}
