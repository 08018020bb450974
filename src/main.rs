// ABOUTME: Entry point for the quill binary, an operator tool for a plugin's storage.
// ABOUTME: Loads configuration, then checks backend health or dumps the stored records of one entity type.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quill_core::EntityType;
use quill_runtime::{Storage, StorageConfig, StorageState};
use quill_store::open_backend;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect quill plugin storage")]
struct Args {
    /// Configuration document (JSON or YAML). Without it, QUILL_* environment
    /// variables are used.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open storage, probe the backend and report its state.
    Check,
    /// Print every stored record of one entity type as JSON lines.
    Dump {
        /// Entity type, e.g. `players`.
        entity: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("quill=info,quill_runtime=info,quill_store=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => StorageConfig::from_file(path)?,
        None => StorageConfig::from_env()?,
    };
    tracing::info!(backend = ?config.backend, data_dir = %config.data_dir.display(), "quill starting up");

    match args.command {
        Command::Check => check(config).await,
        Command::Dump { entity } => dump(config, entity).await,
    }
}

async fn check(config: StorageConfig) -> Result<()> {
    let storage = Storage::open(config).context("opening storage")?;
    let state = storage.check_health().await;
    println!("backend: {}", storage.backend_name());
    println!("state:   {}", serde_json::to_string(&state)?);
    storage.shutdown_async().await.context("shutting down storage")?;

    if state != StorageState::Ready {
        anyhow::bail!("backend {} is not healthy", storage.backend_name());
    }
    Ok(())
}

async fn dump(config: StorageConfig, entity: String) -> Result<()> {
    let entity = EntityType::new(entity)?;
    let backend = open_backend(&config.to_descriptor()).context("opening backend")?;

    let count = tokio::task::spawn_blocking(move || -> Result<usize> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let mut count = 0;
        for item in backend.read_all(&entity)? {
            let (key, envelope) = item?;
            let line = serde_json::json!({ "key": key, "record": envelope });
            writeln!(out, "{line}")?;
            count += 1;
        }
        backend.close();
        Ok(count)
    })
    .await??;

    tracing::info!(records = count, "dump complete");
    Ok(())
}
