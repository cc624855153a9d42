//! Pestdesk - command-line client for the pest-control CRM API
//!
//! Logs in, keeps the session token on disk, and issues authenticated
//! requests with caching and retries.

use std::sync::Arc;

use clap::Parser;

use pestdesk::cli::{self, Cli, StartupConfig};
use pestdesk::logging;
use pestdesk::storage::{FileStore, KeyValueStore, MemoryStore};
use pestdesk::ApiClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();

    let cli = Cli::parse();
    let startup = StartupConfig::from_cli(&cli);

    let storage: Arc<dyn KeyValueStore> = match &startup.session_file {
        Some(path) => Arc::new(FileStore::open(path)),
        None => {
            tracing::warn!("No data directory found; the session will not be saved");
            Arc::new(MemoryStore::new())
        }
    };

    let client = ApiClient::builder(startup.client).storage(storage).build()?;

    if let Err(e) = cli::run(&client, cli.command).await {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    Ok(())
}
