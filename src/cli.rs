//! Command-line interface parsing for pestdesk
//!
//! This module handles parsing of CLI arguments using clap, turns them into
//! the client configuration, and runs the selected command against an
//! `ApiClient`.

use clap::{Parser, Subcommand};
use futures::future::join_all;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::client::ApiClient;
use crate::config::{ClientConfig, DEFAULT_BASE_URL};
use crate::error::ApiError;
use crate::storage::FileStore;

/// Error types for the command line
#[derive(Debug, Error)]
pub enum CliError {
    /// The --data argument is not valid JSON
    #[error("Invalid JSON body: {0}")]
    InvalidBody(String),

    /// An API call failed
    #[error("error [{}]: {}", .0.code(), .0.message())]
    Api(#[from] ApiError),
}

/// Pestdesk - talk to the pest-control CRM API from the terminal
#[derive(Parser, Debug)]
#[command(name = "pestdesk")]
#[command(about = "Command-line client for the pest-control CRM API")]
#[command(version)]
pub struct Cli {
    /// Base URL every request path is appended to
    #[arg(long, global = true, value_name = "URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Per-attempt request timeout in seconds
    #[arg(long, global = true, value_name = "SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// How long GET responses are cached, in seconds
    #[arg(long, global = true, value_name = "SECS", default_value_t = 300)]
    pub cache_ttl_secs: u64,

    /// Session file holding the stored tokens (defaults to the user data directory)
    #[arg(long, global = true, value_name = "PATH")]
    pub session_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Log in and store the session token
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Forget the stored session
    Logout,
    /// Show the state of the stored token
    Status,
    /// Fetch the signed-in user's profile
    Profile,
    /// GET one or more paths (fetched concurrently)
    Get {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// POST a JSON body
    Post {
        path: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },
    /// PUT a JSON body
    Put {
        path: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },
    /// PATCH a JSON body
    Patch {
        path: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },
    /// DELETE a resource
    Delete { path: String },
}

/// Configuration derived from CLI arguments for application startup
#[derive(Debug, Clone)]
pub struct StartupConfig {
    /// Settings for the API client
    pub client: ClientConfig,
    /// Where the session is persisted; `None` keeps it in memory only
    pub session_file: Option<PathBuf>,
}

impl StartupConfig {
    /// Creates a StartupConfig from parsed CLI arguments.
    pub fn from_cli(cli: &Cli) -> Self {
        let client = ClientConfig {
            base_url: cli.base_url.clone(),
            timeout: Duration::from_secs(cli.timeout_secs),
            cache_ttl: Duration::from_secs(cli.cache_ttl_secs),
            ..ClientConfig::default()
        };

        StartupConfig {
            client,
            session_file: cli.session_file.clone().or_else(FileStore::default_location),
        }
    }
}

/// Parses a --data argument into a JSON body.
///
/// # Returns
/// * `Ok({})` when no data was given
/// * `Ok(Value)` if the string is valid JSON
/// * `Err(CliError::InvalidBody)` otherwise
pub fn parse_body_arg(data: Option<&str>) -> Result<Value, CliError> {
    match data {
        None => Ok(json!({})),
        Some(raw) => serde_json::from_str(raw).map_err(|e| CliError::InvalidBody(e.to_string())),
    }
}

/// Runs `command` and prints its JSON result to stdout
pub async fn run(client: &ApiClient, command: Command) -> Result<(), CliError> {
    match command {
        Command::Login { email, password } => {
            client.login(&email, &password).await?;
            println!("Logged in as {}", email);
        }
        Command::Logout => {
            client.logout();
            println!("Logged out");
        }
        Command::Status => print_json(&status_report(client))?,
        Command::Profile => {
            let profile: Value = client.fetch_profile().await?;
            print_json(&profile)?;
        }
        Command::Get { paths } => {
            let results = join_all(paths.iter().map(|path| client.get::<Value>(path))).await;

            let mut first_error = None;
            for result in results {
                match result {
                    Ok(data) => print_json(&data)?,
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e.into());
            }
        }
        Command::Post { path, data } => {
            let body = parse_body_arg(data.as_deref())?;
            let result: Value = client.post(&path, &body).await?;
            print_json(&result)?;
        }
        Command::Put { path, data } => {
            let body = parse_body_arg(data.as_deref())?;
            let result: Value = client.put(&path, &body).await?;
            print_json(&result)?;
        }
        Command::Patch { path, data } => {
            let body = parse_body_arg(data.as_deref())?;
            let result: Value = client.patch(&path, &body).await?;
            print_json(&result)?;
        }
        Command::Delete { path } => {
            let result: Value = client.delete(&path).await?;
            print_json(&result)?;
        }
    }
    Ok(())
}

/// Describes the stored token without touching the network
fn status_report(client: &ApiClient) -> Value {
    let credentials = client.credentials();
    let state = credentials.state();
    let issued_at = credentials.issued_at();
    let expires_at = issued_at.map(|issued| issued + credentials.policy().lifetime);

    json!({
        "state": state,
        "issued_at": issued_at,
        "expires_at": expires_at,
        "has_refresh_token": credentials.refresh_token().is_some(),
    })
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| CliError::Api(ApiError::parse(e.to_string())))?;
    println!("{}", text);
    Ok(())
}
