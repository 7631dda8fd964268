//! Back-office API command-line client
//!
//! Thin binary over `backoffice-transport`:
//! 1. Loads config (TOML + env overrides)
//! 2. Opens the credential store at `credentials.path`
//! 3. Runs one command: login, logout, status, or an authenticated request
//! 4. Reports a session that ended mid-command because the refresh failed

mod config;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use backoffice_auth::{CredentialStore, now_millis};
use backoffice_transport::{ApiClient, ErrorKind, RequestDescriptor, SessionEvent};
use clap::{Parser, Subcommand};
use common::Secret;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Back-office API client with transparent session recovery
#[derive(Parser)]
#[command(name = "backoffice", version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file (default: $CONFIG_PATH or backoffice.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and store the session tokens
    Login {
        /// Overrides `credentials.username`
        #[arg(short, long)]
        username: Option<String>,
    },

    /// Revoke the session and clear the stored tokens
    Logout,

    /// Show whether a session is stored
    Status,

    /// Send an authenticated request and print the response body
    Request {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE)
        method: String,
        /// Path relative to the API base URL, e.g. /orders
        path: String,
        /// JSON request body
        body: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays clean for response bodies
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        base_url = %config.api.base_url,
        timeout_secs = config.api.timeout_secs,
        max_retries = config.retry.max_retries,
        credentials = %config.credentials.path.display(),
        "configuration loaded"
    );

    let store = CredentialStore::load(config.credentials.path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to open credential store {}",
                config.credentials.path.display()
            )
        })?;
    let client = ApiClient::from_config(&config.client_config(), Arc::new(store))
        .context("failed to build API client")?;
    let mut events = client.session_events();

    let result = match cli.command {
        Command::Login { username } => login(&client, &config, username).await,
        Command::Logout => logout(&client).await,
        Command::Status => status(&client, &config.credentials.path).await,
        Command::Request { method, path, body } => {
            request(&client, &method, &path, body.as_deref()).await
        }
    };

    report_session_events(&mut events);
    result
}

async fn login(client: &ApiClient, config: &Config, username: Option<String>) -> Result<()> {
    let Some(username) = username.or_else(|| config.credentials.username.clone()) else {
        bail!("no username: pass --username or set credentials.username");
    };
    let password = match &config.credentials.password {
        Some(password) => password.clone(),
        None => read_password().await?,
    };

    let user = client
        .login(&username, password.expose())
        .await
        .context("login failed")?;
    println!("{}", serde_json::to_string_pretty(&user)?);
    Ok(())
}

/// Read one line from stdin when neither BACKOFFICE_PASSWORD nor
/// password_file supplied a password.
async fn read_password() -> Result<Secret<String>> {
    eprint!("password: ");
    let mut line = String::new();
    tokio::io::BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']).to_owned();
    if password.is_empty() {
        bail!("empty password");
    }
    Ok(Secret::new(password))
}

async fn logout(client: &ApiClient) -> Result<()> {
    match client.logout().await {
        Ok(()) => {
            println!("logged out");
            Ok(())
        }
        Err(e) => {
            // Local tokens are gone either way
            warn!(error = %e, "server did not confirm logout");
            println!("logged out locally");
            Ok(())
        }
    }
}

async fn status(client: &ApiClient, path: &Path) -> Result<()> {
    match client.credentials().get().await {
        Some(pair) => {
            let expiry = match pair.expires_at {
                Some(_) if pair.is_expired(now_millis()) => "access token expired",
                Some(_) => "access token valid",
                None => "access token expiry unknown",
            };
            println!("logged in ({expiry}); credentials at {}", path.display());
        }
        None => println!("not logged in"),
    }
    Ok(())
}

async fn request(client: &ApiClient, method: &str, path: &str, body: Option<&str>) -> Result<()> {
    let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid HTTP method: {method}"))?;

    let mut descriptor = RequestDescriptor::new(method, path);
    if let Some(body) = body {
        let json: serde_json::Value =
            serde_json::from_str(body).context("request body must be valid JSON")?;
        descriptor = descriptor.with_body(json);
    }

    match client.execute(descriptor).await {
        Ok(response) => {
            match response.json::<serde_json::Value>() {
                Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
                Err(_) => println!("{}", response.text()),
            }
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AuthInvalid => {
            Err(e).context("session expired, run `backoffice login`")
        }
        Err(e) => Err(e).with_context(|| format!("{path} failed")),
    }
}

/// Log any session-ended events raised while the command ran.
fn report_session_events(events: &mut broadcast::Receiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::Ended { reason } => {
                error!(reason = %reason, "session ended, stored credentials cleared");
            }
        }
    }
}
