//! vaultsync - host process for the offline credential engine.
//!
//! Reads newline-delimited JSON requests on stdin and writes one JSON
//! response per line on stdout, the same messages the extension's
//! background page exchanges with its popup and content scripts.
//!
//! Usage:
//!   vaultsync                 serve requests on stdin/stdout
//!   vaultsync --login [USER]  log in interactively and remember the password
//!   vaultsync --forget USER   remove a remembered password

mod keychain;

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use keychain::RememberedLogin;
use vaultsync_core::api::ApiClient;
use vaultsync_core::{open_store, Config, Engine, Request, Response};

// ============================================================================
// Constants
// ============================================================================

/// Log file prefix inside the data directory's `logs/` folder
const LOG_FILE_PREFIX: &str = "vaultsync.log";

/// Initialize the tracing subscriber for logging.
///
/// Stderr gets the `RUST_LOG` level (default `warn`); a daily rolling file in
/// the data directory keeps the same events. The returned guard flushes the
/// file writer on drop.
fn init_tracing(log_dir: &Path) -> WorkerGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .with(filter)
        .init();
    guard
}

fn build_engine(config: &Config) -> Result<Arc<Engine>> {
    let client = ApiClient::new(config.api_base_url.clone(), config.request_timeout())
        .context("Failed to build HTTP client")?;
    let store_path = config.store_path()?;
    let store = open_store(&store_path).context("No usable local store")?;
    Ok(Engine::new(store, Arc::new(client), config.settings.clone()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut config = Config::load().context("Failed to load config")?;
    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    let _log_guard = init_tracing(&data_dir.join("logs"));
    info!(api = %config.api_base_url, "vaultsync starting");

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("--login") => {
            let engine = build_engine(&config)?;
            engine.start();
            interactive_login(&engine, &mut config, args.get(2).cloned()).await
        }
        Some("--forget") => {
            let username = args.get(2).context("--forget needs a username")?;
            RememberedLogin::delete(username)?;
            eprintln!("Forgot password for {}", username);
            Ok(())
        }
        Some(other) => anyhow::bail!("Unknown argument: {}", other),
        None => {
            let engine = build_engine(&config)?;
            engine.start();
            if !engine.guard().is_unlocked() {
                remembered_login(&engine, &config).await;
            }
            serve(engine).await
        }
    }
}

/// Prompt for credentials, log in, and remember the password on success.
async fn interactive_login(engine: &Arc<Engine>, config: &mut Config, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| config.last_username.clone()) {
        Some(name) => name,
        None => {
            eprint!("Username: ");
            io::stderr().flush()?;
            let mut line = String::new();
            io::stdin().read_line(&mut line)?;
            line.trim().to_string()
        }
    };
    let password = rpassword::prompt_password(format!("Password for {}: ", username))
        .context("Failed to read password")?;

    let response = engine
        .handle(Request::Login {
            username: username.clone(),
            password: password.clone(),
        })
        .await;
    println!("{}", serde_json::to_string(&response)?);
    if !response.success {
        anyhow::bail!(
            "Login failed: {}",
            response.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    RememberedLogin::store(&username, &password)?;
    config.last_username = Some(username);
    config.save().context("Failed to save config")?;
    Ok(())
}

/// Log in with the password remembered for the last user, if any.
async fn remembered_login(engine: &Arc<Engine>, config: &Config) {
    let Some(username) = config.last_username.clone() else {
        return;
    };
    let Some(password) = RememberedLogin::get_password(&username) else {
        debug!(username, "No remembered password");
        return;
    };
    let response = engine.handle(Request::Login { username: username.clone(), password }).await;
    if response.success {
        info!(username, "Logged in with remembered password");
    } else if response.code == Some("rejected") {
        warn!(username, "Remembered password rejected, forgetting it");
        if let Err(e) = RememberedLogin::delete(&username) {
            warn!(error = %e, "Failed to forget password");
        }
    } else {
        debug!(username, error = ?response.error, "Remembered login skipped");
    }
}

/// Answer JSON requests from stdin until it closes.
async fn serve(engine: Arc<Engine>) -> Result<()> {
    let mut events = engine.guard().subscribe();
    let lock_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(reason = ?event.reason, at = %event.at, "Session locked");
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await.context("Failed to read request")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response: Response = engine.handle_json(line).await;
        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        stdout.write_all(encoded.as_bytes()).await?;
        stdout.flush().await?;
    }

    info!("Input closed, shutting down");
    engine.shutdown();
    lock_log.abort();
    Ok(())
}
