//! Startup helpers: database initialization and the background worker
//! spawn point that would otherwise clutter `main.rs`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Local;

use crate::config::Config;
use crate::services::{reminders, scheduler};
use crate::AppState;

/// Redact potentially sensitive information from a database URL before logging.
///
/// Attempts to parse the URL and remove userinfo (username:password) components.
/// Falls back to removing everything before '@' or returning "(redacted)".
pub fn redact_db_url(db_url: &str) -> String {
    if let Ok(url) = url::Url::parse(db_url) {
        let scheme = url.scheme();
        let host = url.host_str().unwrap_or("");
        let port_part = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
        let path = url.path();
        format!("{}://{}{}{}", scheme, host, port_part, path)
    } else {
        if let Some(at_pos) = db_url.find('@') {
            let without_creds = &db_url[at_pos + 1..];
            return format!("(redacted){}", without_creds);
        }
        "(redacted)".to_string()
    }
}

/// Initialize the SQLite database connection and run migrations.
///
/// Creates the parent directory for the database file (if applicable),
/// opens a connection pool using `create_if_missing(true)` and runs migrations.
pub async fn init_db(config: &Config) -> Result<sqlx::SqlitePool> {
    let db_url = &config.database.url;
    tracing::info!("Connecting to database: {}", redact_db_url(db_url));

    // Extract the file path from the database URL
    let db_path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
    let db_file_path = Path::new(db_path);

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_file_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(connect_options)
        .await?;

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Database ready: {}", db_file_path.display());

    Ok(pool)
}

/// Spawn the server-side daily batch worker.
///
/// The worker sleeps until the configured reminder hour, runs one batch,
/// and repeats. Instances that rely on the `/api/send-daily-notifications`
/// endpoint (the default) spawn nothing. The returned `JoinHandle`s let the
/// caller await a clean shutdown; each worker listens on the broadcast
/// channel for the stop signal.
pub fn spawn_background_workers(
    state: Arc<AppState>,
    shutdown: tokio::sync::broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    if !state.config.reminder.batch_enabled {
        tracing::info!("Daily batch worker disabled; reminders fire via the API endpoint only");
        return handles;
    }

    {
        let mut shutdown_rx = shutdown.subscribe();
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let target = scheduler::next_fire_at(Local::now(), state.config.reminder.hour);
                tracing::info!("Next daily notification batch at {}", target);

                // Sleep in bounded chunks so a shutdown request and clock
                // adjustments are both noticed promptly.
                loop {
                    let now = Local::now();
                    if now >= target {
                        break;
                    }
                    let remaining = (target - now).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            tracing::info!("Daily batch worker shutting down");
                            return;
                        }
                        _ = tokio::time::sleep(remaining.min(scheduler::MAX_SLEEP_CHUNK)) => {}
                    }
                }

                if let Err(e) = reminders::send_daily_batch(
                    state.events.as_ref(),
                    state.tokens.as_ref(),
                    &state.dispatcher,
                    Local::now().date_naive(),
                )
                .await
                {
                    tracing::warn!("Daily notification batch failed: {}", e);
                }
            }
        }));
    }

    handles
}
