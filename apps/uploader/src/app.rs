//! Application orchestrator: wires client, token cache and coordinator.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wedrive_drive_client::Client;
use wedrive_token_cache::{Token, TokenCache};
use wedrive_upload::{UploadCoordinator, UploadError, UploadEvent, sweep_directory};

use crate::Command;
use crate::config::{self, Config};

/// Runs one command to completion.
pub async fn run(
    config_path: PathBuf,
    config: Config,
    command: Command,
    deadline: Option<Duration>,
) -> anyhow::Result<()> {
    let mut client = Client::with_timeout(&config.corpid, &config.secret, config.request_timeout())?;
    if let Some(url) = &config.api_base_url {
        client = client.with_base_url(url.as_str());
    }
    let client = Arc::new(client);
    let (persist, writer) = spawn_token_writer(config_path, config.debug_token.clone());
    let tokens = Arc::new(token_cache(&config, persist, Arc::clone(&client)));

    let result = execute(client, tokens, &config, command, deadline).await;
    // The cache and its sender are gone, so the writer drains and exits.
    if let Err(e) = writer.await {
        tracing::warn!(error = %e, "token writer task failed");
    }
    result
}

async fn execute(
    client: Arc<Client>,
    tokens: Arc<TokenCache>,
    config: &Config,
    command: Command,
    deadline: Option<Duration>,
) -> anyhow::Result<()> {
    match command {
        Command::Token { force } => {
            let token = tokens.get(force).await?;
            print_token(&token);
            Ok(())
        }
        Command::Upload { files } => {
            let coordinator = start_coordinator(client, tokens, config, deadline)?;
            upload_files(&coordinator, &files).await
        }
        Command::Sweep { source, done } => {
            let coordinator = start_coordinator(client, tokens, config, deadline)?;
            sweep(&coordinator, &source, &done).await
        }
    }
}

/// Creates the coordinator and hooks up cancellation and progress logging.
fn start_coordinator(
    client: Arc<Client>,
    tokens: Arc<TokenCache>,
    config: &Config,
    deadline: Option<Duration>,
) -> anyhow::Result<UploadCoordinator> {
    let mut coordinator = UploadCoordinator::new(client, tokens, config.upload_config())?;
    watch_for_cancel(coordinator.cancel_token(), deadline);
    if let Some(events) = coordinator.take_events() {
        tokio::spawn(log_events(events));
    }
    Ok(coordinator)
}

/// Builds the token cache, seeded from the config file. Refreshed tokens are
/// handed to the writer task and never touch the disk on the refresh path.
fn token_cache(config: &Config, persist: watch::Sender<String>, client: Arc<Client>) -> TokenCache {
    TokenCache::new(client)
        .with_seed(config.debug_token.as_str())
        .on_refresh(Box::new(move |token: &Token| {
            persist.send_replace(token.value().to_string());
        }))
}

/// Persists the latest refreshed token to `path` until the sender is dropped.
///
/// Tokens published faster than the disk keeps up collapse into the newest.
fn spawn_token_writer(path: PathBuf, current: String) -> (watch::Sender<String>, JoinHandle<()>) {
    let (tx, mut rx) = watch::channel(current);
    let handle = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let token = rx.borrow_and_update().clone();
            let target = path.clone();
            match tokio::task::spawn_blocking(move || config::store_token(&target, &token)).await {
                Ok(Ok(())) => tracing::debug!(path = %path.display(), "refreshed token saved"),
                Ok(Err(e)) => tracing::warn!(error = %e, "could not persist refreshed token"),
                Err(e) => tracing::warn!(error = %e, "token write task failed"),
            }
        }
    });
    (tx, handle)
}

async fn sweep(coordinator: &UploadCoordinator, source: &Path, done: &Path) -> anyhow::Result<()> {
    let report = sweep_directory(coordinator, source, done).await?;
    for (path, reason) in &report.failed {
        tracing::error!(file = %path.display(), %reason, "left in place");
    }
    if report.cancelled {
        bail!("sweep cancelled");
    }
    if !report.failed.is_empty() {
        let total = report.failed.len() + report.uploaded.len();
        bail!("{} of {total} files failed", report.failed.len());
    }
    println!("{} files uploaded", report.uploaded.len());
    Ok(())
}

async fn upload_files(coordinator: &UploadCoordinator, files: &[PathBuf]) -> anyhow::Result<()> {
    let mut failed = 0;
    for path in files {
        match coordinator.upload(path).await {
            Ok(outcome) => println!("{}\t{}", path.display(), outcome.file_id),
            Err(UploadError::Cancelled) => bail!("upload cancelled"),
            Err(_) => failed += 1,
        }
    }
    if failed > 0 {
        bail!("{failed} of {} uploads failed", files.len());
    }
    Ok(())
}

/// Cancels on Ctrl-C and, if given, once `deadline` has passed.
fn watch_for_cancel(cancel: CancellationToken, deadline: Option<Duration>) {
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    if let Some(deadline) = deadline {
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    tracing::warn!(secs = deadline.as_secs(), "deadline reached, cancelling");
                    cancel.cancel();
                }
            }
        });
    }
}

async fn log_events(mut events: mpsc::Receiver<UploadEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            UploadEvent::Hashed { file, blocks, bytes } => {
                tracing::info!(%file, blocks, bytes, "hashed");
            }
            UploadEvent::PartUploaded {
                file,
                completed,
                total,
                ..
            } => {
                tracing::info!(%file, progress = %format!("{completed}/{total}"), "part uploaded");
            }
            _ => {}
        }
    }
}

fn print_token(token: &Token) {
    match token.remaining(tokio::time::Instant::now()) {
        Some(left) => {
            let expires = chrono::Local::now()
                + chrono::Duration::from_std(left).unwrap_or_else(|_| chrono::Duration::zero());
            println!(
                "token valid for {}s (until {})",
                left.as_secs(),
                expires.format("%Y-%m-%d %H:%M:%S")
            );
        }
        None => println!("using configured debug_token (expiry unknown)"),
    }
}
