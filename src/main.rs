//! Demo application for the vault file watcher.
//!
//! Watches a directory and prints every notification the host index would
//! receive:
//! 1. Settings are loaded from a TOML file (defaults when it is missing)
//! 2. Changes are detected natively or by polling
//! 3. Half-written files are held back until they settle
//! 4. Duplicate reports are dropped before reaching the consumer

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vault_file_watcher::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vault_file_watcher=debug".parse()?),
        )
        .init();

    println!("=== Vault File Watcher ===\n");

    // Root to watch (argument or current directory), then settings file.
    let mut args = std::env::args().skip(1);
    let root = match args.next() {
        Some(path) => PathBuf::from(path),
        None => std::env::current_dir()?,
    };
    // The default settings file is a dotfile, so it never reports itself.
    let settings_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| root.join(".vault-watcher.toml"));

    println!("Watching: {}", root.display());
    println!("Settings: {}\n", settings_path.display());

    let sink = BroadcastSink::new(256);
    let mut updates = sink.subscribe();

    let mut service =
        WatcherService::load(&root, SettingsStore::new(settings_path), Arc::new(sink)).await?;

    match service.handle().and_then(WatcherHandle::backend) {
        Some(BackendKind::Polling) => println!(
            "Using polling (interval {}ms, binary {}ms)\n",
            service.settings().interval,
            service.settings().binary_interval
        ),
        Some(BackendKind::Native) => println!("Using native file watcher\n"),
        None => println!("Watcher is not running\n"),
    }

    println!("Press Ctrl+C to exit\n");
    println!("Try creating, modifying, or deleting files in the watched directory.\n");
    println!("---\n");

    let printer = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => println!("  {:<6} {}", update.kind, update.path.display()),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    tracing::warn!("Printer lagged behind by {} notifications", count);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    let stats = service.dedup().stats();
    println!(
        "Forwarded {} notifications, suppressed {} duplicates",
        stats.forwarded, stats.suppressed
    );

    service.unload();
    drop(service);
    printer.abort();
    println!("Done!");

    Ok(())
}
