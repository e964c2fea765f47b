//! # rar-bridge
//!
//! Background service that makes the contents of RAR archive sets available
//! to a media server without a prior bulk decompression step.
//!
//! Archives appearing in watched directories are processed strictly
//! serially: gated on duplicates, integrity and encryption, then
//! materialized into the library directory either as real extracted files,
//! as `.strm` pointer files backed by an in-process HTTP range server, or as
//! symlinks into an externally mounted view of the archive. Processed
//! archives are deleted or relocated, and the media server is asked to
//! rescan the affected library section.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rar_bridge::{Config, RarBridge, run_with_shutdown};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(Path::new("config.toml"))?;
//!     let bridge = RarBridge::new(config).await?;
//!     bridge.start().await?;
//!
//!     // Subscribe to events
//!     let mut events = bridge.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("event: {:?}", event);
//!         }
//!     });
//!
//!     run_with_shutdown(bridge).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Archive set model and RAR read sessions
pub mod archive;
/// Core service implementation
pub mod bridge;
/// Configuration types
pub mod config;
/// Persistent duplicate index
pub mod db;
/// Archive set disposal (delete, relocate, quarantine)
pub mod disposer;
/// Error types
pub mod error;
/// Tracing setup
pub mod logging;
/// Materialization strategies
pub mod materialize;
/// Media-server library refresh
pub mod notifier;
/// Single-worker processing queue
pub mod queue;
/// Optional post-extraction re-encoding
pub mod reencode;
/// Core types and events
pub mod types;
/// Token registry and HTTP range server
pub mod vfs;
/// Directory watching with stabilization
pub mod watcher;

// Re-export commonly used types
pub use bridge::RarBridge;
pub use config::{BindScope, Config, PlexConfig};
pub use error::{ArchiveError, DatabaseError, Error, Result};
pub use types::{Event, ProcessedRecord, StatsSnapshot, StrategyKind, SubmitSource};

/// Run the bridge until a termination signal arrives, then shut down
/// gracefully.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// Returns after the shutdown completes; callers that want the conventional
/// 130 exit code decide it themselves (the signal is the only way out of
/// this function).
pub async fn run_with_shutdown(bridge: RarBridge) -> Result<()> {
    wait_for_signal().await;
    bridge.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    // Signal registration can fail in restricted environments (containers,
    // tests); fall back progressively.
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM");
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("received SIGINT");
            } else {
                tracing::error!("could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("received SIGTERM");
            } else {
                tracing::error!("could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("received Ctrl+C");
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
        }
    }
}
