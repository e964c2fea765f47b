//! Tracing setup
//!
//! Dual output: console logs at the configured level, and a per-run debug
//! file under `logs/`. Old run files beyond `backup_count` are pruned at
//! startup.

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use std::path::Path;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Prefix shared by all run log files.
const LOG_PREFIX: &str = "rar-bridge-";

/// Initialize console + file logging.
///
/// Safe to call more than once; later calls are no-ops (relevant for tests).
pub fn init(config: &LoggingConfig, logs_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(logs_dir)?;
    prune_old_logs(logs_dir, config.backup_count);

    let file_name = format!(
        "{LOG_PREFIX}{}.log",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    );
    let log_path = logs_dir.join(file_name);
    let log_file = std::fs::File::create(&log_path)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(normalize_level(&config.level)));
    let console_layer = fmt::layer()
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new("debug"));

    let result = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init();

    match result {
        Ok(()) => {
            tracing::info!(log_file = %log_path.display(), level = %config.level, "logging initialized");
            Ok(())
        }
        // A subscriber is already installed (second init in-process); that
        // is fine, keep using it.
        Err(_) => Ok(()),
    }
}

fn normalize_level(level: &str) -> String {
    match level.to_lowercase().as_str() {
        l @ ("error" | "warn" | "info" | "debug" | "trace") => l.to_string(),
        other => {
            eprintln!("unknown log level {other:?}, using info");
            "info".to_string()
        }
    }
}

/// Keep only the newest `backup_count` previous run files.
fn prune_old_logs(logs_dir: &Path, backup_count: usize) {
    let Ok(entries) = std::fs::read_dir(logs_dir) else {
        return;
    };
    let mut logs: Vec<_> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(LOG_PREFIX) && n.ends_with(".log"))
        })
        .collect();
    logs.sort();

    while logs.len() > backup_count {
        let oldest = logs.remove(0);
        if let Err(e) = std::fs::remove_file(&oldest) {
            eprintln!("could not prune old log {}: {}", oldest.display(), e);
        }
    }
}

/// Validate a configured level eagerly so a typo fails startup instead of
/// silently logging at the wrong level.
pub fn check_level(config: &LoggingConfig) -> Result<()> {
    match config.level.to_lowercase().as_str() {
        "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
        other => Err(Error::Config {
            message: format!("unknown log level {other:?}"),
            key: Some("logging.level".into()),
        }),
    }
}
