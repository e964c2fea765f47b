//! Service entry point.
//!
//! Loads the configuration, initializes logging, runs the bridge until a
//! termination signal arrives, then exits with the conventional codes:
//! 0 clean, 2 configuration error, 3 fatal runtime error, 130 signal.

use rar_bridge::{logging, Config, RarBridge};
use std::path::PathBuf;
use std::process::ExitCode;

/// Exit code when a termination signal ended the run.
const EXIT_SIGNALLED: u8 = 130;

fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("rar-bridge: {e}");
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    if let Err(e) = logging::check_level(&config.logging) {
        eprintln!("rar-bridge: {e}");
        return ExitCode::from(e.exit_code() as u8);
    }
    if let Err(e) = logging::init(&config.logging, &config.logs_dir()) {
        eprintln!("rar-bridge: cannot initialize logging: {e}");
        return ExitCode::from(3);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("rar-bridge: cannot start runtime: {e}");
            return ExitCode::from(3);
        }
    };

    let result = runtime.block_on(async move {
        let bridge = RarBridge::new(config).await?;
        bridge.start().await?;
        rar_bridge::run_with_shutdown(bridge).await
    });

    match result {
        // run_with_shutdown only returns once a signal has been handled and
        // the drain completed.
        Ok(()) => ExitCode::from(EXIT_SIGNALLED),
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            eprintln!("rar-bridge: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
