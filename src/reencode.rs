//! Optional post-extraction re-encoding
//!
//! The encoder is an out-of-process capability with a pass-through
//! interface: whatever happens, the hook hands back a playable path. A
//! failed or timed-out encode keeps the original file.

use crate::config::ReencodeConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};

/// Post-extraction transform applied to each materialized file
#[async_trait]
pub trait ReencodeHook: Send + Sync {
    /// Transform `input`, returning the path of the file to expose.
    ///
    /// Implementations never fail the pipeline; on any problem they return
    /// `input` unchanged.
    async fn process(&self, input: &Path) -> PathBuf;

    /// Short name for startup logging.
    fn name(&self) -> &'static str;
}

/// Hook that leaves files untouched (the default)
pub struct NoOpReencoder;

#[async_trait]
impl ReencodeHook for NoOpReencoder {
    async fn process(&self, input: &Path) -> PathBuf {
        input.to_path_buf()
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// CLI-based hook driving an external encoder (e.g. HandBrakeCLI)
pub struct CliReencoder {
    binary: PathBuf,
    preset: String,
    quality: f64,
    timeout: Duration,
}

impl CliReencoder {
    /// Build from configuration; `None` when re-encoding is disabled or the
    /// binary is not configured.
    pub fn from_config(config: &ReencodeConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let binary = config.executable.clone()?;
        Some(Self {
            binary,
            preset: config.preset.clone(),
            quality: config.quality,
            timeout: Duration::from_secs(config.timeout),
        })
    }
}

#[async_trait]
impl ReencodeHook for CliReencoder {
    async fn process(&self, input: &Path) -> PathBuf {
        let file_name = match input.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => return input.to_path_buf(),
        };
        let output = input.with_file_name(format!("encoded_{file_name}"));

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-i")
            .arg(input)
            .arg("-o")
            .arg(&output)
            .arg("--preset")
            .arg(&self.preset)
            .arg("--quality")
            .arg(self.quality.to_string())
            .kill_on_drop(true);

        info!(input = %input.display(), "re-encoding");
        let result = tokio::time::timeout(self.timeout, cmd.output()).await;

        match result {
            Ok(Ok(out)) if out.status.success() && output.exists() => {
                if let Err(e) = tokio::fs::remove_file(input).await {
                    warn!(error = %e, "could not remove original after re-encode");
                }
                info!(output = %output.display(), "re-encode complete");
                output
            }
            Ok(Ok(out)) => {
                error!(
                    status = %out.status,
                    stderr = %String::from_utf8_lossy(&out.stderr),
                    "encoder failed, keeping original"
                );
                let _ = tokio::fs::remove_file(&output).await;
                input.to_path_buf()
            }
            Ok(Err(e)) => {
                error!(error = %e, "encoder could not be executed, keeping original");
                input.to_path_buf()
            }
            Err(_) => {
                error!(input = %input.display(), "encoder timed out, keeping original");
                let _ = tokio::fs::remove_file(&output).await;
                input.to_path_buf()
            }
        }
    }

    fn name(&self) -> &'static str {
        "cli-encoder"
    }
}
