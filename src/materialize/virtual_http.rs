//! Strategy B — virtual HTTP pointer files
//!
//! The materialized artifact is a `.strm` pointer file whose single line is a
//! URL served by the in-process range server. The media server reads the
//! pointer and issues range requests against the URL when playing. Pointer
//! files appear atomically: written to a hidden temp next to their final
//! location, then renamed.

use super::sanitize::{pointer_name, sanitize_media_name, unique_target_path};
use crate::archive::ArchiveEntry;
use crate::error::Result;
use crate::vfs::{TokenRegistry, VfsHandle};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Create the pointer file for one entry and register its token.
pub async fn materialize_entry(
    registry: &TokenRegistry,
    handle: &VfsHandle,
    archive: &Path,
    entry: &ArchiveEntry,
    target_dir: &Path,
) -> Result<PathBuf> {
    tokio::fs::create_dir_all(target_dir).await?;

    let entry_name = entry
        .path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "entry".to_string());

    let token = registry
        .register(archive.to_path_buf(), entry.path.clone(), entry.size)
        .await;
    let url = handle.entry_url(&token, &sanitize_media_name(&entry_name));

    let final_path = unique_target_path(target_dir, &pointer_name(&entry_name))?;
    write_pointer(&final_path, &url).await?;

    info!(
        pointer = %final_path.display(),
        entry = %entry.path.display(),
        "pointer file created"
    );
    Ok(final_path)
}

/// Write the single-line pointer body (UTF-8, no BOM, trailing newline) and
/// rename it into place.
async fn write_pointer(final_path: &Path, url: &str) -> Result<()> {
    let parent = final_path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "pointer.strm".to_string());
    let staging = parent.join(format!(".{file_name}.tmp"));

    let mut file = tokio::fs::File::create(&staging).await?;
    file.write_all(url.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&staging, final_path).await?;
    Ok(())
}
