//! Archive set disposal
//!
//! After success the source set is deleted or relocated into the archive
//! tree, preserving any subtree prefix below the source directory. On
//! terminal failure the whole set is quarantined into `failed/` keeping its
//! file names. Moves are per-file renames with a copy-then-delete fallback
//! for cross-device destinations; a disposal failure leaves the source in
//! place and is logged, never re-queued.

use crate::archive::ArchiveSet;
use crate::error::Result;
use std::path::Path;
use tracing::{error, info, warn};

/// Delete or relocate a processed archive set.
///
/// With `delete` the volumes are unlinked; otherwise the set moves under
/// `archive_dir`, keeping the path prefix it had below `source_root`.
pub async fn dispose(
    set: &ArchiveSet,
    source_root: &Path,
    delete: bool,
    archive_dir: &Path,
) -> Result<()> {
    if delete {
        for volume in &set.volumes {
            match tokio::fs::remove_file(volume).await {
                Ok(()) => info!(volume = %volume.display(), "deleted archive volume"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    error!(volume = %volume.display(), error = %e, "could not delete archive volume");
                }
            }
        }
        return Ok(());
    }

    let prefix = set
        .first_volume
        .parent()
        .and_then(|p| p.strip_prefix(source_root).ok())
        .unwrap_or_else(|| Path::new(""));
    let dest_dir = archive_dir.join(prefix);

    relocate_set(set, &dest_dir, "archive").await
}

/// Move the whole set into the quarantine directory, preserving file names.
pub async fn quarantine(set: &ArchiveSet, failed_dir: &Path) {
    if let Err(e) = relocate_set(set, failed_dir, "failed").await {
        error!(
            archive = %set.first_volume.display(),
            error = %e,
            "could not quarantine archive set"
        );
    }
}

async fn relocate_set(set: &ArchiveSet, dest_dir: &Path, label: &str) -> Result<()> {
    tokio::fs::create_dir_all(dest_dir).await?;

    let mut last_error = None;
    for volume in &set.volumes {
        let Some(name) = volume.file_name() else {
            continue;
        };
        let dest = dest_dir.join(name);
        if dest.exists() {
            warn!(dest = %dest.display(), "destination already exists, leaving source in place");
            continue;
        }
        match move_file(volume, &dest).await {
            Ok(()) => info!(volume = %volume.display(), dest = %dest.display(), "moved to {label}"),
            Err(e) if !volume.exists() => {
                // Vanished mid-move; nothing left to relocate.
                warn!(volume = %volume.display(), error = %e, "volume vanished during disposal");
            }
            Err(e) => {
                error!(volume = %volume.display(), error = %e, "could not move volume");
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Rename, falling back to copy-then-delete for cross-device moves.
pub async fn move_file(src: &Path, dest: &Path) -> Result<()> {
    match tokio::fs::rename(src, dest).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(src, dest).await?;
            tokio::fs::remove_file(src).await?;
            Ok(())
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn make_set(dir: &Path, names: &[&str]) -> ArchiveSet {
        let volumes: Vec<PathBuf> = names
            .iter()
            .map(|n| {
                let p = dir.join(n);
                std::fs::write(&p, b"volume-data").unwrap();
                p
            })
            .collect();
        ArchiveSet {
            first_volume: volumes[0].clone(),
            volumes,
            stem: "X".to_string(),
        }
    }

    #[tokio::test]
    async fn delete_mode_unlinks_every_volume() {
        let dir = TempDir::new().unwrap();
        let set = make_set(dir.path(), &["X.rar", "X.r00", "X.r01"]);

        dispose(&set, dir.path(), true, Path::new("/unused"))
            .await
            .unwrap();

        for volume in &set.volumes {
            assert!(!volume.exists(), "{} should be gone", volume.display());
        }
    }

    #[tokio::test]
    async fn move_mode_relocates_the_whole_set() {
        let source_root = TempDir::new().unwrap();
        let archive_dir = TempDir::new().unwrap();
        let set = make_set(source_root.path(), &["X.rar", "X.r00"]);

        dispose(&set, source_root.path(), false, archive_dir.path())
            .await
            .unwrap();

        assert!(!set.volumes[0].exists());
        assert!(archive_dir.path().join("X.rar").exists());
        assert!(archive_dir.path().join("X.r00").exists());
    }

    #[tokio::test]
    async fn move_mode_preserves_subtree_prefix() {
        let source_root = TempDir::new().unwrap();
        let archive_dir = TempDir::new().unwrap();
        let sub = source_root.path().join("movies").join("2021");
        std::fs::create_dir_all(&sub).unwrap();
        let set = make_set(&sub, &["X.rar"]);

        dispose(&set, source_root.path(), false, archive_dir.path())
            .await
            .unwrap();

        assert!(archive_dir
            .path()
            .join("movies")
            .join("2021")
            .join("X.rar")
            .exists());
    }

    #[tokio::test]
    async fn quarantine_moves_set_into_failed_preserving_names() {
        let source = TempDir::new().unwrap();
        let failed = TempDir::new().unwrap();
        let set = make_set(source.path(), &["Bad.rar", "Bad.r00"]);

        quarantine(&set, failed.path()).await;

        assert!(failed.path().join("Bad.rar").exists());
        assert!(failed.path().join("Bad.r00").exists());
        assert!(!set.volumes[0].exists());
    }

    #[tokio::test]
    async fn existing_destination_is_never_overwritten() {
        let source = TempDir::new().unwrap();
        let failed = TempDir::new().unwrap();
        std::fs::write(failed.path().join("Bad.rar"), b"older-quarantined").unwrap();
        let set = make_set(source.path(), &["Bad.rar"]);

        quarantine(&set, failed.path()).await;

        assert_eq!(
            std::fs::read(failed.path().join("Bad.rar")).unwrap(),
            b"older-quarantined",
            "existing quarantined file must win"
        );
        assert!(set.volumes[0].exists(), "source stays when dest exists");
    }

    #[tokio::test]
    async fn move_file_copies_content() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.bin");
        let dest = dir.path().join("b.bin");
        std::fs::write(&src, b"payload").unwrap();

        move_file(&src, &dest).await.unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
    }
}
