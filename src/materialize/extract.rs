//! Strategy A — extract to disk
//!
//! Stream-decodes an entry into a scratch file under the work directory,
//! computing its SHA-256 fingerprint while writing. The duplicate index is
//! consulted only after the file is fully materialized; duplicates delete
//! the scratch file and skip the entry. Survivors rename into the target
//! atomically under a sanitized, collision-free name.

use super::sanitize::{sanitize_media_name, unique_target_path};
use crate::archive::EntryReader;
use crate::db::Database;
use crate::error::{ArchiveError, Error, Result};
use crate::reencode::ReencodeHook;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Decode buffer size for extraction.
const COPY_CHUNK: usize = 64 * 1024;

/// Result of materializing one entry
#[derive(Debug)]
pub enum ExtractOutcome {
    /// The entry is now visible at this path inside the target
    Materialized(PathBuf),
    /// Identical content already exists; nothing was added
    Duplicate {
        /// Path of the previously materialized copy
        existing: PathBuf,
    },
}

/// Extract one entry into `target_dir`.
///
/// `dedup` is the duplicate index, `None` when duplicate checking is off for
/// this source. Cancellation via `abort` deletes the partial scratch file
/// and surfaces as [`Error::ShuttingDown`].
#[allow(clippy::too_many_arguments)]
pub async fn materialize_entry(
    mut reader: EntryReader,
    entry_name: &str,
    entry_size: u64,
    work_dir: &Path,
    target_dir: &Path,
    dedup: Option<&Database>,
    reencoder: &dyn ReencodeHook,
    abort: &CancellationToken,
) -> Result<ExtractOutcome> {
    tokio::fs::create_dir_all(work_dir).await?;
    tokio::fs::create_dir_all(target_dir).await?;

    let scratch = work_dir.join(format!(".{entry_name}.partial"));
    let written = match decode_to_scratch(&mut reader, &scratch, entry_size, abort).await {
        Ok(written) => written,
        Err(e) => {
            reader.close().await;
            let _ = tokio::fs::remove_file(&scratch).await;
            return Err(e);
        }
    };
    reader.close().await;

    let fingerprint = written.fingerprint;

    if let Some(db) = dedup {
        if let Some(row) = db.lookup_fingerprint(&fingerprint).await? {
            let existing = PathBuf::from(&row.file_path);
            if existing.exists() {
                debug!(
                    entry = entry_name,
                    existing = %existing.display(),
                    "duplicate content, skipping entry"
                );
                let _ = tokio::fs::remove_file(&scratch).await;
                return Ok(ExtractOutcome::Duplicate { existing });
            }
            // Stale row: the first copy is gone, treat the content as new.
            debug!(existing = %existing.display(), "stale duplicate row, re-materializing");
        }
    }

    let produced = reencoder.process(&scratch).await;

    let sanitized = sanitize_media_name(entry_name);
    let final_path = unique_target_path(target_dir, &sanitized)?;
    move_into_target(&produced, &final_path).await?;

    if let Some(db) = dedup {
        db.insert_fingerprint(&fingerprint, &final_path.to_string_lossy(), written.bytes)
            .await?;
    }

    info!(
        entry = entry_name,
        target = %final_path.display(),
        bytes = written.bytes,
        "entry extracted"
    );
    Ok(ExtractOutcome::Materialized(final_path))
}

struct Written {
    bytes: u64,
    fingerprint: String,
}

async fn decode_to_scratch(
    reader: &mut EntryReader,
    scratch: &Path,
    entry_size: u64,
    abort: &CancellationToken,
) -> Result<Written> {
    let mut file = tokio::fs::File::create(scratch).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut written: u64 = 0;

    loop {
        if abort.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let n = reader.read_next(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        written += n as u64;
        if written >= entry_size {
            break;
        }
    }
    file.flush().await?;

    if written < entry_size {
        return Err(ArchiveError::Io {
            archive: scratch.to_path_buf(),
            reason: format!("entry ended after {written} of {entry_size} bytes"),
        }
        .into());
    }

    Ok(Written {
        bytes: written,
        fingerprint: hex_digest(hasher),
    })
}

/// Single rename when source and target share a volume; otherwise copy to a
/// hidden same-volume temp and rename, so the final name appears atomically.
async fn move_into_target(produced: &Path, final_path: &Path) -> Result<()> {
    if tokio::fs::rename(produced, final_path).await.is_ok() {
        return Ok(());
    }

    let parent = final_path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "entry".to_string());
    let staging = parent.join(format!(".{file_name}.tmp"));

    tokio::fs::copy(produced, &staging).await?;
    tokio::fs::rename(&staging, final_path).await?;
    tokio::fs::remove_file(produced).await?;
    Ok(())
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::reencode::NoOpReencoder;
    use tempfile::TempDir;

    /// Stub decoder printing 1000 deterministic bytes regardless of args.
    fn stub_decoder(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("fake-unrar");
        std::fs::write(
            &script,
            "#!/bin/sh\ni=0\nwhile [ $i -lt 100 ]; do printf '0123456789'; i=$((i+1)); done\n",
        )
        .unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();
        script
    }

    fn reader(bin: &Path, size: u64) -> EntryReader {
        EntryReader::new(
            bin.to_path_buf(),
            PathBuf::from("fake.rar"),
            PathBuf::from("Movie.Title.2024.1080p.x264-GROUP.mkv"),
            size,
        )
    }

    async fn test_db(dir: &Path) -> Database {
        Database::new(&dir.join("dup.db")).await.unwrap()
    }

    #[tokio::test]
    async fn entry_is_extracted_under_its_sanitized_name() {
        let dir = TempDir::new().unwrap();
        let bin = stub_decoder(dir.path());
        let work = dir.path().join("work");
        let target = dir.path().join("target");
        let db = test_db(dir.path()).await;

        let outcome = materialize_entry(
            reader(&bin, 1000),
            "Movie.Title.2024.1080p.x264-GROUP.mkv",
            1000,
            &work,
            &target,
            Some(&db),
            &NoOpReencoder,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let ExtractOutcome::Materialized(path) = outcome else {
            panic!("expected materialized outcome");
        };
        assert_eq!(path, target.join("Movie Title (2024).mkv"));
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 1000);
        assert_eq!(&data[..10], b"0123456789");

        // No scratch residue for this entry.
        assert!(!work.join(".Movie.Title.2024.1080p.x264-GROUP.mkv.partial").exists());
    }

    #[tokio::test]
    async fn identical_content_is_skipped_the_second_time() {
        let dir = TempDir::new().unwrap();
        let bin = stub_decoder(dir.path());
        let work = dir.path().join("work");
        let target = dir.path().join("target");
        let db = test_db(dir.path()).await;

        let first = materialize_entry(
            reader(&bin, 1000),
            "First.2020.mkv",
            1000,
            &work,
            &target,
            Some(&db),
            &NoOpReencoder,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let ExtractOutcome::Materialized(first_path) = first else {
            panic!("expected materialized outcome");
        };

        // Different archive name, identical bytes.
        let second = materialize_entry(
            reader(&bin, 1000),
            "Other.Name.2021.mkv",
            1000,
            &work,
            &target,
            Some(&db),
            &NoOpReencoder,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        match second {
            ExtractOutcome::Duplicate { existing } => assert_eq!(existing, first_path),
            other => panic!("expected duplicate skip, got {other:?}"),
        }
        assert_eq!(
            std::fs::read_dir(&target).unwrap().count(),
            1,
            "exactly one materialized file on disk"
        );
    }

    #[tokio::test]
    async fn stale_duplicate_row_rematerializes() {
        let dir = TempDir::new().unwrap();
        let bin = stub_decoder(dir.path());
        let work = dir.path().join("work");
        let target = dir.path().join("target");
        let db = test_db(dir.path()).await;

        let first = materialize_entry(
            reader(&bin, 1000),
            "First.2020.mkv",
            1000,
            &work,
            &target,
            Some(&db),
            &NoOpReencoder,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let ExtractOutcome::Materialized(first_path) = first else {
            panic!("expected materialized outcome");
        };
        std::fs::remove_file(&first_path).unwrap();

        let second = materialize_entry(
            reader(&bin, 1000),
            "Second.2020.mkv",
            1000,
            &work,
            &target,
            Some(&db),
            &NoOpReencoder,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(
            matches!(second, ExtractOutcome::Materialized(_)),
            "content whose first copy vanished is materialized again"
        );
    }

    #[tokio::test]
    async fn dedup_off_always_materializes() {
        let dir = TempDir::new().unwrap();
        let bin = stub_decoder(dir.path());
        let work = dir.path().join("work");
        let target = dir.path().join("target");

        for name in ["A.2020.mkv", "B.2020.mkv"] {
            let outcome = materialize_entry(
                reader(&bin, 1000),
                name,
                1000,
                &work,
                &target,
                None,
                &NoOpReencoder,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
            assert!(matches!(outcome, ExtractOutcome::Materialized(_)));
        }
        assert_eq!(std::fs::read_dir(&target).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn truncated_entry_fails_and_cleans_scratch() {
        let dir = TempDir::new().unwrap();
        let bin = stub_decoder(dir.path());
        let work = dir.path().join("work");
        let target = dir.path().join("target");

        // Stub emits 1000 bytes but the header claims 2000.
        let err = materialize_entry(
            reader(&bin, 2000),
            "Short.2020.mkv",
            2000,
            &work,
            &target,
            None,
            &NoOpReencoder,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(err.is_retryable(), "truncation maps to a retryable archive error");
        assert!(!work.join(".Short.2020.mkv.partial").exists());
        assert!(
            std::fs::read_dir(&target)
                .map(|d| d.count())
                .unwrap_or(0)
                == 0,
            "nothing may appear in the target"
        );
    }

    #[tokio::test]
    async fn cancelled_extraction_removes_the_partial_file() {
        let dir = TempDir::new().unwrap();
        let bin = stub_decoder(dir.path());
        let work = dir.path().join("work");
        let target = dir.path().join("target");

        let abort = CancellationToken::new();
        abort.cancel();

        let err = materialize_entry(
            reader(&bin, 1000),
            "Cancelled.2020.mkv",
            1000,
            &work,
            &target,
            None,
            &NoOpReencoder,
            &abort,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::ShuttingDown));
        assert!(!work.join(".Cancelled.2020.mkv.partial").exists());
    }

    #[tokio::test]
    async fn name_collisions_get_a_counter() {
        let dir = TempDir::new().unwrap();
        let bin = stub_decoder(dir.path());
        let work = dir.path().join("work");
        let target = dir.path().join("target");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("Movie (2024).mkv"), b"occupied").unwrap();

        let outcome = materialize_entry(
            reader(&bin, 1000),
            "Movie.2024.mkv",
            1000,
            &work,
            &target,
            None,
            &NoOpReencoder,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let ExtractOutcome::Materialized(path) = outcome else {
            panic!("expected materialized outcome");
        };
        assert_eq!(path, target.join("Movie (2024) (2).mkv"));
        assert_eq!(
            std::fs::read(target.join("Movie (2024).mkv")).unwrap(),
            b"occupied",
            "existing files are never overwritten"
        );
    }
}
