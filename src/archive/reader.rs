//! RAR read sessions and random-access entry streaming
//!
//! Listing and encryption probing go through the `unrar` library; the
//! integrity test and entry decoding drive the external `unrar` binary
//! (`t` and `p` commands). Decoding an entry is sequential by nature, so
//! [`EntryReader`] keeps a forward decode cursor over the decoder's stdout:
//! forward seeks discard bytes, backward seeks restart the decoder from the
//! start of the entry.

use crate::archive::ArchiveSet;
use crate::config::ToolsConfig;
use crate::error::{ArchiveError, Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

/// One file inside an archive set
#[derive(Clone, Debug)]
pub struct ArchiveEntry {
    /// Path of the entry within the archive
    pub path: PathBuf,
    /// Uncompressed size in bytes
    pub size: u64,
    /// Stored CRC32, when the archive carries one
    pub crc: Option<u32>,
    /// Whether this entry's data requires a password
    pub encrypted: bool,
    /// Raw DOS modification timestamp from the archive header
    pub dos_mtime: u32,
}

/// An open read session over one archive set
pub struct RarSession {
    set: ArchiveSet,
    unrar_bin: PathBuf,
    test_timeout: Duration,
}

impl RarSession {
    /// Open a session, verifying every present volume is readable and the
    /// decoder binary is available.
    ///
    /// # Errors
    ///
    /// `ArchiveError::MissingVolume` when a volume of the set cannot be
    /// opened; `Error::ExternalTool` when no unrar binary can be found.
    pub fn open(set: ArchiveSet, tools: &ToolsConfig, test_timeout: Duration) -> Result<Self> {
        for volume in &set.volumes {
            if let Err(e) = std::fs::File::open(volume) {
                if e.kind() == std::io::ErrorKind::NotFound {
                    return Err(ArchiveError::MissingVolume {
                        archive: set.first_volume.clone(),
                        volume: volume.clone(),
                    }
                    .into());
                }
                return Err(ArchiveError::Io {
                    archive: set.first_volume.clone(),
                    reason: format!("cannot open {}: {}", volume.display(), e),
                }
                .into());
            }
        }

        let unrar_bin = match (&tools.unrar_path, tools.search_path) {
            (Some(path), _) => path.clone(),
            (None, true) => which::which("unrar")
                .map_err(|_| Error::ExternalTool("unrar not found in PATH".into()))?,
            (None, false) => {
                return Err(Error::ExternalTool(
                    "no unrar binary configured and PATH search disabled".into(),
                ));
            }
        };

        Ok(Self {
            set,
            unrar_bin,
            test_timeout,
        })
    }

    /// The archive set this session reads.
    pub fn set(&self) -> &ArchiveSet {
        &self.set
    }

    /// Whether any data entry requires a password.
    ///
    /// Header-encrypted archives fail the listing itself with a password
    /// error; data-encrypted archives carry the flag on their entries. If the
    /// reader cannot decide without password input, the archive is treated as
    /// encrypted.
    pub fn is_encrypted(&self) -> Result<bool> {
        let listing = match unrar::Archive::new(&self.set.first_volume).open_for_listing() {
            Ok(listing) => listing,
            Err(e) => {
                let msg = e.to_string();
                if is_password_error(&msg) {
                    return Ok(true);
                }
                return Err(self.io_error(format!("cannot list archive: {msg}")));
            }
        };

        for item in listing {
            match item {
                Ok(header) => {
                    if header.is_encrypted() {
                        return Ok(true);
                    }
                }
                Err(e) => {
                    let msg = e.to_string();
                    if is_password_error(&msg) {
                        return Ok(true);
                    }
                    return Err(self.io_error(format!("listing failed: {msg}")));
                }
            }
        }
        Ok(false)
    }

    /// Enumerate data entries in archive order; directory entries are
    /// dropped.
    pub fn entries(&self) -> Result<Vec<ArchiveEntry>> {
        let listing = unrar::Archive::new(&self.set.first_volume)
            .open_for_listing()
            .map_err(|e| self.classify_listing_error(e))?;

        let mut out = Vec::new();
        for item in listing {
            let header = item.map_err(|e| self.classify_listing_error(e))?;
            if header.is_directory() {
                continue;
            }
            out.push(ArchiveEntry {
                path: header.filename.clone(),
                size: header.unpacked_size as u64,
                crc: (header.file_crc != 0).then_some(header.file_crc),
                encrypted: header.is_encrypted(),
                dos_mtime: header.file_time,
            });
        }
        debug!(
            archive = %self.set.first_volume.display(),
            entries = out.len(),
            "enumerated archive entries"
        );
        Ok(out)
    }

    /// Full integrity check via `unrar t`, bounded by the configured
    /// timeout.
    ///
    /// A timeout is reported as [`ArchiveError::Timeout`] and disposed of
    /// like corruption; password failures are reported as encrypted.
    pub async fn test(&self) -> Result<()> {
        let mut cmd = Command::new(&self.unrar_bin);
        cmd.arg("t")
            .arg("-idp")
            .arg("-p-")
            .arg("-y")
            .arg(&self.set.first_volume)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.test_timeout, cmd.output()).await {
            Err(_) => {
                return Err(ArchiveError::Timeout {
                    archive: self.set.first_volume.clone(),
                    seconds: self.test_timeout.as_secs(),
                }
                .into());
            }
            Ok(Err(e)) => {
                return Err(Error::ExternalTool(format!(
                    "failed to execute {}: {}",
                    self.unrar_bin.display(),
                    e
                )));
            }
            Ok(Ok(output)) => output,
        };

        if output.status.success() {
            return Ok(());
        }

        let mut reason = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if reason.is_empty() {
            reason = String::from_utf8_lossy(&output.stdout).trim().to_string();
        }
        if is_password_error(&reason) {
            return Err(ArchiveError::Encrypted {
                archive: self.set.first_volume.clone(),
            }
            .into());
        }
        if is_missing_volume_error(&reason) {
            return Err(ArchiveError::MissingVolume {
                archive: self.set.first_volume.clone(),
                volume: self.set.first_volume.clone(),
            }
            .into());
        }
        Err(ArchiveError::Corrupt {
            archive: self.set.first_volume.clone(),
            reason,
        }
        .into())
    }

    /// Open a random-access reader for one entry.
    ///
    /// Every caller gets its own decode cursor; readers are never shared
    /// between concurrent consumers.
    pub fn open_entry(&self, entry: &ArchiveEntry) -> EntryReader {
        EntryReader::new(
            self.unrar_bin.clone(),
            self.set.first_volume.clone(),
            entry.path.clone(),
            entry.size,
        )
    }

    /// Decoder binary resolved for this session.
    pub fn unrar_bin(&self) -> &Path {
        &self.unrar_bin
    }

    fn classify_listing_error(&self, e: unrar::error::UnrarError) -> Error {
        let msg = e.to_string();
        if is_password_error(&msg) {
            ArchiveError::Encrypted {
                archive: self.set.first_volume.clone(),
            }
            .into()
        } else if is_missing_volume_error(&msg) {
            ArchiveError::MissingVolume {
                archive: self.set.first_volume.clone(),
                volume: self.set.first_volume.clone(),
            }
            .into()
        } else {
            ArchiveError::Corrupt {
                archive: self.set.first_volume.clone(),
                reason: msg,
            }
            .into()
        }
    }

    fn io_error(&self, reason: String) -> Error {
        ArchiveError::Io {
            archive: self.set.first_volume.clone(),
            reason,
        }
        .into()
    }
}

/// Whether a decoder message indicates a password problem.
fn is_password_error(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("password") || lower.contains("encrypted") || msg.contains("ERAR_BAD_PASSWORD")
}

/// Whether a decoder message indicates an absent volume.
fn is_missing_volume_error(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    (lower.contains("volume") && (lower.contains("not found") || lower.contains("missing")))
        || lower.contains("cannot find volume")
}

/// Scratch size used when discarding bytes during a forward seek.
const SKIP_CHUNK: usize = 64 * 1024;

/// Budget for a single read from the decoder pipe. A healthy decoder
/// produces data far faster than this; a stalled one must not hang a range
/// request forever.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Random-access reader over one archive entry
///
/// Wraps a sequential `unrar p` decode pipe. `read_at` before the current
/// cursor respawns the pipe and decodes from the entry start; `read_at` after
/// it discards the gap. The worker and every HTTP request handler hold their
/// own reader, so cursors never interleave.
pub struct EntryReader {
    unrar_bin: PathBuf,
    archive: PathBuf,
    entry: PathBuf,
    size: u64,
    pos: u64,
    child: Option<Child>,
    stream: Option<BufReader<ChildStdout>>,
}

impl EntryReader {
    /// Create a reader; the decoder is spawned lazily on first read.
    pub fn new(unrar_bin: PathBuf, archive: PathBuf, entry: PathBuf, size: u64) -> Self {
        Self {
            unrar_bin,
            archive,
            entry,
            size,
            pos: 0,
            child: None,
            stream: None,
        }
    }

    /// Uncompressed entry size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes read; zero only at end of entry.
    pub async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        self.ensure_position(offset).await?;

        let mut filled = 0;
        while filled < buf.len() {
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => return Err(self.stream_error("decoder not running")),
            };
            let n = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut buf[filled..]))
                .await
                .map_err(|_| self.stream_error("decoder stalled"))?
                .map_err(|e| self.stream_error(&format!("read failed: {e}")))?;
            if n == 0 {
                break;
            }
            filled += n;
            self.pos += n as u64;
        }
        Ok(filled)
    }

    /// Sequential read from the current cursor; convenience for extraction.
    pub async fn read_next(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_at(self.pos, buf).await
    }

    /// Stop the decoder and release its pipe.
    pub async fn close(&mut self) {
        self.stream = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "decoder already exited");
            }
            let _ = child.wait().await;
        }
    }

    async fn ensure_position(&mut self, offset: u64) -> Result<()> {
        if self.stream.is_none() || offset < self.pos {
            if offset < self.pos {
                debug!(
                    entry = %self.entry.display(),
                    from = self.pos,
                    to = offset,
                    "backward seek, restarting decoder"
                );
            }
            self.close().await;
            self.spawn()?;
            self.pos = 0;
        }

        let mut scratch = vec![0u8; SKIP_CHUNK];
        while self.pos < offset {
            let want = ((offset - self.pos) as usize).min(scratch.len());
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => return Err(self.stream_error("decoder not running")),
            };
            let n = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut scratch[..want]))
                .await
                .map_err(|_| self.stream_error("decoder stalled during seek"))?
                .map_err(|e| self.stream_error(&format!("seek read failed: {e}")))?;
            if n == 0 {
                return Err(self.stream_error("entry ended before requested offset"));
            }
            self.pos += n as u64;
        }
        Ok(())
    }

    fn spawn(&mut self) -> Result<()> {
        let mut child = Command::new(&self.unrar_bin)
            .arg("p")
            .arg("-inul")
            .arg("-p-")
            .arg("-y")
            .arg(&self.archive)
            .arg(&self.entry)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::ExternalTool(format!(
                    "failed to spawn {}: {}",
                    self.unrar_bin.display(),
                    e
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.stream_error("decoder has no stdout"))?;
        self.stream = Some(BufReader::new(stdout));
        self.child = Some(child);
        Ok(())
    }

    fn stream_error(&self, reason: &str) -> Error {
        ArchiveError::Io {
            archive: self.archive.clone(),
            reason: format!("{} ({})", reason, self.entry.display()),
        }
        .into()
    }
}

impl Drop for EntryReader {
    fn drop(&mut self) {
        // kill_on_drop on the child covers the pipe; nothing async to do here
        if self.child.is_some() {
            warn!(entry = %self.entry.display(), "entry reader dropped without close");
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_errors_are_recognized() {
        assert!(is_password_error("Corrupt file or wrong password."));
        assert!(is_password_error("The archive is encrypted"));
        assert!(is_password_error("ERAR_BAD_PASSWORD"));
        assert!(!is_password_error("CRC failed in X.mkv"));
    }

    #[test]
    fn missing_volume_errors_are_recognized() {
        assert!(is_missing_volume_error("Cannot find volume X.r01"));
        assert!(is_missing_volume_error("volume X.part02.rar not found"));
        assert!(!is_missing_volume_error("checksum error"));
    }

    // -----------------------------------------------------------------------
    // Decode-cursor behavior against a stub decoder that prints a known
    // pattern: 100 repetitions of "0123456789" (1000 bytes).
    // -----------------------------------------------------------------------

    #[cfg(unix)]
    fn stub_decoder(dir: &std::path::Path) -> PathBuf {
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

    #[cfg(unix)]
    fn pattern_byte(i: u64) -> u8 {
        b'0' + (i % 10) as u8
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sequential_reads_advance_the_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = EntryReader::new(
            stub_decoder(dir.path()),
            PathBuf::from("fake.rar"),
            PathBuf::from("fake.mkv"),
            1000,
        );

        let mut buf = [0u8; 4];
        let n = reader.read_at(0, &mut buf).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"0123");

        let n = reader.read_next(&mut buf).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"4567");

        reader.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forward_seek_discards_the_gap() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = EntryReader::new(
            stub_decoder(dir.path()),
            PathBuf::from("fake.rar"),
            PathBuf::from("fake.mkv"),
            1000,
        );

        let mut buf = [0u8; 5];
        let n = reader.read_at(995, &mut buf).await.unwrap();
        assert_eq!(n, 5);
        for (i, b) in buf.iter().enumerate() {
            assert_eq!(*b, pattern_byte(995 + i as u64));
        }

        // at end of entry
        let n = reader.read_at(1000, &mut buf).await.unwrap();
        assert_eq!(n, 0);

        reader.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn backward_seek_restarts_the_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = EntryReader::new(
            stub_decoder(dir.path()),
            PathBuf::from("fake.rar"),
            PathBuf::from("fake.mkv"),
            1000,
        );

        let mut buf = [0u8; 2];
        reader.read_at(500, &mut buf).await.unwrap();
        assert_eq!(buf[0], pattern_byte(500));

        // Seek backwards; the reader must restart from zero transparently.
        let n = reader.read_at(3, &mut buf).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf, b"34");

        reader.close().await;
    }
}
