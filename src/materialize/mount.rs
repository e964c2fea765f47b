//! Strategy C — external mount helper
//!
//! An adapter to an out-of-process capability: the helper mounts an archive
//! set as a virtual directory, and symbolic links to the mounted entries are
//! created inside the target. Readiness is judged by polling the mount point
//! for entries up to a bounded timeout. Every mount launched by this process
//! is released at shutdown.

use super::sanitize::{sanitize_media_name, unique_target_path};
use crate::archive::{ArchiveEntry, ArchiveSet};
use crate::config::ExternalMountConfig;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Poll cadence while waiting for a mount to become ready.
const READINESS_POLL: Duration = Duration::from_millis(500);

struct ActiveMount {
    archive: PathBuf,
    mount_point: PathBuf,
    child: Child,
    links: Vec<PathBuf>,
}

/// Tracks every helper process this service has launched
pub struct MountManager {
    config: ExternalMountConfig,
    mount_base: PathBuf,
    active: Mutex<Vec<ActiveMount>>,
}

impl MountManager {
    /// Create a manager rooted at `mount_base`.
    pub fn new(config: ExternalMountConfig, mount_base: PathBuf) -> Self {
        Self {
            config,
            mount_base,
            active: Mutex::new(Vec::new()),
        }
    }

    /// Mount one archive set and link its filtered entries into the target.
    ///
    /// Failures (helper missing, mount timeout, link errors) surface as
    /// [`Error::Mount`], which quarantines the queue item.
    pub async fn materialize_set(
        &self,
        set: &ArchiveSet,
        entries: &[ArchiveEntry],
        target_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let executable = self.resolve_executable()?;
        let mount_point = self.mount_base.join(&set.stem);
        tokio::fs::create_dir_all(&mount_point).await?;
        tokio::fs::create_dir_all(target_dir).await?;

        let mut cmd = Command::new(&executable);
        cmd.arg(&set.first_volume).arg(&mount_point);
        for option in &self.config.mount_options {
            cmd.arg("-o").arg(option);
        }
        cmd.arg("-f")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        info!(
            archive = %set.first_volume.display(),
            mount_point = %mount_point.display(),
            "launching mount helper"
        );
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Mount(format!("cannot launch {}: {}", executable.display(), e)))?;

        if let Err(e) = self
            .wait_ready(&mut child, &mount_point)
            .await
        {
            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = tokio::fs::remove_dir_all(&mount_point).await;
            return Err(e);
        }

        let mut links = Vec::new();
        for entry in entries {
            let source = mount_point.join(&entry.path);
            let entry_name = entry
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "entry".to_string());
            let link = unique_target_path(target_dir, &sanitize_media_name(&entry_name))?;
            if let Err(e) = symlink(&source, &link) {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(Error::Mount(format!(
                    "cannot link {}: {}",
                    link.display(),
                    e
                )));
            }
            debug!(link = %link.display(), source = %source.display(), "linked mounted entry");
            links.push(link);
        }

        let produced = links.clone();
        self.active.lock().await.push(ActiveMount {
            archive: set.first_volume.clone(),
            mount_point,
            child,
            links,
        });
        Ok(produced)
    }

    /// Release every mount this process launched; links, helper processes
    /// and mount points all go.
    pub async fn release_all(&self) {
        let mut active = self.active.lock().await;
        for mut mount in active.drain(..) {
            info!(archive = %mount.archive.display(), "releasing mount");
            for link in &mount.links {
                if let Err(e) = tokio::fs::remove_file(link).await {
                    debug!(link = %link.display(), error = %e, "link already gone");
                }
            }
            if mount.child.start_kill().is_ok() {
                let timeout = Duration::from_secs(self.config.unmount_timeout);
                if tokio::time::timeout(timeout, mount.child.wait()).await.is_err() {
                    warn!(
                        mount_point = %mount.mount_point.display(),
                        "mount helper did not exit within the unmount timeout"
                    );
                }
            }
            let _ = tokio::fs::remove_dir_all(&mount.mount_point).await;
        }
    }

    /// Number of live mounts.
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    fn resolve_executable(&self) -> Result<PathBuf> {
        let configured = &self.config.executable;
        if configured.components().count() > 1 || configured.is_absolute() {
            if configured.exists() {
                return Ok(configured.clone());
            }
            return Err(Error::Mount(format!(
                "mount helper not found: {}",
                configured.display()
            )));
        }
        which::which(configured)
            .map_err(|_| Error::Mount(format!("mount helper not found: {}", configured.display())))
    }

    async fn wait_ready(&self, child: &mut Child, mount_point: &Path) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.config.readiness_timeout);
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(Error::Mount(format!(
                    "mount helper exited early with {status}"
                )));
            }
            let populated = std::fs::read_dir(mount_point)
                .map(|mut d| d.next().is_some())
                .unwrap_or(false);
            if populated {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Mount(format!(
                    "mount point {} not ready within {}s",
                    mount_point.display(),
                    self.config.readiness_timeout
                )));
            }
            tokio::time::sleep(READINESS_POLL).await;
        }
    }
}

#[cfg(unix)]
fn symlink(source: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, link)
}

#[cfg(windows)]
fn symlink(source: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(source, link)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn set(dir: &Path) -> ArchiveSet {
        let first = dir.join("X.rar");
        std::fs::write(&first, b"rar").unwrap();
        ArchiveSet {
            first_volume: first.clone(),
            volumes: vec![first],
            stem: "X".into(),
        }
    }

    fn entry(name: &str) -> ArchiveEntry {
        ArchiveEntry {
            path: PathBuf::from(name),
            size: 10,
            crc: None,
            encrypted: false,
            dos_mtime: 0,
        }
    }

    #[tokio::test]
    async fn missing_helper_is_a_mount_error() {
        let dir = TempDir::new().unwrap();
        let manager = MountManager::new(
            ExternalMountConfig {
                executable: PathBuf::from("definitely-not-a-mount-helper-xyz"),
                ..Default::default()
            },
            dir.path().join("mounts"),
        );

        let err = manager
            .materialize_set(&set(dir.path()), &[], &dir.path().join("target"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Mount(_)));
        assert!(err.quarantines_immediately());
    }

    #[tokio::test]
    async fn unready_mount_times_out() {
        let dir = TempDir::new().unwrap();
        // Helper that never populates the mount point.
        let helper = script(dir.path(), "sleepy-helper", "#!/bin/sh\nsleep 30\n");

        let manager = MountManager::new(
            ExternalMountConfig {
                executable: helper,
                readiness_timeout: 1,
                unmount_timeout: 1,
                ..Default::default()
            },
            dir.path().join("mounts"),
        );

        let err = manager
            .materialize_set(&set(dir.path()), &[], &dir.path().join("target"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Mount(_)));
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn ready_mount_links_entries_and_releases_cleanly() {
        let dir = TempDir::new().unwrap();
        // Helper that drops a file into the mount point, then idles like a
        // foreground FUSE process would.
        let helper = script(
            dir.path(),
            "ready-helper",
            "#!/bin/sh\ntouch \"$2/Movie.2021.mkv\"\nsleep 30\n",
        );

        let manager = MountManager::new(
            ExternalMountConfig {
                executable: helper,
                readiness_timeout: 10,
                unmount_timeout: 2,
                ..Default::default()
            },
            dir.path().join("mounts"),
        );

        let target = dir.path().join("target");
        let links = manager
            .materialize_set(&set(dir.path()), &[entry("Movie.2021.mkv")], &target)
            .await
            .unwrap();

        assert_eq!(links, vec![target.join("Movie (2021).mkv")]);
        assert!(links[0].symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(manager.active_count().await, 1);

        manager.release_all().await;
        assert_eq!(manager.active_count().await, 0);
        assert!(!links[0].exists(), "links are removed at release");
        assert!(
            !dir.path().join("mounts").join("X").exists(),
            "mount point is removed at release"
        );
    }
}
