//! Virtual filesystem for archive entries served over HTTP
//!
//! The registry is an arena of opaque tokens: the queue worker inserts
//! registrations at pointer-creation time, HTTP request handlers read them,
//! and only an explicit shutdown purges. Tokens outlive the queue item that
//! created them because pointer files may be played long after processing.

pub mod server;

use crate::archive::EntryReader;
use crate::config::{BindScope, VirtualHttpConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Registration of one token: which entry of which archive it serves
#[derive(Clone, Debug)]
pub struct TokenEntry {
    /// The opaque URL-safe token
    pub token: String,
    /// First volume of the backing archive set
    pub archive: PathBuf,
    /// Entry path within the archive
    pub entry: PathBuf,
    /// Uncompressed entry size in bytes
    pub size: u64,
}

/// Token arena shared between the worker (inserts) and the HTTP server
/// (reads)
///
/// Reads are concurrent; inserts and the rare release take a short write
/// lock.
#[derive(Default)]
pub struct TokenRegistry {
    inner: RwLock<HashMap<String, Arc<TokenEntry>>>,
}

impl TokenRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an archive entry and return its fresh token.
    ///
    /// Tokens carry 128 bits of entropy, hex-encoded (URL-safe by
    /// construction).
    pub async fn register(&self, archive: PathBuf, entry: PathBuf, size: u64) -> String {
        let token = format!("{:032x}", rand::random::<u128>());
        let registration = Arc::new(TokenEntry {
            token: token.clone(),
            archive,
            entry,
            size,
        });
        self.inner.write().await.insert(token.clone(), registration);
        token
    }

    /// Resolve a token to its registration.
    pub async fn resolve(&self, token: &str) -> Option<Arc<TokenEntry>> {
        self.inner.read().await.get(token).cloned()
    }

    /// Explicitly release a token; pointer files referencing it go dead.
    pub async fn release(&self, token: &str) -> bool {
        self.inner.write().await.remove(token).is_some()
    }

    /// Number of live tokens.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether no tokens are registered.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Repoint every registration of `old_archive` at `new_archive`.
    ///
    /// Called when the disposer relocates a processed set so pointer files
    /// keep playing after the move.
    pub async fn rebase_archive(&self, old_archive: &Path, new_archive: &Path) -> usize {
        let mut inner = self.inner.write().await;
        let mut moved = 0;
        for registration in inner.values_mut() {
            if registration.archive == old_archive {
                let mut updated = TokenEntry::clone(registration);
                updated.archive = new_archive.to_path_buf();
                *registration = Arc::new(updated);
                moved += 1;
            }
        }
        moved
    }

    /// Drop every registration; called at shutdown.
    pub async fn purge(&self) {
        self.inner.write().await.clear();
    }
}

/// Byte stream over one archive entry, owned by a single consumer
#[async_trait]
pub trait EntryStream: Send {
    /// Uncompressed entry size in bytes.
    fn size(&self) -> u64;

    /// Read up to `buf.len()` bytes at `offset`; zero means end of entry.
    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Release underlying resources.
    async fn close(&mut self);
}

/// Factory handing each HTTP request its own [`EntryStream`]
///
/// The seam exists so request handlers never share a decode cursor, and so
/// the server is testable against in-memory entries.
#[async_trait]
pub trait EntrySource: Send + Sync {
    /// Open a fresh stream for a registered entry.
    async fn open(&self, registration: &TokenEntry) -> Result<Box<dyn EntryStream>>;
}

#[async_trait]
impl EntryStream for EntryReader {
    fn size(&self) -> u64 {
        EntryReader::size(self)
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        EntryReader::read_at(self, offset, buf).await
    }

    async fn close(&mut self) {
        EntryReader::close(self).await;
    }
}

/// Production [`EntrySource`] decoding entries through the unrar binary
pub struct ArchiveEntrySource {
    unrar_bin: PathBuf,
}

impl ArchiveEntrySource {
    /// Create a source using the given decoder binary.
    pub fn new(unrar_bin: PathBuf) -> Self {
        Self { unrar_bin }
    }
}

#[async_trait]
impl EntrySource for ArchiveEntrySource {
    async fn open(&self, registration: &TokenEntry) -> Result<Box<dyn EntryStream>> {
        Ok(Box::new(EntryReader::new(
            self.unrar_bin.clone(),
            registration.archive.clone(),
            registration.entry.clone(),
            registration.size,
        )))
    }
}

/// Where the bound server is reachable, for pointer-file URLs
#[derive(Clone, Debug)]
pub struct VfsHandle {
    /// Port the server picked from the configured range
    pub port: u16,
    /// Host pointer URLs advertise
    pub advertised_host: String,
}

impl VfsHandle {
    /// Pointer URL for a token and its cosmetic (url-encoded) file name.
    pub fn entry_url(&self, token: &str, file_name: &str) -> String {
        format!(
            "http://{}:{}/{}/{}",
            self.advertised_host,
            self.port,
            token,
            urlencoding::encode(file_name)
        )
    }
}

/// Bind a listener on the first free port of the configured range.
///
/// # Errors
///
/// [`Error::PortUnavailable`] when every port in the window is taken.
pub async fn bind(config: &VirtualHttpConfig) -> Result<(TcpListener, VfsHandle)> {
    let ip: IpAddr = match config.bind {
        BindScope::Loopback => IpAddr::V4(Ipv4Addr::LOCALHOST),
        BindScope::Any => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };

    let [lo, hi] = config.port_range;
    for port in lo..=hi {
        match TcpListener::bind(SocketAddr::new(ip, port)).await {
            Ok(listener) => {
                let handle = VfsHandle {
                    port,
                    advertised_host: advertised_host(config.bind),
                };
                info!(port, host = %handle.advertised_host, "virtual-http server bound");
                return Ok((listener, handle));
            }
            Err(e) => {
                debug!(port, error = %e, "port unavailable, trying next");
            }
        }
    }
    Err(Error::PortUnavailable { lo, hi })
}

/// Host name advertised in pointer URLs.
///
/// Loopback binds advertise 127.0.0.1; all-interface binds advertise the
/// LAN address so other hosts on the network can play the pointers.
fn advertised_host(scope: BindScope) -> String {
    match scope {
        BindScope::Loopback => "127.0.0.1".to_string(),
        BindScope::Any => detect_lan_ip().unwrap_or_else(|| "127.0.0.1".to_string()),
    }
}

/// Best-effort LAN address detection via a connected UDP socket; no packets
/// are sent.
fn detect_lan_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_resolve_release_round_trip() {
        let registry = TokenRegistry::new();
        let token = registry
            .register(PathBuf::from("/w/x.rar"), PathBuf::from("x.mkv"), 1000)
            .await;

        let entry = registry.resolve(&token).await.unwrap();
        assert_eq!(entry.archive, PathBuf::from("/w/x.rar"));
        assert_eq!(entry.entry, PathBuf::from("x.mkv"));
        assert_eq!(entry.size, 1000);

        assert!(registry.release(&token).await);
        assert!(registry.resolve(&token).await.is_none());
        assert!(!registry.release(&token).await);
    }

    #[tokio::test]
    async fn tokens_are_unique_and_url_safe() {
        let registry = TokenRegistry::new();
        let mut tokens = std::collections::HashSet::new();
        for _ in 0..64 {
            let token = registry
                .register(PathBuf::from("/a.rar"), PathBuf::from("a.mkv"), 1)
                .await;
            assert_eq!(token.len(), 32, "128 bits hex-encoded");
            assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(tokens.insert(token));
        }
        assert_eq!(registry.len().await, 64);
    }

    #[tokio::test]
    async fn rebase_follows_a_relocated_archive() {
        let registry = TokenRegistry::new();
        let token = registry
            .register(PathBuf::from("/watch/x.rar"), PathBuf::from("x.mkv"), 7)
            .await;
        let other = registry
            .register(PathBuf::from("/watch/y.rar"), PathBuf::from("y.mkv"), 8)
            .await;

        let moved = registry
            .rebase_archive(Path::new("/watch/x.rar"), Path::new("/archive/x.rar"))
            .await;
        assert_eq!(moved, 1);

        let entry = registry.resolve(&token).await.unwrap();
        assert_eq!(entry.archive, PathBuf::from("/archive/x.rar"));
        assert_eq!(entry.size, 7, "other fields are preserved");

        let untouched = registry.resolve(&other).await.unwrap();
        assert_eq!(untouched.archive, PathBuf::from("/watch/y.rar"));
    }

    #[tokio::test]
    async fn purge_empties_the_registry() {
        let registry = TokenRegistry::new();
        registry
            .register(PathBuf::from("/a.rar"), PathBuf::from("a.mkv"), 1)
            .await;
        registry.purge().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn bind_picks_a_port_inside_the_range() {
        let config = VirtualHttpConfig {
            port_range: [41200, 41210],
            ..Default::default()
        };
        let (listener, handle) = bind(&config).await.unwrap();
        let local = listener.local_addr().unwrap();
        assert!((41200..=41210).contains(&local.port()));
        assert_eq!(handle.port, local.port());
        assert_eq!(handle.advertised_host, "127.0.0.1");
    }

    #[tokio::test]
    async fn exhausted_range_reports_port_unavailable() {
        let config = VirtualHttpConfig {
            port_range: [41300, 41300],
            ..Default::default()
        };
        let (_keep, _handle) = bind(&config).await.unwrap();

        let err = bind(&config).await.unwrap_err();
        assert!(matches!(err, Error::PortUnavailable { lo: 41300, hi: 41300 }));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn entry_url_encodes_the_cosmetic_name() {
        let handle = VfsHandle {
            port: 8765,
            advertised_host: "127.0.0.1".into(),
        };
        let url = handle.entry_url("abcd", "Movie Title (2024).mkv");
        assert_eq!(
            url,
            "http://127.0.0.1:8765/abcd/Movie%20Title%20%282024%29.mkv"
        );
    }
}
