//! End-to-end range-server behavior over real TCP.
//!
//! Binds the server on a port from a private range, registers an in-memory
//! entry and exercises the wire contract with a real HTTP client.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use rar_bridge::config::VirtualHttpConfig;
use rar_bridge::error::Result;
use rar_bridge::vfs::server::{serve, ServerState};
use rar_bridge::vfs::{self, EntrySource, EntryStream, TokenEntry, TokenRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const ENTRY_SIZE: usize = 64 * 1024;

fn pattern() -> Vec<u8> {
    (0..ENTRY_SIZE).map(|i| (i % 251) as u8).collect()
}

struct MemStream(Arc<Vec<u8>>);

#[async_trait]
impl EntryStream for MemStream {
    fn size(&self) -> u64 {
        self.0.len() as u64
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = &self.0[..];
        if offset >= data.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    async fn close(&mut self) {}
}

struct MemSource(Arc<Vec<u8>>);

#[async_trait]
impl EntrySource for MemSource {
    async fn open(&self, _registration: &TokenEntry) -> Result<Box<dyn EntryStream>> {
        Ok(Box::new(MemStream(Arc::clone(&self.0))))
    }
}

struct Fixture {
    base: String,
    token: String,
    data: Vec<u8>,
    shutdown: CancellationToken,
}

async fn start_server() -> Fixture {
    let config = VirtualHttpConfig {
        port_range: [42100, 42199],
        ..Default::default()
    };
    let (listener, handle) = vfs::bind(&config).await.unwrap();

    let registry = Arc::new(TokenRegistry::new());
    let data = pattern();
    let token = registry
        .register(
            PathBuf::from("/watch/Test.rar"),
            PathBuf::from("Test.mkv"),
            data.len() as u64,
        )
        .await;

    let state = ServerState::new(
        Arc::clone(&registry),
        Arc::new(MemSource(Arc::new(data.clone()))),
        8 * 1024,
    );
    let shutdown = CancellationToken::new();
    tokio::spawn(serve(listener, state, 10, shutdown.clone()));

    Fixture {
        base: format!("http://{}:{}", handle.advertised_host, handle.port),
        token,
        data,
        shutdown,
    }
}

#[tokio::test]
async fn head_get_and_ranges_agree_over_the_wire() {
    let fixture = start_server().await;
    let client = reqwest::Client::new();
    let url = format!("{}/{}/Test.mkv", fixture.base, fixture.token);

    // HEAD reports the full size.
    let head = client.head(&url).send().await.unwrap();
    assert_eq!(head.status(), 200);
    assert_eq!(
        head.headers().get("content-length").unwrap(),
        &ENTRY_SIZE.to_string()
    );
    assert_eq!(head.headers().get("accept-ranges").unwrap(), "bytes");
    assert_eq!(head.headers().get("cache-control").unwrap(), "no-store");

    // Full GET returns every byte.
    let full = client.get(&url).send().await.unwrap();
    assert_eq!(full.status(), 200);
    let body = full.bytes().await.unwrap();
    assert_eq!(body.as_ref(), &fixture.data[..]);

    // A bounded range returns exactly those bytes.
    let ranged = client
        .get(&url)
        .header("range", "bytes=1000-1999")
        .send()
        .await
        .unwrap();
    assert_eq!(ranged.status(), 206);
    assert_eq!(
        ranged.headers().get("content-range").unwrap(),
        &format!("bytes 1000-1999/{ENTRY_SIZE}")
    );
    let body = ranged.bytes().await.unwrap();
    assert_eq!(body.as_ref(), &fixture.data[1000..2000]);

    fixture.shutdown.cancel();
}

#[tokio::test]
async fn eof_ranges_follow_the_boundary_table() {
    let fixture = start_server().await;
    let client = reqwest::Client::new();
    let url = format!("{}/{}/Test.mkv", fixture.base, fixture.token);
    let size = ENTRY_SIZE as u64;

    // Last byte, open-ended: one byte.
    let last = client
        .get(&url)
        .header("range", format!("bytes={}-", size - 1))
        .send()
        .await
        .unwrap();
    assert_eq!(last.status(), 206);
    assert_eq!(
        last.headers().get("content-range").unwrap(),
        &format!("bytes {}-{}/{}", size - 1, size - 1, size)
    );
    assert_eq!(last.bytes().await.unwrap().len(), 1);

    // Starting at the size: unsatisfiable.
    let past = client
        .get(&url)
        .header("range", format!("bytes={size}-"))
        .send()
        .await
        .unwrap();
    assert_eq!(past.status(), 416);
    assert_eq!(
        past.headers().get("content-range").unwrap(),
        &format!("bytes */{size}")
    );

    fixture.shutdown.cancel();
}

#[tokio::test]
async fn unknown_tokens_and_methods_are_rejected() {
    let fixture = start_server().await;
    let client = reqwest::Client::new();

    let missing = client
        .get(format!("{}/ffffffffffffffff/void.mkv", fixture.base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    let post = client
        .post(format!("{}/{}/Test.mkv", fixture.base, fixture.token))
        .send()
        .await
        .unwrap();
    assert_eq!(post.status(), 405);

    fixture.shutdown.cancel();
}

#[tokio::test]
async fn concurrent_range_readers_do_not_interfere() {
    let fixture = start_server().await;
    let client = reqwest::Client::new();
    let url = format!("{}/{}/Test.mkv", fixture.base, fixture.token);

    let mut handles = Vec::new();
    for i in 0..8u64 {
        let client = client.clone();
        let url = url.clone();
        let expected = fixture.data[(i * 1000) as usize..((i + 1) * 1000) as usize].to_vec();
        handles.push(tokio::spawn(async move {
            let response = client
                .get(&url)
                .header("range", format!("bytes={}-{}", i * 1000, (i + 1) * 1000 - 1))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), 206);
            assert_eq!(response.bytes().await.unwrap().as_ref(), &expected[..]);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    fixture.shutdown.cancel();
}
