//! HTTP range server for archive entries
//!
//! Serves `HEAD`, `GET` and `GET` with a single `Range` per token; all other
//! methods get 405, unknown tokens 404. Bodies stream through a small bounded
//! channel so a slow client throttles archive reads instead of buffering
//! them. Every request opens its own entry stream; decode cursors are never
//! shared between handlers.

use super::{EntrySource, TokenEntry, TokenRegistry};
use axum::body::{Body, Bytes};
use axum::extract::{Path as AxumPath, State};
use axum::http::header::{
    ACCEPT_RANGES, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE,
};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tracing::{debug, error, info};

/// Depth of the per-response chunk channel; keeps backpressure tight without
/// stalling on every chunk.
const BODY_CHANNEL_DEPTH: usize = 4;

/// Shared state of the range server
#[derive(Clone)]
pub struct ServerState {
    registry: Arc<TokenRegistry>,
    source: Arc<dyn EntrySource>,
    chunk_size: usize,
}

impl ServerState {
    /// Assemble server state.
    pub fn new(registry: Arc<TokenRegistry>, source: Arc<dyn EntrySource>, chunk_size: usize) -> Self {
        Self {
            registry,
            source,
            chunk_size: chunk_size.max(1),
        }
    }
}

/// Build the router: one route, token plus cosmetic file name.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/:token/:name", get(serve_entry))
        .with_state(state)
}

/// Run the server until the shutdown token fires.
///
/// In-flight range requests complete during graceful shutdown; the bridge
/// stops this server last for exactly that reason.
pub async fn serve(
    listener: TcpListener,
    state: ServerState,
    max_concurrent_streams: usize,
    shutdown: CancellationToken,
) {
    let app = router(state).layer(GlobalConcurrencyLimitLayer::new(max_concurrent_streams.max(1)));

    info!(max_concurrent_streams, "range server serving");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = result {
        error!(error = %e, "range server terminated");
    }
}

/// How a request's `Range` header maps onto an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeOutcome {
    /// No (usable) range: serve the whole entry with 200
    Full,
    /// A single satisfiable range: serve 206 with these inclusive bounds
    Partial(u64, u64),
    /// Out of bounds or multi-range: 416
    Unsatisfiable,
}

/// Evaluate the `Range` header against an entry size.
///
/// Multi-range requests are rejected; the media server never needs them.
/// Malformed headers are ignored per HTTP semantics and get the full entry.
fn evaluate_range(headers: &HeaderMap, size: u64) -> RangeOutcome {
    let Some(raw) = headers.get("range").and_then(|v| v.to_str().ok()) else {
        return RangeOutcome::Full;
    };
    let Some(spec) = raw.trim().strip_prefix("bytes=") else {
        return RangeOutcome::Full;
    };
    if spec.contains(',') {
        return RangeOutcome::Unsatisfiable;
    }

    let Some((start_str, end_str)) = spec.split_once('-') else {
        return RangeOutcome::Full;
    };

    if start_str.is_empty() {
        // Suffix range: last N bytes.
        let Ok(suffix) = end_str.trim().parse::<u64>() else {
            return RangeOutcome::Full;
        };
        if suffix == 0 || size == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        let start = size.saturating_sub(suffix);
        return RangeOutcome::Partial(start, size - 1);
    }

    let Ok(start) = start_str.trim().parse::<u64>() else {
        return RangeOutcome::Full;
    };
    if size == 0 || start > size - 1 {
        return RangeOutcome::Unsatisfiable;
    }

    let end = if end_str.trim().is_empty() {
        size - 1
    } else {
        match end_str.trim().parse::<u64>() {
            Ok(end) if end >= start => end.min(size - 1),
            _ => return RangeOutcome::Full,
        }
    };

    RangeOutcome::Partial(start, end)
}

async fn serve_entry(
    State(state): State<ServerState>,
    method: Method,
    AxumPath((token, _name)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let Some(registration) = state.registry.resolve(&token).await else {
        debug!(token = %token, "unknown or released token");
        return StatusCode::NOT_FOUND.into_response();
    };

    let size = registration.size;
    let content_type = mime_guess::from_path(&registration.entry)
        .first_or_octet_stream()
        .to_string();

    if method == Method::HEAD {
        return entry_response(StatusCode::OK, &content_type, size, None, Body::empty());
    }

    match evaluate_range(&headers, size) {
        RangeOutcome::Unsatisfiable => {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            if let Ok(value) = format!("bytes */{size}").parse() {
                response.headers_mut().insert(CONTENT_RANGE, value);
            }
            response
        }
        RangeOutcome::Full => {
            let body = stream_entry(&state, registration, 0, size.saturating_sub(1), size == 0);
            entry_response(StatusCode::OK, &content_type, size, None, body)
        }
        RangeOutcome::Partial(start, end) => {
            let body = stream_entry(&state, registration, start, end, false);
            entry_response(
                StatusCode::PARTIAL_CONTENT,
                &content_type,
                end - start + 1,
                Some(format!("bytes {start}-{end}/{size}")),
                body,
            )
        }
    }
}

fn entry_response(
    status: StatusCode,
    content_type: &str,
    content_length: u64,
    content_range: Option<String>,
    body: Body,
) -> Response {
    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .header(CONTENT_LENGTH, content_length.to_string())
        .header(ACCEPT_RANGES, "bytes")
        .header(CACHE_CONTROL, "no-store");
    if let Some(range) = content_range {
        builder = builder.header(CONTENT_RANGE, range);
    }
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Stream `[start, end]` of an entry through a bounded channel.
///
/// The reading task blocks on the channel when the client is slow, which in
/// turn throttles archive decoding. A read error mid-stream poisons the body
/// and the connection is dropped without trailing bytes.
fn stream_entry(
    state: &ServerState,
    registration: Arc<TokenEntry>,
    start: u64,
    end: u64,
    empty: bool,
) -> Body {
    if empty {
        return Body::empty();
    }

    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(BODY_CHANNEL_DEPTH);
    let source = Arc::clone(&state.source);
    let chunk_size = state.chunk_size;

    tokio::spawn(async move {
        let mut stream = match source.open(&registration).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(entry = %registration.entry.display(), error = %e, "cannot open entry stream");
                let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                return;
            }
        };

        let mut buf = vec![0u8; chunk_size];
        let mut pos = start;
        while pos <= end {
            let want = ((end - pos + 1) as usize).min(chunk_size);
            match stream.read_at(pos, &mut buf[..want]).await {
                Ok(0) => {
                    // Entry ended before the advertised size; poison the body
                    // so the client sees a broken connection, not silence.
                    let _ = tx
                        .send(Err(std::io::Error::other("entry ended early")))
                        .await;
                    break;
                }
                Ok(n) => {
                    if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                        // Client went away; stop decoding.
                        break;
                    }
                    pos += n as u64;
                }
                Err(e) => {
                    debug!(entry = %registration.entry.display(), error = %e, "read error mid-stream");
                    let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                    break;
                }
            }
        }
        stream.close().await;
    });

    Body::from_stream(ReceiverStream::new(rx))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::vfs::EntryStream;
    use async_trait::async_trait;
    use axum::http::Request;
    use std::path::PathBuf;
    use tower::ServiceExt;

    struct MemStream {
        data: Arc<Vec<u8>>,
    }

    #[async_trait]
    impl EntryStream for MemStream {
        fn size(&self) -> u64 {
            self.data.len() as u64
        }

        async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            let data = &self.data[..];
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

    struct MemSource {
        data: Arc<Vec<u8>>,
    }

    #[async_trait]
    impl EntrySource for MemSource {
        async fn open(&self, _registration: &TokenEntry) -> Result<Box<dyn EntryStream>> {
            Ok(Box::new(MemStream {
                data: Arc::clone(&self.data),
            }))
        }
    }

    /// Ten bytes with distinct values so range math mistakes show up.
    fn content() -> Vec<u8> {
        (0u8..10).collect()
    }

    async fn fixture() -> (Router, String) {
        let registry = Arc::new(TokenRegistry::new());
        let data = Arc::new(content());
        let token = registry
            .register(
                PathBuf::from("/watch/Test.rar"),
                PathBuf::from("Test.mkv"),
                data.len() as u64,
            )
            .await;
        let state = ServerState::new(registry, Arc::new(MemSource { data }), 3);
        (router(state), token)
    }

    async fn send(app: &Router, method: &str, uri: &str, range: Option<&str>) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(range) = range {
            builder = builder.header("range", range);
        }
        app.clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    fn header<'r>(response: &'r Response, name: &str) -> Option<&'r str> {
        response.headers().get(name).and_then(|v| v.to_str().ok())
    }

    // -----------------------------------------------------------------------
    // HEAD / full GET
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn head_reports_size_without_a_body() {
        let (app, token) = fixture().await;
        let response = send(&app, "HEAD", &format!("/{token}/Test.mkv"), None).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "content-length"), Some("10"));
        assert_eq!(header(&response, "accept-ranges"), Some("bytes"));
        assert_eq!(header(&response, "cache-control"), Some("no-store"));
        assert_eq!(header(&response, "content-type"), Some("video/x-matroska"));
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn full_get_streams_the_whole_entry() {
        let (app, token) = fixture().await;
        let response = send(&app, "GET", &format!("/{token}/Test.mkv"), None).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "content-length"), Some("10"));
        assert_eq!(body_bytes(response).await, content());
    }

    #[tokio::test]
    async fn head_and_get_agree_on_content_length() {
        let (app, token) = fixture().await;
        let head = send(&app, "HEAD", &format!("/{token}/Test.mkv"), None).await;
        let get = send(&app, "GET", &format!("/{token}/Test.mkv"), None).await;
        assert_eq!(
            header(&head, "content-length"),
            header(&get, "content-length")
        );
    }

    // -----------------------------------------------------------------------
    // Range requests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn bounded_range_returns_exactly_those_bytes() {
        let (app, token) = fixture().await;
        let response = send(&app, "GET", &format!("/{token}/n"), Some("bytes=2-5")).await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header(&response, "content-range"), Some("bytes 2-5/10"));
        assert_eq!(header(&response, "content-length"), Some("4"));
        assert_eq!(body_bytes(response).await, vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn open_range_runs_to_the_end() {
        let (app, token) = fixture().await;
        let response = send(&app, "GET", &format!("/{token}/n"), Some("bytes=7-")).await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header(&response, "content-range"), Some("bytes 7-9/10"));
        assert_eq!(body_bytes(response).await, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn first_byte_range_is_one_byte() {
        let (app, token) = fixture().await;
        let response = send(&app, "GET", &format!("/{token}/n"), Some("bytes=0-0")).await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header(&response, "content-range"), Some("bytes 0-0/10"));
        assert_eq!(body_bytes(response).await, vec![0]);
    }

    #[tokio::test]
    async fn last_byte_open_range_is_one_byte() {
        let (app, token) = fixture().await;
        let response = send(&app, "GET", &format!("/{token}/n"), Some("bytes=9-")).await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header(&response, "content-range"), Some("bytes 9-9/10"));
        assert_eq!(body_bytes(response).await, vec![9]);
    }

    #[tokio::test]
    async fn range_starting_at_size_is_unsatisfiable() {
        let (app, token) = fixture().await;
        let response = send(&app, "GET", &format!("/{token}/n"), Some("bytes=10-")).await;

        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(header(&response, "content-range"), Some("bytes */10"));
    }

    #[tokio::test]
    async fn end_past_size_is_capped() {
        let (app, token) = fixture().await;
        let response = send(&app, "GET", &format!("/{token}/n"), Some("bytes=8-200")).await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header(&response, "content-range"), Some("bytes 8-9/10"));
        assert_eq!(body_bytes(response).await, vec![8, 9]);
    }

    #[tokio::test]
    async fn multi_range_is_rejected() {
        let (app, token) = fixture().await;
        let response = send(
            &app,
            "GET",
            &format!("/{token}/n"),
            Some("bytes=0-1,4-5"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn suffix_range_returns_the_tail() {
        let (app, token) = fixture().await;
        let response = send(&app, "GET", &format!("/{token}/n"), Some("bytes=-3")).await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header(&response, "content-range"), Some("bytes 7-9/10"));
        assert_eq!(body_bytes(response).await, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn malformed_range_falls_back_to_full_entry() {
        let (app, token) = fixture().await;
        let response = send(&app, "GET", &format!("/{token}/n"), Some("chunks=1-2")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, content());
    }

    // -----------------------------------------------------------------------
    // Token and method handling
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn unknown_token_is_404() {
        let (app, _token) = fixture().await;
        let response = send(&app, "GET", "/deadbeef/Test.mkv", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn other_methods_get_405_with_allow() {
        let (app, token) = fixture().await;
        for method in ["POST", "PUT", "DELETE", "PATCH"] {
            let response = send(&app, method, &format!("/{token}/n"), None).await;
            assert_eq!(
                response.status(),
                StatusCode::METHOD_NOT_ALLOWED,
                "{method} should be rejected"
            );
            let allow = header(&response, "allow").unwrap_or_default().to_uppercase();
            assert!(allow.contains("GET"), "allow header was {allow:?}");
        }
    }

    // -----------------------------------------------------------------------
    // Range evaluation unit coverage
    // -----------------------------------------------------------------------

    #[test]
    fn evaluate_range_handles_the_boundary_table() {
        let with = |value: &str| {
            let mut headers = HeaderMap::new();
            headers.insert("range", value.parse().unwrap());
            headers
        };

        assert_eq!(evaluate_range(&HeaderMap::new(), 10), RangeOutcome::Full);
        assert_eq!(
            evaluate_range(&with("bytes=0-0"), 10),
            RangeOutcome::Partial(0, 0)
        );
        assert_eq!(
            evaluate_range(&with("bytes=9-"), 10),
            RangeOutcome::Partial(9, 9)
        );
        assert_eq!(
            evaluate_range(&with("bytes=10-"), 10),
            RangeOutcome::Unsatisfiable
        );
        assert_eq!(
            evaluate_range(&with("bytes=0-1,3-4"), 10),
            RangeOutcome::Unsatisfiable
        );
        assert_eq!(
            evaluate_range(&with("bytes=3-200"), 10),
            RangeOutcome::Partial(3, 9)
        );
        assert_eq!(evaluate_range(&with("bytes=0-"), 0), RangeOutcome::Unsatisfiable);
        assert_eq!(evaluate_range(&with("bytes=-0"), 10), RangeOutcome::Unsatisfiable);
    }
}
