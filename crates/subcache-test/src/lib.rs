//! Helpers for testing the sub-request cache against a real HTTP upstream.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Assign it to a variable in the test function
//!    (e.g. `let cache_dir = test::tempdir()`).
//!
//!  - When using [`Upstream`], make sure that the server is held until all requests to it have
//!    been made. If the server is dropped, all connections to it will fail.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{self, OriginalUri, Request};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use reqwest::Url;
use serde_json::{Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// The request id reported by every [`Upstream`] response.
pub const REQUEST_ID: &str = "test-request-id";

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `subcache` crate and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("subcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    /// Serves `router` on an ephemeral port of the loopback interface.
    pub fn with_router(router: Router) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = std::net::TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// An upstream API that counts the requests it receives, per path.
///
/// Routes:
///
/// - `GET /product/:id` responds with a JSON product.
/// - `/counter` responds with `{"count": n}`, the number of times it was requested.
/// - `/graphql` echoes the request body as `{"data": {"echo": body}}`, or responds with a
///   GraphQL error payload (status 200) when the body contains `fail`.
/// - `/respond_statuscode/:num` responds with an empty body and the given status.
/// - `/garbage` responds with an HTML body.
/// - `/binary` responds with bytes that are not valid UTF-8.
/// - `/delay/:millis` waits before responding with `{"delayed": millis}`.
///
/// Every response carries an `x-request-id` header with the value [`REQUEST_ID`].
pub struct Upstream {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl Upstream {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::<String, usize>::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |OriginalUri(uri): OriginalUri, req: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.path().to_owned()).or_default();
                        *hits += 1;
                    }

                    let mut response = next.run(req).await;
                    response
                        .headers_mut()
                        .insert("x-request-id", REQUEST_ID.parse().unwrap());
                    response
                }
            }
        };

        let counter = {
            let hits = hits.clone();
            move || {
                let hits = hits.clone();
                async move {
                    let count = hits.lock().unwrap().get("/counter").copied();
                    Json(json!({ "count": count.unwrap_or_default() }))
                }
            }
        };

        let router = Router::new()
            .route(
                "/product/:id",
                get(|extract::Path(id): extract::Path<u64>| async move {
                    Json(json!({ "id": id, "title": format!("Widget {id}") }))
                }),
            )
            .route("/counter", any(counter))
            .route(
                "/graphql",
                any(|body: String| async move {
                    if body.contains("fail") {
                        Json(json!({ "errors": [{ "message": "throttled" }] }))
                    } else {
                        let echo = serde_json::from_str(&body).unwrap_or(Value::String(body));
                        Json(json!({ "data": { "echo": echo } }))
                    }
                }),
            )
            .route(
                "/respond_statuscode/:num",
                any(|extract::Path(num): extract::Path<u16>| async move {
                    StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                }),
            )
            .route("/garbage", get(|| async { "<html>definitely not json</html>" }))
            .route("/binary", get(binary))
            .route(
                "/delay/:millis",
                get(|extract::Path(millis): extract::Path<u64>| async move {
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    Json(json!({ "delayed": millis }))
                }),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns the number of requests received for `path`.
    pub fn hits(&self, path: &str) -> usize {
        let hits = self.hits.lock().unwrap();
        hits.get(path).copied().unwrap_or_default()
    }

    /// Returns the total number of requests received, and resets all counters.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns all hits per path, and resets all counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for Upstream {
    fn default() -> Self {
        Self::new()
    }
}

async fn binary() -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        "application/octet-stream".parse().unwrap(),
    );
    (headers, vec![0xffu8, 0xfe, 0x00, 0x01]).into_response()
}
