//! The edge gateway: reverse proxy from the outside world onto the mesh.
//!
//! Requests arrive as `/{app}/rest...`; the edge snapshots the fabric's
//! endpoint list for the app, picks one round-robin, and forwards the
//! request. No endpoint means `503 Service Unavailable`. Per-app request
//! and error counters are kept and logged on an interval.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use chrono::Utc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fabric::{Endpoint, Fabric};

/// Largest request body the edge will buffer for forwarding.
const MAX_FORWARD_BODY: usize = 2 * 1024 * 1024;

/// Interval at which per-app traffic counters are logged.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Response header stamped onto every proxied reply.
const EDGE_HEADER: &str = "x-sporemesh-edge";

/// Errors raised by the edge server.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EdgeError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The requested address.
        addr: SocketAddr,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Serving failed after startup.
    #[error("edge server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-app traffic counters.
#[derive(Debug, Default)]
pub struct AppStats {
    /// Requests forwarded (or attempted) for the app.
    pub requests: AtomicU64,
    /// Requests that could not be served (no endpoint, upstream failure).
    pub errors: AtomicU64,
}

/// Reverse-proxy gateway over the fabric's endpoint registry.
pub struct Edge {
    fabric: Arc<Fabric>,
    client: reqwest::Client,
    cursor: AtomicUsize,
    stats: RwLock<HashMap<String, Arc<AppStats>>>,
}

impl Edge {
    /// Creates an edge over the given fabric.
    #[must_use]
    pub fn new(fabric: Arc<Fabric>) -> Self {
        Self {
            fabric,
            client: reqwest::Client::new(),
            cursor: AtomicUsize::new(0),
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Picks an endpoint for `app` round-robin from the current snapshot,
    /// or `None` when the app has no live endpoint.
    #[must_use]
    pub fn select(&self, app: &str) -> Option<Endpoint> {
        let endpoints = self.fabric.endpoints(app);
        if endpoints.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        Some(endpoints[index].clone())
    }

    /// Returns `(requests, errors)` counted for an app so far.
    ///
    /// # Panics
    ///
    /// Panics if the stats lock is poisoned (a thread panicked).
    #[must_use]
    pub fn stats(&self, app: &str) -> (u64, u64) {
        let stats = self.stats.read().expect("lock poisoned");
        stats.get(app).map_or((0, 0), |s| {
            (
                s.requests.load(Ordering::Relaxed),
                s.errors.load(Ordering::Relaxed),
            )
        })
    }

    fn stats_for(&self, app: &str) -> Arc<AppStats> {
        {
            let stats = self.stats.read().expect("lock poisoned");
            if let Some(existing) = stats.get(app) {
                return Arc::clone(existing);
            }
        }
        let mut stats = self.stats.write().expect("lock poisoned");
        Arc::clone(stats.entry(app.to_string()).or_default())
    }

    /// Binds `addr` and serves until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`EdgeError::Bind`] if the address cannot be bound, or an
    /// I/O error from the server loop.
    pub async fn serve(
        self: Arc<Self>,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(), EdgeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| EdgeError::Bind { addr, source })?;
        self.serve_with(listener, cancel).await
    }

    /// Serves on an already-bound listener until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the server loop.
    pub async fn serve_with(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), EdgeError> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "edge gateway listening");
        }

        let stats_task = tokio::spawn(log_stats(Arc::clone(&self), cancel.clone()));

        let router: Router = Router::new()
            .fallback(forward)
            .with_state(Arc::clone(&self));
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await;

        stats_task.abort();
        result.map_err(EdgeError::Io)
    }
}

/// Splits `/app/rest...` into the app name and the path forwarded upstream.
fn split_app_path(path: &str) -> Option<(&str, String)> {
    let trimmed = path.strip_prefix('/')?;
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.split_once('/') {
        Some((app, rest)) if !app.is_empty() => Some((app, format!("/{rest}"))),
        Some(_) => None,
        None => Some((trimmed, "/".to_string())),
    }
}

async fn forward(State(edge): State<Arc<Edge>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let Some((app, rest)) = split_app_path(&path) else {
        return plain_response(StatusCode::BAD_REQUEST, "missing app segment in path");
    };

    let stats = edge.stats_for(app);
    let Some(endpoint) = edge.select(app) else {
        stats.errors.fetch_add(1, Ordering::Relaxed);
        return plain_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("no endpoints available for app {app}"),
        );
    };
    stats.requests.fetch_add(1, Ordering::Relaxed);

    let mut target = format!("{}{rest}", endpoint.url);
    if let Some(query) = request.uri().query() {
        target.push('?');
        target.push_str(query);
    }

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_FORWARD_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            return plain_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
    };

    let mut headers = parts.headers;
    // The client recomputes host and content-length for the upstream hop.
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    match edge
        .client
        .request(parts.method, &target)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(upstream) => {
            let status = upstream.status();
            let mut headers = upstream.headers().clone();
            // The reply is re-framed from a buffered body.
            headers.remove(header::TRANSFER_ENCODING);
            headers.remove(header::CONTENT_LENGTH);
            let bytes = upstream.bytes().await.unwrap_or_default();

            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            if let Ok(stamp) = HeaderValue::from_str(&Utc::now().to_rfc3339()) {
                response.headers_mut().insert(EDGE_HEADER, stamp);
            }
            response
        }
        Err(error) => {
            debug!(%target, %error, "upstream request failed");
            stats.errors.fetch_add(1, Ordering::Relaxed);
            plain_response(StatusCode::BAD_GATEWAY, format!("upstream failed: {error}"))
        }
    }
}

fn plain_response(status: StatusCode, message: impl Into<String>) -> Response {
    let mut response = Response::new(Body::from(message.into()));
    *response.status_mut() = status;
    response
}

async fn log_stats(edge: Arc<Edge>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(STATS_LOG_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let snapshot: Vec<(String, u64, u64)> = {
            let stats = edge.stats.read().expect("lock poisoned");
            stats
                .iter()
                .map(|(app, s)| {
                    (
                        app.clone(),
                        s.requests.load(Ordering::Relaxed),
                        s.errors.load(Ordering::Relaxed),
                    )
                })
                .collect()
        };
        for (app, requests, errors) in snapshot {
            if errors > 0 {
                warn!(%app, requests, errors, "edge traffic");
            } else {
                info!(%app, requests, errors, "edge traffic");
            }
        }
    }
}
