//! HLS retrieval surface
//!
//! Keeps the per-stream sources and serves their playlists and segments
//! over HTTP:
//!
//! ```text
//! GET /<app>/<name>.m3u8          application/vnd.apple.mpegurl
//! GET /<app>/<name>/<segment>.ts  video/mp2ts
//! GET /crossdomain.xml            Flash cross-origin policy
//! ```
//!
//! Unknown keys answer 403 "no publisher". A source is created on demand
//! when a playlist is requested for a key that is actively publishing.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Method, Response, StatusCode, Uri};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::hls::source::HlsSource;
use crate::hub::store::{StreamHub, SWEEP_INTERVAL};

const CROSSDOMAIN_XML: &str = r#"<?xml version="1.0" ?>
<cross-domain-policy>
	<allow-access-from domain="*" />
	<allow-http-request-headers-from domain="*" headers="*"/>
</cross-domain-policy>"#;

/// HLS source registry + HTTP handlers
pub struct HlsService {
    sources: DashMap<String, Arc<HlsSource>>,
    hub: Arc<StreamHub>,
    /// Keep sources (and their cached segments) after the publisher stops
    keep_after_end: bool,
}

impl HlsService {
    pub fn new(hub: Arc<StreamHub>, keep_after_end: bool) -> Arc<Self> {
        Arc::new(Self {
            sources: DashMap::new(),
            hub,
            keep_after_end,
        })
    }

    /// Source for `key`, creating one and attaching it to the hub when
    /// absent. Called on publish and on first playlist request.
    pub fn attach(&self, key: &str) -> Arc<HlsSource> {
        if let Some(existing) = self.sources.get(key) {
            if !existing.is_closed() {
                return existing.clone();
            }
        }

        tracing::info!(stream = %key, "new hls source");
        let source = HlsSource::spawn(key, self.write_timeout());
        self.hub.handle_writer(source.writer());
        self.sources.insert(key.to_string(), source.clone());
        source
    }

    pub fn source(&self, key: &str) -> Option<Arc<HlsSource>> {
        self.sources.get(key).map(|s| s.value().clone())
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    fn write_timeout(&self) -> Duration {
        self.hub.write_timeout()
    }

    /// Drop dead sources every sweep period unless configured to keep them
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => service.sweep(),
                }
            }
        })
    }

    fn sweep(&self) {
        if self.keep_after_end {
            return;
        }
        let dead: Vec<String> = self
            .sources
            .iter()
            .filter(|s| !s.alive())
            .map(|s| s.key().clone())
            .collect();
        for key in dead {
            tracing::info!(stream = %key, "hls source removed");
            self.sources.remove(&key);
        }
    }

    /// Router serving the HLS surface
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/crossdomain.xml", get(crossdomain))
            .fallback(get(handle))
            .layer(
                CorsLayer::new()
                    .allow_methods([Method::GET])
                    .allow_origin(Any),
            )
            .with_state(self.clone())
    }
}

async fn crossdomain() -> Response<Body> {
    Response::builder()
        .header(header::CONTENT_TYPE, "application/xml")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::from(CROSSDOMAIN_XML))
        .unwrap()
}

async fn handle(State(service): State<Arc<HlsService>>, uri: Uri) -> Response<Body> {
    let path = uri.path();

    if let Some(key) = path.strip_suffix(".m3u8").map(|p| p.trim_start_matches('/')) {
        return playlist(&service, key).await;
    }
    if path.ends_with(".ts") {
        return segment(&service, path).await;
    }

    status(StatusCode::NOT_FOUND, "not found")
}

async fn playlist(service: &HlsService, key: &str) -> Response<Body> {
    let source = match service.source(key) {
        Some(s) => s,
        None if service.hub.is_publishing(key) => service.attach(key),
        None => return status(StatusCode::FORBIDDEN, "no publisher"),
    };

    let body = source.playlist().await;
    Response::builder()
        .header(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap()
}

async fn segment(service: &HlsService, path: &str) -> Response<Body> {
    // `/<app>/<name>/<segment>.ts`: the key is the first two components.
    let trimmed = path.trim_start_matches('/');
    let parts: Vec<&str> = trimmed.splitn(3, '/').collect();
    if parts.len() != 3 {
        return status(StatusCode::BAD_REQUEST, "invalid path");
    }
    let key = format!("{}/{}", parts[0], parts[1]);

    let source = match service.source(&key) {
        Some(s) => s,
        None => return status(StatusCode::FORBIDDEN, "no publisher"),
    };

    match source.segment(path).await {
        Some(item) => Response::builder()
            .header(header::CONTENT_TYPE, "video/mp2ts")
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .header(header::CONTENT_LENGTH, item.data.len())
            .body(Body::from(item.data))
            .unwrap(),
        None => status(StatusCode::BAD_REQUEST, "no such segment"),
    }
}

fn status(code: StatusCode, msg: &'static str) -> Response<Body> {
    Response::builder()
        .status(code)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::from(msg))
        .unwrap()
}
