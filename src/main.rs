//! livecast server binary
//!
//! Wires the hub, the RTMP listener and the HTTP surfaces together from a
//! single config file (`livecast.json`, or the path given as the first
//! argument).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use livecast::channels::{KeyStore, MemoryKeyStore};
use livecast::config::Config;
use livecast::dvr::FlvArchiver;
use livecast::hls::HlsService;
use livecast::httpflv::HttpFlvService;
use livecast::hub::StreamHub;
use livecast::relay::StaticPushManager;
use livecast::server::RtmpServer;
use livecast::session::Services;

#[tokio::main]
async fn main() -> livecast::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config();
    tracing::info!(
        rtmp = %config.rtmp_addr,
        hls = %config.hls_addr,
        httpflv = %config.httpflv_addr,
        noauth = config.rtmp_noauth,
        "starting livecast"
    );

    let config = Arc::new(config);
    let cancel = CancellationToken::new();

    let hub = if config.static_push.is_empty() {
        StreamHub::new(config.hub_config())
    } else {
        StreamHub::with_relay(config.hub_config(), StaticPushManager::new(config.clone()))
    };
    let _hub_sweeper = hub.spawn_sweeper(cancel.clone());

    let hls = HlsService::new(hub.clone(), config.hls_keep_after_end);
    let _hls_sweeper = hls.spawn_sweeper(cancel.clone());

    let archiver = config
        .flv_archive
        .then(|| Arc::new(FlvArchiver::new(config.flv_dir.clone())));

    let keystore = Arc::new(MemoryKeyStore::new());
    if !config.rtmp_noauth {
        // Surface a first channel key so a fresh install can publish.
        let key = keystore.get_key("movie");
        tracing::info!(channel = "movie", %key, "channel key");
    }

    let services = Arc::new(Services {
        hub: hub.clone(),
        keystore,
        hls: Some(hls.clone()),
        archiver,
        config: config.clone(),
    });

    // HLS surface.
    let hls_router = hls.router();
    let hls_addr = config.hls_addr;
    let hls_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(hls_addr).await {
            Ok(listener) => {
                tracing::info!(addr = %hls_addr, "hls listening");
                let _ = axum::serve(listener, hls_router)
                    .with_graceful_shutdown(async move { hls_cancel.cancelled().await })
                    .await;
            }
            Err(e) => tracing::error!(error = %e, "hls bind failed"),
        }
    });

    // HTTP-FLV surface.
    let flv_router = HttpFlvService::new(hub.clone()).router();
    let flv_addr = config.httpflv_addr;
    let flv_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(flv_addr).await {
            Ok(listener) => {
                tracing::info!(addr = %flv_addr, "http-flv listening");
                let _ = axum::serve(listener, flv_router)
                    .with_graceful_shutdown(async move { flv_cancel.cancelled().await })
                    .await;
            }
            Err(e) => tracing::error!(error = %e, "http-flv bind failed"),
        }
    });

    // RTMP front end, foreground.
    let server = RtmpServer::new(services);
    let rtmp_cancel = cancel.clone();
    let result = tokio::select! {
        r = server.run(rtmp_cancel) => r,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            Ok(())
        }
    };

    cancel.cancel();
    result
}

fn load_config() -> Config {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "livecast.json".to_string());

    match Config::from_file(&path) {
        Ok(config) => {
            tracing::info!(%path, "config loaded");
            config
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => {
            tracing::warn!(%path, error = %e, "config unreadable, using defaults");
            Config::default()
        }
    }
}
