//! RTMP listener
//!
//! Accept loop spawning one session task per connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::session::{ServerSession, Services};

/// The RTMP ingest/egress server
pub struct RtmpServer {
    services: Arc<Services>,
    next_session_id: AtomicU64,
}

impl RtmpServer {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Accept connections until cancelled
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let addr = self.services.config.rtmp_addr;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "rtmp listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("rtmp listener shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => self.spawn_session(socket, peer.to_string()),
                        Err(e) => {
                            tracing::error!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }
    }

    fn spawn_session(&self, socket: TcpStream, peer: String) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!(error = %e, "set_nodelay failed");
        }

        tracing::info!(session_id, peer = %peer, "connection accepted");
        let session = ServerSession::new(socket, self.services.clone(), session_id, peer.clone());

        tokio::spawn(async move {
            match session.run().await {
                Ok(()) => tracing::info!(session_id, peer = %peer, "session ended"),
                Err(e) => tracing::info!(session_id, peer = %peer, error = %e, "session closed"),
            }
        });
    }
}
