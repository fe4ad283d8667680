//! FLV archival
//!
//! Records publish sessions to disk as FLV files. The archiver is a plain
//! hub writer, so it shares the drop policy and lifecycle of every other
//! subscriber; files land under `<flv_dir>/<app>/<name>_<unix>.flv`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::httpflv::{reform_for_delivery, FlvMuxer};
use crate::hub::entry::StreamWriter;
use crate::hub::packet::StreamInfo;
use crate::hub::store::StreamHub;

/// Writes one publish session to an FLV file
pub struct FlvArchiver {
    dir: PathBuf,
}

impl FlvArchiver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Attach an archival writer for `key` (`app/name`) to the hub.
    /// Returns the target path, or `None` when the key is malformed.
    pub async fn attach(
        &self,
        hub: &Arc<StreamHub>,
        key: &str,
        timeout: Duration,
    ) -> Option<PathBuf> {
        let (app, name) = key.split_once('/')?;

        let dir = self.dir.join(app);
        if let Err(e) = fs::create_dir_all(&dir).await {
            tracing::error!(error = %e, dir = %dir.display(), "cannot create archive dir");
            return None;
        }

        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let path = dir.join(format!("{name}_{unix}.flv"));

        let file = match fs::File::create(&path).await {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(error = %e, path = %path.display(), "cannot create archive file");
                return None;
            }
        };

        let info = StreamInfo::new(key, "", nanoid::nanoid!(12)).internal();
        let writer = StreamWriter::new(info, timeout);
        hub.handle_writer(writer.clone());

        tracing::info!(stream = %key, path = %path.display(), "flv archive started");
        tokio::spawn(record(writer, file, key.to_string()));
        Some(path)
    }
}

async fn record(writer: Arc<StreamWriter>, mut file: fs::File, key: String) {
    if let Err(e) = file.write_all(&FlvMuxer::file_header()).await {
        tracing::error!(stream = %key, error = %e, "archive header write failed");
        writer.close();
        return;
    }

    while let Some(packet) = writer.recv().await {
        let packet = reform_for_delivery(&packet);
        let mut buf = BytesMut::new();
        FlvMuxer::encode_tag(&packet, &mut buf);
        if let Err(e) = file.write_all(&buf).await {
            tracing::error!(stream = %key, error = %e, "archive write failed");
            break;
        }
        writer.liveness.touch();
    }

    let _ = file.flush().await;
    writer.close();
    tracing::info!(stream = %key, "flv archive closed");
}
