//! File sink: save download bodies into a directory

use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::TransferError;
use crate::pipe::{DownloadBody, DownloadHub};

/// Reduce a suggested file name to a bare, non-hidden file name.
pub fn sanitize_file_name(name: &str, fallback: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .trim_start_matches('.');
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && *c != '"')
        .collect();
    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned
    }
}

/// Write one body to `dir`. The file appears under its final name only once
/// the body ended cleanly; an aborted body leaves nothing behind.
pub async fn save_download(body: DownloadBody, dir: &Path) -> Result<PathBuf, TransferError> {
    let name = sanitize_file_name(body.file_name(), "download.bin");
    let target = dir.join(&name);
    let partial = dir.join(format!(".{name}.part"));

    let mut file = tokio::fs::File::create(&partial).await?;
    let mut stream = Box::pin(body.into_stream());
    let mut written = 0u64;

    while let Some(item) = stream.next().await {
        match item {
            Ok(bytes) => {
                if let Err(e) = file.write_all(&bytes).await {
                    drop(file);
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(e.into());
                }
                written += bytes.len() as u64;
            }
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&partial).await;
                warn!(file = %name, error = %e, "download aborted, partial output removed");
                return Err(TransferError::Io(e.to_string()));
            }
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&partial, &target).await?;
    debug!(file = %target.display(), bytes = written, "download saved");
    Ok(target)
}

/// Save every download the hub hands out until `limit` bodies were handled.
/// Returns one result per body, in order.
pub async fn save_downloads(
    hub: DownloadHub,
    dir: PathBuf,
    limit: usize,
) -> Vec<Result<PathBuf, TransferError>> {
    let mut results = Vec::with_capacity(limit);
    for _ in 0..limit {
        let body = hub.next_download().await;
        results.push(save_download(body, &dir).await);
    }
    results
}
