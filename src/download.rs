//! One-shot HTTP download used by the `download-file` tool.

use std::path::Path;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("{}", .0.canonical_reason().unwrap_or(.0.as_str()))]
    Status(reqwest::StatusCode),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Streams the body of `url` into `output` and returns the number of bytes
/// written. Nothing is written unless the server answers with a success
/// status, and a partly written file is removed when the transfer breaks.
pub async fn download_file(url: &str, output: &Path) -> Result<u64, DownloadError> {
    info!("Downloading {}", url);
    let mut response = reqwest::get(url).await?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::Status(status));
    }

    let mut file = tokio::fs::File::create(output).await?;
    let written = match write_body(&mut response, &mut file).await {
        Ok(written) => written,
        Err(e) => {
            drop(file);
            if let Err(rm) = tokio::fs::remove_file(output).await {
                warn!("Cannot remove partial download {}: {}", output.display(), rm);
            }
            return Err(e);
        }
    };

    debug!("Wrote {} bytes to {}", written, output.display());
    Ok(written)
}

async fn write_body(
    response: &mut reqwest::Response,
    file: &mut tokio::fs::File,
) -> Result<u64, DownloadError> {
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}
