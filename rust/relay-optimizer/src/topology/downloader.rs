//! File downloads for topology documents

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::TopologyError;

/// Fetches a URL into a local file
#[async_trait]
pub trait Download: Send + Sync {
    async fn download(&self, destination: &Path, url: &str) -> Result<(), TopologyError>;
}

/// HTTP(S) downloader
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Result<Self, TopologyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TopologyError::Download {
                url: String::new(),
                reason: format!("HTTP client error: {}", e),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Download for HttpDownloader {
    async fn download(&self, destination: &Path, url: &str) -> Result<(), TopologyError> {
        let download_err = |reason: String| TopologyError::Download {
            url: url.to_string(),
            reason,
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| download_err(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(TopologyError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(destination).await?;
        let mut written = 0usize;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| download_err(format!("Read body failed: {}", e)))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len();
        }
        file.flush().await?;

        debug!("downloaded {} bytes from {} to {:?}", written, url, destination);
        Ok(())
    }
}

/// Download with a fixed number of attempts and a fixed pause between them
pub async fn download_with_retry(
    downloader: &dyn Download,
    destination: &Path,
    url: &str,
    attempts: u32,
    pause: Duration,
) -> Result<(), TopologyError> {
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match downloader.download(destination, url).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("download {} failed (attempt {}/{}): {}", url, attempt, attempts, e);
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    Err(TopologyError::RetriesExhausted {
        url: url.to_string(),
        attempts,
        last: last_error.map(|e| e.to_string()).unwrap_or_default(),
    })
}
