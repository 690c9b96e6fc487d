use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{
    Client,
    header::{CACHE_CONTROL, PRAGMA},
};
use tokio::{fs as tokio_fs, io::AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::{config::UpdaterConfig, error::UpdateError};

/// The package bytes sitting in the scratch slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedArtifact {
    pub path: PathBuf,
    pub byte_length: u64,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Downloads `url` into `dest`, replacing whatever was there.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<DownloadedArtifact, UpdateError>;
}

#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &UpdaterConfig) -> Result<Self, UpdateError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .build()
            .map_err(UpdateError::transport)?;
        Ok(Self { client })
    }

    async fn download_into(
        &self,
        response: reqwest::Response,
        dest: &Path,
    ) -> Result<u64, UpdateError> {
        if let Some(parent) = dest.parent() {
            tokio_fs::create_dir_all(parent)
                .await
                .map_err(UpdateError::transport)?;
        }

        let mut file = tokio_fs::File::create(dest)
            .await
            .map_err(UpdateError::transport)?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(UpdateError::transport)?;
            file.write_all(&chunk)
                .await
                .map_err(UpdateError::transport)?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(UpdateError::transport)?;
        Ok(written)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<DownloadedArtifact, UpdateError> {
        debug!("GET {url}");
        let response = self
            .client
            .get(url)
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .send()
            .await
            .map_err(UpdateError::transport)?;

        let status = response.status();
        if !status.is_success() {
            warn!("Update download refused: HTTP {}", status.as_u16());
            return Err(UpdateError::http_status(status.as_u16()));
        }

        match self.download_into(response, dest).await {
            Ok(byte_length) => {
                info!("Downloaded {byte_length} bytes to {}", dest.display());
                Ok(DownloadedArtifact {
                    path: dest.to_path_buf(),
                    byte_length,
                })
            }
            Err(err) => {
                // A torn download must never be handed to the installer.
                let _ = tokio_fs::remove_file(dest).await;
                Err(err)
            }
        }
    }
}
