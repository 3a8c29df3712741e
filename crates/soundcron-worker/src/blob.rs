use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("blob endpoint returned {status} for {url}")]
    Status { status: u16, url: String },
}

/// Where encoded audio payloads come from, keyed by SoundCron ID.
#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn fetch(&self, soundcron_id: &str) -> Result<Bytes, FetchError>;
}

/// `GET {base_url}/{soundcron_id}` against an object store or CDN.
pub struct HttpBlobSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBlobSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, soundcron_id: &str) -> String {
        format!("{}/{}", self.base_url, soundcron_id)
    }
}

#[async_trait]
impl BlobSource for HttpBlobSource {
    async fn fetch(&self, soundcron_id: &str) -> Result<Bytes, FetchError> {
        let url = self.url_for(soundcron_id);
        debug!(%url, "fetching audio payload");
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status {
                status: resp.status().as_u16(),
                url,
            });
        }
        let body = resp.bytes().await?;
        debug!(soundcron_id, bytes = body.len(), "audio payload fetched");
        Ok(body)
    }
}
