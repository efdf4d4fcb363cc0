//! Opens a streaming GET against an upstream artifact URL and exposes the
//! response body as a `tokio::io::AsyncRead` via the `into_async_read()` +
//! `compat()` adapter chain.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use index_cache::{ArtifactSource, CoreError, Result};
use reqwest::{header, StatusCode};
use tokio_util::compat::FuturesAsyncReadCompatExt;

pub struct HttpArtifactFetcher {
    client: reqwest::Client,
    download_timeout: Duration,
}

impl HttpArtifactFetcher {
    pub fn new(client: reqwest::Client, download_timeout: Duration) -> Self {
        Self {
            client,
            download_timeout,
        }
    }
}

#[async_trait]
impl index_cache::ArtifactFetcher for HttpArtifactFetcher {
    async fn fetch(&self, url: &str) -> Result<ArtifactSource> {
        let response = self
            .client
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .await
            .map_err(|e| CoreError::UpstreamUnavailable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CoreError::NotFound);
        }
        if status.is_server_error() {
            return Err(CoreError::UpstreamUnavailable(format!(
                "upstream returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(CoreError::UpstreamProtocol(format!(
                "upstream returned {status}"
            )));
        }

        let content_length = response.content_length();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let byte_stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let reader = byte_stream.into_async_read().compat();

        Ok(ArtifactSource {
            reader: Box::new(reader),
            content_length,
            content_type,
        })
    }
}
