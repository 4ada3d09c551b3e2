//! Asset fetching into a job workspace.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use vrender_models::encoding::USER_AGENT;

use crate::error::{MediaError, MediaResult};

/// Capability to materialize a remote asset as a local file.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Download `url` into `dest`, returning the number of bytes written.
    async fn fetch(&self, url: &str, dest: &Path) -> MediaResult<u64>;
}

/// HTTP(S) fetcher with a per-asset timeout covering connect and body.
#[derive(Debug, Clone)]
pub struct HttpAssetFetcher {
    client: Client,
}

impl HttpAssetFetcher {
    pub fn new(timeout: Duration) -> MediaResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| MediaError::internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> MediaResult<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| MediaError::download_failed(url, describe(&e)))?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| MediaError::download_failed(url, format!("Failed to create file: {}", e)))?;

        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| MediaError::download_failed(url, describe(&e)))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| MediaError::download_failed(url, format!("Failed to write file: {}", e)))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| MediaError::download_failed(url, format!("Failed to write file: {}", e)))?;

        debug!("Fetched {} ({} bytes) to {}", url, written, dest.display());
        Ok(written)
    }
}

fn describe(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "request timed out".to_string()
    } else if let Some(status) = e.status() {
        format!("HTTP {}", status)
    } else {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_writes_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.jpg"))
            .and(header("user-agent", USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3, 4]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("clip_0.jpg");
        let fetcher = HttpAssetFetcher::new(Duration::from_secs(5)).unwrap();

        let n = fetcher
            .fetch(&format!("{}/a.jpg", server.uri()), &dest)
            .await
            .unwrap();

        assert_eq!(n, 4);
        assert_eq!(std::fs::read(&dest).unwrap(), vec![1u8, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_fetch_http_error_is_download_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpAssetFetcher::new(Duration::from_secs(5)).unwrap();
        let url = format!("{}/missing.png", server.uri());

        let err = fetcher.fetch(&url, &dir.path().join("x.png")).await.unwrap_err();
        assert!(matches!(err, MediaError::DownloadFailed { .. }));
        assert_eq!(err.url(), Some(url.as_str()));
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_fetch_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpAssetFetcher::new(Duration::from_millis(200)).unwrap();

        let err = fetcher
            .fetch(&format!("{}/slow.jpg", server.uri()), &dir.path().join("slow.jpg"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
