//! S3 client implementation.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use vrender_models::encoding::{OUTPUT_BUCKET, SIGNED_URL_TTL_SECS};

use crate::error::{StorageError, StorageResult};

/// Capability to persist rendered artifacts and hand out links to them.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file under `key`, replacing any existing object.
    async fn upload_file(&self, path: &Path, key: &str, content_type: &str) -> StorageResult<()>;

    /// Time-limited GET URL for `key`.
    async fn signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String>;
}

/// Configuration for the S3 client.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 API endpoint (MinIO in development)
    pub endpoint_url: String,
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Bucket name
    pub bucket_name: String,
    /// Region
    pub region: String,
    /// Lifetime of presigned URLs
    pub signed_url_ttl: Duration,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint_url: "http://localhost:9000".to_string(),
            access_key_id: "minioadmin".to_string(),
            secret_access_key: "minioadmin".to_string(),
            bucket_name: OUTPUT_BUCKET.to_string(),
            region: "us-east-1".to_string(),
            signed_url_ttl: Duration::from_secs(SIGNED_URL_TTL_SECS),
        }
    }
}

impl S3Config {
    /// Create config from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        let defaults = Self::default();
        let config = Self {
            endpoint_url: std::env::var("S3_ENDPOINT").unwrap_or(defaults.endpoint_url),
            access_key_id: std::env::var("S3_ACCESS_KEY").unwrap_or(defaults.access_key_id),
            secret_access_key: std::env::var("S3_SECRET_KEY").unwrap_or(defaults.secret_access_key),
            bucket_name: std::env::var("S3_BUCKET").unwrap_or(defaults.bucket_name),
            region: std::env::var("S3_REGION").unwrap_or(defaults.region),
            signed_url_ttl: std::env::var("S3_SIGNED_URL_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.signed_url_ttl),
        };

        if config.bucket_name.is_empty() {
            return Err(StorageError::config_error("S3_BUCKET is empty"));
        }
        Ok(config)
    }
}

/// S3 (or MinIO) backed output store.
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
    endpoint_url: String,
    signed_url_ttl: Duration,
    bucket_ready: std::sync::Arc<OnceCell<()>>,
}

impl S3Store {
    /// Create a new client from configuration. Makes no network calls.
    pub fn new(config: S3Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "vrender",
        );

        let sdk_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(sdk_config),
            bucket: config.bucket_name,
            endpoint_url: config.endpoint_url.trim_end_matches('/').to_string(),
            signed_url_ttl: config.signed_url_ttl,
            bucket_ready: std::sync::Arc::new(OnceCell::new()),
        }
    }

    /// Create from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self::new(S3Config::from_env()?))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Configured presigned URL lifetime.
    pub fn signed_url_ttl(&self) -> Duration {
        self.signed_url_ttl
    }

    /// Make sure the bucket exists, creating it if HEAD reports it missing.
    ///
    /// Runs at most once successfully per store; failures are retried on the
    /// next call.
    pub async fn ensure_bucket(&self) -> StorageResult<()> {
        self.bucket_ready
            .get_or_try_init(|| async {
                match self.client.head_bucket().bucket(&self.bucket).send().await {
                    Ok(_) => {
                        debug!("Bucket {} exists", self.bucket);
                        Ok(())
                    }
                    Err(e)
                        if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false)
                            || e.raw_response().map(|r| r.status().as_u16() == 404).unwrap_or(false) =>
                    {
                        self.client
                            .create_bucket()
                            .bucket(&self.bucket)
                            .send()
                            .await
                            .map_err(|e| StorageError::bucket_failed(e.to_string()))?;
                        info!("Created bucket: {}", self.bucket);
                        Ok(())
                    }
                    Err(e) => Err(StorageError::bucket_failed(e.to_string())),
                }
            })
            .await
            .map(|_| ())
    }

    /// Plain object URL, only useful when the bucket allows anonymous reads.
    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint_url, self.bucket, key)
    }

    /// Check connectivity by performing a head bucket operation.
    pub async fn check_connectivity(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StorageError::AwsSdk(format!("S3 connectivity check failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn upload_file(&self, path: &Path, key: &str, content_type: &str) -> StorageResult<()> {
        self.ensure_bucket().await?;
        debug!("Uploading {} to {}", path.display(), key);

        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        info!("Uploaded {} to {}", path.display(), key);
        Ok(())
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        let presign_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StorageError::presign_failed(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presign_config)
            .await
            .map_err(|e| StorageError::presign_failed(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrender_models::encoding::{output_key, OUTPUT_CONTENT_TYPE};

    fn store() -> S3Store {
        S3Store::new(S3Config {
            endpoint_url: "http://localhost:9000/".to_string(),
            ..S3Config::default()
        })
    }

    #[test]
    fn test_public_url_is_path_style() {
        assert_eq!(
            store().public_url("outputs/abc.mp4"),
            "http://localhost:9000/video-outputs/outputs/abc.mp4"
        );
    }

    #[tokio::test]
    async fn test_signed_url_is_computed_locally() {
        let url = store()
            .signed_url("outputs/abc.mp4", Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(url.starts_with("http://localhost:9000/video-outputs/outputs/abc.mp4?"));
        assert!(url.contains("X-Amz-Expires=3600"));
        assert!(url.contains("X-Amz-Signature="));
    }

    #[tokio::test]
    async fn test_signed_url_rejects_excessive_ttl() {
        let err = store()
            .signed_url("outputs/abc.mp4", Duration::from_secs(8 * 24 * 3600))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PresignFailed(_)));
    }

    #[tokio::test]
    #[ignore = "requires S3/MinIO"]
    async fn test_upload_to_minio() {
        let store = S3Store::from_env().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.mp4");
        tokio::fs::write(&path, b"not really a video").await.unwrap();

        let key = output_key("integration-test");
        store.upload_file(&path, &key, OUTPUT_CONTENT_TYPE).await.unwrap();
        // Second upload to the same key overwrites
        store.upload_file(&path, &key, OUTPUT_CONTENT_TYPE).await.unwrap();

        let url = store.signed_url(&key, store.signed_url_ttl()).await.unwrap();
        assert!(url.contains(&key));
    }
}
