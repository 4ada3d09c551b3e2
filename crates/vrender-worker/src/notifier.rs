//! Webhook notifications for terminal job transitions.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{info, warn};

use vrender_models::encoding::USER_AGENT;
use vrender_models::WebhookPayload;

use crate::error::{WorkerError, WorkerResult};
use crate::metrics;

/// Capability to tell a client that its job finished.
///
/// Delivery is best effort: implementations log and swallow every failure.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, url: &str, payload: &WebhookPayload);
}

/// Single-attempt JSON POST with a bounded timeout.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> WorkerResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| WorkerError::config_error(format!("Failed to build webhook client: {}", e)))?;
        Ok(Self { client })
    }

    /// POST the payload once. Non-2xx responses count as failures.
    pub async fn deliver(&self, url: &str, payload: &WebhookPayload) -> Result<(), reqwest::Error> {
        self.client
            .post(url)
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, url: &str, payload: &WebhookPayload) {
        match self.deliver(url, payload).await {
            Ok(()) => info!(job_id = %payload.job_id(), "Webhook delivered to {}", url),
            Err(e) => {
                metrics::record_webhook_failure();
                warn!(job_id = %payload.job_id(), "Webhook to {} failed: {}", url, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrender_models::{ErrorCode, JobError, JobId};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_posts_payload_with_user_agent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("user-agent", USER_AGENT))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(Duration::from_secs(5)).unwrap();
        let payload = WebhookPayload::completed(&JobId::from_string("j1"), "https://cdn/out.mp4");
        notifier.deliver(&format!("{}/hook", server.uri()), &payload).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"jobId": "j1", "status": "completed", "outputUrl": "https://cdn/out.mp4"})
        );
    }

    #[tokio::test]
    async fn test_server_error_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(Duration::from_secs(5)).unwrap();
        let payload = WebhookPayload::failed(
            &JobId::from_string("j2"),
            JobError::new(ErrorCode::FfmpegError, "boom"),
        );
        let url = format!("{}/hook", server.uri());

        assert!(notifier.deliver(&url, &payload).await.is_err());
        // notify() returns normally regardless
        notifier.notify(&url, &payload).await;
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(Duration::from_millis(200)).unwrap();
        let payload = WebhookPayload::completed(&JobId::from_string("j3"), "u");
        let err = notifier
            .deliver(&format!("{}/hook", server.uri()), &payload)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_swallowed() {
        let notifier = WebhookNotifier::new(Duration::from_millis(500)).unwrap();
        let payload = WebhookPayload::completed(&JobId::from_string("j4"), "u");
        notifier.notify("http://127.0.0.1:1/hook", &payload).await;
    }
}
