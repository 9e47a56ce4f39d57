use std::future::Future;
use std::time;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header;
use stream_common::stream::Payload;
use tracing::info;

/// Processes the payload of one stream message.
///
/// Returning `Ok` lets the message be acknowledged; returning `Err` leaves it pending
/// in the consumer group so it can be replayed later.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, payload: Payload) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, payload: Payload) -> anyhow::Result<()> {
        (self)(payload).await
    }
}

/// Logs every payload and succeeds.
pub struct LogHandler;

#[async_trait]
impl Handler for LogHandler {
    async fn handle(&self, payload: Payload) -> anyhow::Result<()> {
        info!(payload = ?payload, "handled message");
        Ok(())
    }
}

/// POSTs every payload as a JSON object to a fixed URL.
/// Any transport error or non-2XX response is a failure, so the message stays pending.
pub struct WebhookHandler {
    client: reqwest::Client,
    url: url::Url,
}

impl WebhookHandler {
    pub fn new(url: url::Url, request_timeout: time::Duration) -> anyhow::Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Stream Worker")
            .timeout(request_timeout)
            .build()
            .context("failed to construct reqwest client for webhook handler")?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl Handler for WebhookHandler {
    async fn handle(&self, payload: Payload) -> anyhow::Result<()> {
        let body = serde_json::to_string(&payload)?;

        self.client
            .post(self.url.clone())
            .body(body)
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.url))?
            .error_for_status()
            .with_context(|| format!("{} rejected the message", self.url))?;

        Ok(())
    }
}
