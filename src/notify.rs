use crate::error::NotifyError;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl Notification {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image_url: None,
        }
    }

    pub fn with_image(mut self, url: Option<String>) -> Self {
        self.image_url = url;
        self
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &Notification) -> Result<(), NotifyError>;
}

/// 尽力投递, 失败只记日志
pub async fn notify_best_effort(notifier: &dyn Notifier, message: Notification) {
    if let Err(e) = notifier.notify(&message).await {
        warn!("Notification dropped ({}): {}", e, message.text);
    }
}

/// 以 JSON `{text, image_url}` POST 到 webhook
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &Notification) -> Result<(), NotifyError> {
        let resp = self.client.post(&self.url).json(message).send().await?;
        if !resp.status().is_success() {
            return Err(NotifyError::Rejected(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// 未配置 webhook 时只写日志
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &Notification) -> Result<(), NotifyError> {
        match &message.image_url {
            Some(img) => info!("[notify] {} ({})", message.text, img),
            None => info!("[notify] {}", message.text),
        }
        Ok(())
    }
}
