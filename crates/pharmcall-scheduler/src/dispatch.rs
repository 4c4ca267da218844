use std::time::Duration;

use async_trait::async_trait;
use pharmcall_core::{PharmacyId, SearchId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Payload of one delivery. The attempt number lets stale deliveries be
/// recognised and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTask {
    pub search_id: SearchId,
    pub pharmacy_id: PharmacyId,
    pub attempt: u32,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Unexpected response: {0}")]
    Parse(String),

    /// The local delivery channel has no receiver any more.
    #[error("Dispatcher closed")]
    Closed,

    #[error("Dispatcher misconfigured: {0}")]
    Config(String),
}

/// Durable "deliver this task after N seconds" service.
///
/// Delivery is at-least-once; receivers must tolerate duplicates.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    fn name(&self) -> &str;

    /// Schedule `task` for delivery `delay_secs` from now. Returns the
    /// dispatcher's message id.
    async fn schedule(&self, task: &JobTask, delay_secs: u64) -> Result<String, DispatchError>;
}

/// Upstash QStash: publishes the task to be POSTed back to `callback_url`.
///
/// QStash only forwards headers carrying the `Upstash-Forward-` prefix, so the
/// callback bearer travels as `Upstash-Forward-Authorization`.
pub struct QStashDispatcher {
    client: reqwest::Client,
    base_url: String,
    token: String,
    callback_url: String,
    forward_auth: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    message_id: String,
}

impl QStashDispatcher {
    pub fn new(base_url: String, token: String, callback_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            callback_url,
            forward_auth: None,
        }
    }

    /// Bearer token QStash should present when it calls back.
    pub fn with_forward_auth(mut self, token: impl Into<String>) -> Self {
        self.forward_auth = Some(token.into());
        self
    }

    fn publish_url(&self) -> String {
        format!("{}/v2/publish/{}", self.base_url, self.callback_url)
    }

    fn publish_request(&self, task: &JobTask, delay_secs: u64) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(self.publish_url())
            .header("Authorization", format!("Bearer {}", self.token))
            .header("content-type", "application/json")
            .json(task);
        if delay_secs > 0 {
            builder = builder.header("Upstash-Delay", format!("{delay_secs}s"));
        }
        if let Some(token) = &self.forward_auth {
            builder = builder.header("Upstash-Forward-Authorization", format!("Bearer {token}"));
        }
        builder
    }
}

#[async_trait]
impl TaskDispatcher for QStashDispatcher {
    fn name(&self) -> &str {
        "qstash"
    }

    async fn schedule(&self, task: &JobTask, delay_secs: u64) -> Result<String, DispatchError> {
        debug!(search_id = %task.search_id, pharmacy_id = %task.pharmacy_id, attempt = task.attempt, delay_secs, "publishing to QStash");
        let resp = self.publish_request(task, delay_secs).send().await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "QStash publish failed");
            return Err(DispatchError::Api {
                status,
                message: text,
            });
        }

        let body: PublishResponse = resp
            .json()
            .await
            .map_err(|e| DispatchError::Parse(e.to_string()))?;
        Ok(body.message_id)
    }
}

/// In-process dispatcher: sleeps on a tokio task, then pushes the job onto an
/// mpsc channel drained by the gateway. Not durable across restarts.
pub struct LocalDispatcher {
    tx: mpsc::Sender<JobTask>,
}

impl LocalDispatcher {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<JobTask>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskDispatcher for LocalDispatcher {
    fn name(&self) -> &str {
        "local"
    }

    async fn schedule(&self, task: &JobTask, delay_secs: u64) -> Result<String, DispatchError> {
        if self.tx.is_closed() {
            return Err(DispatchError::Closed);
        }
        let id = format!("local-{}", Uuid::new_v4());
        let tx = self.tx.clone();
        let task = task.clone();
        let message_id = id.clone();
        tokio::spawn(async move {
            if delay_secs > 0 {
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            }
            if tx.send(task).await.is_err() {
                warn!(%message_id, "local delivery dropped: receiver gone");
            }
        });
        Ok(id)
    }
}
