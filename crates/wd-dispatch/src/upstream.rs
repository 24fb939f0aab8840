//! Upstream clients: the send queue, the instance-status list and the
//! confirmation endpoint.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};
use wd_common::{
    ConfirmationRequest, InstanceDescriptor, MessageDescriptor, MessageId, QueuedMessage,
    ValidationError,
};

use crate::error::UpstreamError;

/// Validated content of one queue response
#[derive(Debug, Default)]
pub struct FetchedBatch {
    /// Valid messages in arrival order
    pub messages: Vec<QueuedMessage>,
    /// Every valid id in the response
    pub upstream_ids: HashSet<MessageId>,
    /// Descriptors that failed validation, with the id when one was readable
    pub rejected: Vec<(Option<MessageId>, ValidationError)>,
}

#[derive(Debug)]
pub enum QueueResponse {
    /// Sentinel body or 404: nothing is pending upstream
    Empty,
    Batch(FetchedBatch),
}

#[async_trait]
pub trait QueueSource: Send + Sync {
    async fn fetch_queue(&self) -> Result<QueueResponse, UpstreamError>;
}

#[async_trait]
pub trait InstanceSource: Send + Sync {
    async fn fetch_instances(&self) -> Result<Vec<InstanceDescriptor>, UpstreamError>;
}

#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, request: &ConfirmationRequest) -> Result<(), UpstreamError>;
}

/// Upstream endpoint configuration
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub queue_url: String,
    pub instances_url: String,
    pub confirmation_url: String,
    /// Marker text of the "no records" queue response
    pub empty_queue_sentinel: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            queue_url: "http://localhost:3000/api/queue".to_string(),
            instances_url: "http://localhost:3000/api/instances".to_string(),
            confirmation_url: "http://localhost:3000/api/confirm".to_string(),
            empty_queue_sentinel: "No hay registros".to_string(),
            request_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Decode a queue response body.
///
/// A single object is treated as a one-element batch. Elements that fail
/// validation are collected in [`FetchedBatch::rejected`] and never abort the
/// batch.
pub fn decode_queue_response(body: Value, sentinel: &str) -> Result<QueueResponse, UpstreamError> {
    let elements = match body {
        Value::Object(map) => {
            let is_sentinel = map
                .get("message")
                .and_then(Value::as_str)
                .map(|m| m.contains(sentinel))
                .unwrap_or(false);
            if is_sentinel {
                return Ok(QueueResponse::Empty);
            }
            vec![Value::Object(map)]
        }
        Value::Array(items) => items,
        other => return Err(UpstreamError::UnexpectedBody(other.to_string())),
    };

    let mut batch = FetchedBatch::default();
    for element in &elements {
        let result = MessageDescriptor::from_value(element).and_then(|d| d.validate());
        match result {
            Ok(message) => {
                batch.upstream_ids.insert(message.id);
                batch.messages.push(message);
            }
            Err(e) => {
                let id = MessageDescriptor::from_value(element)
                    .ok()
                    .and_then(|d| d.id)
                    .and_then(|id| id.as_id().ok());
                batch.rejected.push((id, e));
            }
        }
    }

    Ok(QueueResponse::Batch(batch))
}

/// HTTP client for all three upstream endpoints
pub struct HttpUpstream {
    config: UpstreamConfig,
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(config: UpstreamConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { config, client })
    }

    async fn error_for_status(response: reqwest::Response) -> UpstreamError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        UpstreamError::Status { status, body }
    }
}

#[async_trait]
impl QueueSource for HttpUpstream {
    async fn fetch_queue(&self) -> Result<QueueResponse, UpstreamError> {
        let response = self.client.get(&self.config.queue_url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("Queue endpoint returned 404");
            return Ok(QueueResponse::Empty);
        }
        if !response.status().is_success() {
            return Err(Self::error_for_status(response).await);
        }

        let body: Value = response.json().await?;
        decode_queue_response(body, &self.config.empty_queue_sentinel)
    }
}

#[async_trait]
impl InstanceSource for HttpUpstream {
    async fn fetch_instances(&self) -> Result<Vec<InstanceDescriptor>, UpstreamError> {
        let response = self.client.get(&self.config.instances_url).send().await?;
        if !response.status().is_success() {
            return Err(Self::error_for_status(response).await);
        }

        let entries: Vec<Value> = response.json().await?;
        let instances = entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<InstanceDescriptor>(entry) {
                Ok(instance) => Some(instance),
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed instance entry");
                    None
                }
            })
            .collect();

        Ok(instances)
    }
}

#[async_trait]
impl Confirmer for HttpUpstream {
    async fn confirm(&self, request: &ConfirmationRequest) -> Result<(), UpstreamError> {
        let response = self
            .client
            .post(&self.config.confirmation_url)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for_status(response).await);
        }
        Ok(())
    }
}
