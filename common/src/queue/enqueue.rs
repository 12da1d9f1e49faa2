// Enqueue interface consumed by the dispatcher
//
// The execution engine is an opaque external collaborator: the scheduler's
// responsibility ends once an enqueue is acknowledged. Priority rides along
// in the payload (smaller number is higher priority, a fixed convention of
// the engine's ordering contract); the scheduler never reorders on it.

use crate::errors::EnqueueError;
use crate::table::{Args, Properties};
use async_nats::jetstream::context::PublishAckFuture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument};

use super::nats::NatsClient;

/// One concrete unit-of-work request handed to the execution engine
///
/// Ephemeral: owned by the dispatcher for the duration of the hand-off and
/// not persisted by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Schedule-table key that produced this request
    pub key: String,
    /// Unit-of-work type, resolved by the execution engine
    pub job_class: String,
    /// Positional arguments, already materialized
    pub args: Args,
    /// Execution priority; smaller number wins
    pub priority: i32,
    /// Additional execution properties, already materialized
    pub properties: Properties,
    /// The fire instant this request corresponds to
    pub scheduled_at: DateTime<Utc>,
}

impl DispatchRequest {
    /// Stable identity of the fire, used for engine-side deduplication
    pub fn idempotency_key(&self) -> String {
        format!("{}@{}", self.key, self.scheduled_at.timestamp())
    }
}

/// The execution engine's enqueue operation
#[async_trait::async_trait]
pub trait JobEnqueuer: Send + Sync {
    /// Hand a dispatch request to the engine. `Ok` means the engine
    /// acknowledged acceptance; anything after that (execution, retries of
    /// the resulting job) is the engine's business.
    async fn enqueue(&self, request: &DispatchRequest) -> Result<(), EnqueueError>;
}

/// NATS JetStream-backed enqueuer
pub struct NatsJobEnqueuer {
    client: NatsClient,
    subject_prefix: String,
    publish_timeout: Duration,
}

impl NatsJobEnqueuer {
    pub fn new(client: NatsClient) -> Self {
        let subject_prefix = format!("dispatch.{}", client.config().stream_name.to_lowercase());
        Self {
            client,
            subject_prefix,
            publish_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    fn subject_for(&self, request: &DispatchRequest) -> String {
        format!("{}.{}", self.subject_prefix, request.key)
    }
}

#[async_trait::async_trait]
impl JobEnqueuer for NatsJobEnqueuer {
    #[instrument(skip(self, request), fields(
        task_key = %request.key,
        job_class = %request.job_class,
        priority = request.priority,
        scheduled_at = %request.scheduled_at
    ))]
    async fn enqueue(&self, request: &DispatchRequest) -> Result<(), EnqueueError> {
        let payload = serde_json::to_vec(request).map_err(|e| {
            EnqueueError::SerializationFailed(format!("Failed to serialize request: {}", e))
        })?;

        let subject = self.subject_for(request);

        // Nats-Msg-Id lets JetStream drop replays of the same fire
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", request.idempotency_key().as_str());
        headers.insert("Task-Key", request.key.as_str());
        headers.insert("Job-Class", request.job_class.as_str());

        let publish_future: PublishAckFuture = self
            .client
            .jetstream()
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
            .map_err(|e| EnqueueError::Rejected(format!("Failed to publish request: {}", e)))?;

        let ack_result = tokio::time::timeout(self.publish_timeout, publish_future).await;

        match ack_result {
            Ok(Ok(_ack)) => {
                info!(subject = %subject, "Dispatch request accepted by execution engine");
                Ok(())
            }
            Ok(Err(e)) => Err(EnqueueError::Rejected(format!(
                "Failed to get publish acknowledgment: {}",
                e
            ))),
            Err(_) => Err(EnqueueError::AckTimeout(format!(
                "Publish acknowledgment timeout after {:?}",
                self.publish_timeout
            ))),
        }
    }
}
