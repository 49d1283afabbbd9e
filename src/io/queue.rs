use crate::types::{GvError, GvResult, SourceRef};
use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_sqs::error::DisplayErrorContext;
use serde::Deserialize;
use std::time::Duration;

/// A received message and the handle needed to renew or delete it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub body: String,
    pub receipt: String,
}

/// Lease-based job queue
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Receive up to `max` messages; an empty vector means the queue is drained
    async fn receive(&self, max: i32) -> GvResult<Vec<QueueMessage>>;

    /// Reset the message's visibility timeout to `lease` from now
    async fn extend_lease(&self, message: &QueueMessage, lease: Duration) -> GvResult<()>;

    /// Acknowledge the message
    async fn delete(&self, message: &QueueMessage) -> GvResult<()>;
}

/// Amazon SQS queue
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    url: String,
}

impl SqsQueue {
    /// Connect using the default AWS credential chain.
    ///
    /// Every SQS call is bounded by `request_timeout`, independent of the
    /// visibility lease.
    pub async fn connect(url: &str, request_timeout: Duration) -> Self {
        let timeouts = TimeoutConfig::builder()
            .operation_timeout(request_timeout)
            .build();
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .timeout_config(timeouts)
            .load()
            .await;
        Self {
            client: aws_sdk_sqs::Client::new(&config),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl JobQueue for SqsQueue {
    async fn receive(&self, max: i32) -> GvResult<Vec<QueueMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.url)
            .max_number_of_messages(max)
            .send()
            .await
            .map_err(|e| GvError::Queue(format!("receive_message: {}", DisplayErrorContext(&e))))?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|m| match (m.body(), m.receipt_handle()) {
                (Some(body), Some(receipt)) => Some(QueueMessage {
                    body: body.to_string(),
                    receipt: receipt.to_string(),
                }),
                _ => {
                    log::warn!("Ignoring message without body or receipt: {:?}", m.message_id());
                    None
                }
            })
            .collect();
        Ok(messages)
    }

    async fn extend_lease(&self, message: &QueueMessage, lease: Duration) -> GvResult<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.url)
            .receipt_handle(&message.receipt)
            .visibility_timeout(lease.as_secs() as i32)
            .send()
            .await
            .map_err(|e| GvError::Queue(format!("change_message_visibility: {}", DisplayErrorContext(&e))))?;
        Ok(())
    }

    async fn delete(&self, message: &QueueMessage) -> GvResult<()> {
        self.client
            .delete_message()
            .queue_url(&self.url)
            .receipt_handle(&message.receipt)
            .send()
            .await
            .map_err(|e| GvError::Queue(format!("delete_message: {}", DisplayErrorContext(&e))))?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct NotificationEnvelope {
    #[serde(rename = "Message")]
    message: String,
}

#[derive(Deserialize)]
struct StorageEvent {
    #[serde(rename = "Records")]
    records: Option<Vec<EventRecord>>,
    #[serde(rename = "Event")]
    event: Option<String>,
}

#[derive(Deserialize)]
struct EventRecord {
    s3: EventEntity,
}

#[derive(Deserialize)]
struct EventEntity {
    bucket: EventBucket,
    object: EventObject,
}

#[derive(Deserialize)]
struct EventBucket {
    name: String,
}

#[derive(Deserialize)]
struct EventObject {
    key: String,
}

/// Extract the referenced objects from a message body.
///
/// Accepts `bucket:key`, a notification envelope wrapping a storage event,
/// or a bare storage event. Bucket test events yield no objects.
pub fn parse_message_body(body: &str) -> GvResult<Vec<SourceRef>> {
    let body = body.trim();
    if body.starts_with('{') {
        let document = match serde_json::from_str::<NotificationEnvelope>(body) {
            Ok(envelope) => envelope.message,
            Err(_) => body.to_string(),
        };
        let event: StorageEvent = serde_json::from_str(&document)
            .map_err(|e| GvError::MalformedInput(format!("Unreadable storage event: {}", e)))?;

        return match (event.records, event.event) {
            (Some(records), _) => Ok(records
                .into_iter()
                .map(|r| SourceRef::new(r.s3.bucket.name, r.s3.object.key))
                .collect()),
            (None, Some(kind)) => {
                log::info!("Ignoring {} notification", kind);
                Ok(Vec::new())
            }
            (None, None) => Err(GvError::MalformedInput(
                "Storage event has no Records".to_string(),
            )),
        };
    }

    let parts: Vec<&str> = body.split(':').collect();
    match (parts.first(), parts.last()) {
        (Some(bucket), Some(key)) if parts.len() >= 2 && !bucket.is_empty() && !key.is_empty() => {
            Ok(vec![SourceRef::new(*bucket, *key)])
        }
        _ => Err(GvError::MalformedInput(format!(
            "Message body is not bucket:key: '{}'",
            body
        ))),
    }
}
