//! AWS SQS broker implementation.
//!
//! SQS message bodies must be valid text, so the binary job descriptor is
//! carried hex-encoded.

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_sqs::config::BehaviorVersion;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use chrono::{TimeZone, Utc};
use tracing::{debug, info};

use coper_core::config::{AwsConfig, QueueConfig};

use crate::consumer::{Broker, QueueConsumer, QueueHealth, QueueMessage, QueueProducer};
use crate::error::QueueError;

/// SQS-backed broker queue.
pub struct SqsQueue {
    client: Client,
    queue_url: String,
    dlq_url: Option<String>,
    visibility_timeout_secs: i32,
    wait_time_secs: i32,
}

/// SQS client for the configured region, credentials and endpoint.
///
/// Built directly instead of through `aws-config` so that a custom
/// `AWS_ENDPOINT_URL` meant for the object store does not leak in.
fn build_client(aws: &AwsConfig) -> Client {
    let mut builder = aws_sdk_sqs::Config::builder()
        .region(aws_sdk_sqs::config::Region::new(aws.region.clone()))
        .behavior_version(BehaviorVersion::latest());

    if let (Some(key_id), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) {
        builder = builder.credentials_provider(Credentials::new(
            key_id,
            secret,
            aws.session_token.clone(),
            None,
            "coper-queue-static",
        ));
    }

    match aws.endpoint_url.as_deref() {
        Some(endpoint) if endpoint.starts_with("http://") || endpoint.starts_with("https://") => {
            builder = builder.endpoint_url(endpoint);
        }
        Some(endpoint) if !endpoint.is_empty() => {
            builder = builder.endpoint_url(format!("https://{endpoint}"));
        }
        _ => {}
    }

    Client::from_conf(builder.build())
}

/// Turn a received SQS message into a delivery, undoing the hex body encoding.
fn to_delivery(msg: aws_sdk_sqs::types::Message) -> Result<QueueMessage, QueueError> {
    let id = msg.message_id().unwrap_or("unknown").to_string();
    let body = hex::decode(msg.body().unwrap_or(""))
        .map_err(|e| QueueError::Parse(format!("message {id} body is not hex: {e}")))?;
    let receipt_handle = msg
        .receipt_handle()
        .ok_or_else(|| QueueError::Parse(format!("message {id} has no receipt handle")))?
        .to_string();

    let attribute = |name: MessageSystemAttributeName| {
        msg.attributes()
            .and_then(|attrs| attrs.get(&name))
            .cloned()
    };
    // SentTimestamp is epoch millis.
    let timestamp = attribute(MessageSystemAttributeName::SentTimestamp)
        .and_then(|ts| ts.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);
    let attempt_count = attribute(MessageSystemAttributeName::ApproximateReceiveCount)
        .and_then(|c| c.parse::<u32>().ok())
        .unwrap_or(1);

    Ok(QueueMessage {
        id,
        body,
        receipt_handle,
        timestamp,
        attempt_count,
    })
}

impl SqsQueue {
    pub async fn new(aws: &AwsConfig, queue: &QueueConfig) -> Result<Self, QueueError> {
        let queue_url = queue
            .queue_url
            .clone()
            .ok_or_else(|| QueueError::Connection("SQS_QUEUE_URL not set".into()))?;
        let client = build_client(aws);
        info!(queue = %queue.name, queue_url = %queue_url, region = %aws.region, "SQS broker ready");

        Ok(Self {
            client,
            queue_url,
            dlq_url: None,
            visibility_timeout_secs: queue.visibility_timeout_secs as i32,
            // SQS rejects long polls above 20 seconds.
            wait_time_secs: queue.wait_time_secs.min(20) as i32,
        })
    }

    /// Attach a dead-letter queue for depth reporting.
    pub fn with_dlq(mut self, dlq_url: impl Into<String>) -> Self {
        self.dlq_url = Some(dlq_url.into());
        self
    }

    async fn approximate_depth(&self, url: &str) -> Result<Option<u64>, QueueError> {
        let resp = self
            .client
            .get_queue_attributes()
            .queue_url(url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS attribute query failed: {e:?}")))?;

        Ok(resp
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok()))
    }
}

#[async_trait]
impl QueueProducer for SqsQueue {
    async fn publish(&self, body: &[u8]) -> Result<(), QueueError> {
        debug!(bytes = body.len(), "Publishing SQS message");

        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(hex::encode(body))
            .send()
            .await
            .map_err(|e| QueueError::Publish(format!("SQS send failed: {e:?}")))?;

        Ok(())
    }
}

#[async_trait]
impl QueueConsumer for SqsQueue {
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError> {
        // SQS caps at 10 messages per request.
        let capped = max_messages.clamp(1, 10) as i32;

        debug!(max_messages = capped, "Polling SQS");

        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(capped)
            .wait_time_seconds(self.wait_time_secs)
            .visibility_timeout(self.visibility_timeout_secs)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS receive failed: {e:?}")))?;

        let received = resp.messages.unwrap_or_default();
        debug!(count = received.len(), "received SQS messages");
        received.into_iter().map(to_delivery).collect()
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        debug!(receipt_handle, "Acking SQS message");

        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Ack(format!("SQS delete failed: {e:?}")))?;

        Ok(())
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        debug!(receipt_handle, "Nacking SQS message (visibility=0)");

        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|e| QueueError::Provider(format!("SQS visibility change failed: {e:?}")))?;

        Ok(())
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        let count = self.approximate_depth(&self.queue_url).await?;
        Ok(QueueHealth {
            connected: true,
            approximate_message_count: count,
            provider: "sqs".to_string(),
        })
    }

    async fn dlq_depth(&self) -> Result<Option<u64>, QueueError> {
        match &self.dlq_url {
            Some(url) => self.approximate_depth(url).await,
            None => Ok(None),
        }
    }
}

// The SQS client is a stateless HTTP client; there is no connection to release.
impl Broker for SqsQueue {}
