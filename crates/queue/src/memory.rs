//! In-process queue with SQS-like delivery semantics.
//!
//! Messages stay on the queue until acknowledged. A received message is
//! invisible to other consumers until it is acked, nacked, or its visibility
//! timeout lapses, after which it is handed out again (at-least-once).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::consumer::{Broker, QueueConsumer, QueueHealth, QueueMessage, QueueProducer};
use crate::error::QueueError;

struct Stored {
    id: String,
    body: Vec<u8>,
    timestamp: DateTime<Utc>,
    attempt_count: u32,
}

struct InFlight {
    message: Stored,
    deadline: Instant,
}

#[derive(Default)]
struct Inner {
    ready: VecDeque<Stored>,
    in_flight: HashMap<String, InFlight>,
}

impl Inner {
    /// Return every in-flight message whose visibility lapsed to the front of the queue.
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(handle, _)| handle.clone())
            .collect();
        for handle in expired {
            if let Some(flight) = self.in_flight.remove(&handle) {
                self.ready.push_front(flight.message);
            }
        }
    }
}

/// Memory-backed broker queue.
pub struct MemoryQueue {
    name: String,
    inner: Mutex<Inner>,
    notify: Notify,
    visibility_timeout: Duration,
    wait_time: Duration,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_timeouts(name, Duration::from_secs(300), Duration::from_millis(200))
    }

    pub fn with_timeouts(name: impl Into<String>, visibility_timeout: Duration, wait_time: Duration) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            visibility_timeout,
            wait_time,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Messages waiting for delivery.
    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Messages handed out but not yet acknowledged.
    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another thread panicked mid-update of
        // plain collections; the data is still structurally valid.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn take_ready(&self, max_messages: usize) -> Vec<QueueMessage> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.requeue_expired(now);

        let mut out = Vec::new();
        while out.len() < max_messages {
            let Some(mut stored) = inner.ready.pop_front() else {
                break;
            };
            stored.attempt_count += 1;
            let receipt_handle = Uuid::new_v4().to_string();
            out.push(QueueMessage {
                id: stored.id.clone(),
                body: stored.body.clone(),
                receipt_handle: receipt_handle.clone(),
                timestamp: stored.timestamp,
                attempt_count: stored.attempt_count,
            });
            inner.in_flight.insert(
                receipt_handle,
                InFlight {
                    message: stored,
                    deadline: now + self.visibility_timeout,
                },
            );
        }
        out
    }
}

#[async_trait]
impl QueueProducer for MemoryQueue {
    async fn publish(&self, body: &[u8]) -> Result<(), QueueError> {
        self.ensure_open()?;
        let id = Uuid::new_v4().to_string();
        debug!(queue = %self.name, message_id = %id, bytes = body.len(), "publishing message");
        self.lock().ready.push_back(Stored {
            id,
            body: body.to_vec(),
            timestamp: Utc::now(),
            attempt_count: 0,
        });
        self.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl QueueConsumer for MemoryQueue {
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError> {
        self.ensure_open()?;
        let max_messages = max_messages.max(1) as usize;
        let deadline = Instant::now() + self.wait_time;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_ready(max_messages);
            if !batch.is_empty() {
                debug!(queue = %self.name, count = batch.len(), "received messages");
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // Timing out just means re-checking: expired in-flight messages
            // never signal the notifier.
            let _ = tokio::time::timeout(deadline - now, notified).await;
            self.ensure_open()?;
        }
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        match self.lock().in_flight.remove(receipt_handle) {
            Some(_) => Ok(()),
            None => Err(QueueError::Ack(format!(
                "unknown or expired receipt handle: {receipt_handle}"
            ))),
        }
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        {
            let mut inner = self.lock();
            let flight = inner.in_flight.remove(receipt_handle).ok_or_else(|| {
                QueueError::Ack(format!("unknown or expired receipt handle: {receipt_handle}"))
            })?;
            inner.ready.push_front(flight.message);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        Ok(QueueHealth {
            connected: !self.closed.load(Ordering::Acquire),
            approximate_message_count: Some(self.ready_len() as u64),
            provider: "memory".to_string(),
        })
    }
}

#[async_trait]
impl Broker for MemoryQueue {
    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn publish_then_poll_and_ack() {
        let queue = MemoryQueue::new("test");
        queue.publish(b"job-1").await.unwrap();

        let batch = queue.poll_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, b"job-1");
        assert_eq!(batch[0].attempt_count, 1);
        assert_eq!(queue.in_flight_len(), 1);

        queue.ack(&batch[0].receipt_handle).await.unwrap();
        assert_eq!(queue.in_flight_len(), 0);
        assert_eq!(queue.ready_len(), 0);
    }

    #[tokio::test]
    async fn nack_redelivers_with_higher_attempt_count() {
        let queue = MemoryQueue::new("test");
        queue.publish(b"job").await.unwrap();

        let first = queue.poll_batch(1).await.unwrap().remove(0);
        queue.nack(&first.receipt_handle).await.unwrap();

        let second = queue.poll_batch(1).await.unwrap().remove(0);
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt_count, 2);
        assert!(second.is_redelivery());
    }

    #[tokio::test]
    async fn expired_visibility_redelivers() {
        let queue = MemoryQueue::with_timeouts("test", Duration::from_millis(20), Duration::from_millis(10));
        queue.publish(b"job").await.unwrap();

        let first = queue.poll_batch(1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(queue.poll_batch(1).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let again = queue.poll_batch(1).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempt_count, 2);

        // The stale receipt handle no longer acks anything.
        assert!(queue.ack(&first[0].receipt_handle).await.is_err());
    }

    #[tokio::test]
    async fn empty_poll_returns_after_wait_time() {
        let queue = MemoryQueue::with_timeouts("test", Duration::from_secs(5), Duration::from_millis(10));
        let batch = queue.poll_batch(5).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_publish() {
        let queue = Arc::new(MemoryQueue::with_timeouts("test", Duration::from_secs(5), Duration::from_secs(5)));
        let consumer = queue.clone();
        let handle = tokio::spawn(async move { consumer.poll_batch(1).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish(b"late").await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(batch[0].body, b"late");
    }

    #[tokio::test]
    async fn closed_queue_rejects_publish() {
        let queue = MemoryQueue::new("test");
        queue.close().await.unwrap();
        assert!(matches!(queue.publish(b"x").await, Err(QueueError::Closed(_))));
        let health = queue.health_check().await.unwrap();
        assert!(!health.connected);
    }
}
