// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Coordinator
//!
//! Decides what happens to a delivery whose handler failed. While attempts
//! remain, the delivery is settled and a copy carrying `x-retry-count + 1`
//! is re-published to the same queue once the retry delay elapsed. Once
//! attempts are exhausted the delivery is rejected and the broker moves it
//! to the dead-letter queue through the queue's dead-letter arguments.
//!
//! The superseded delivery is acked rather than nacked: the main queue is
//! declared with a dead-letter exchange, so a rejection would also copy
//! every intermediate attempt into the dead-letter queue.
//!
//! Pending re-publishes are tracked. [`RetryCoordinator::drain`] skips the
//! remaining delays and waits until every pending retry was published, so
//! an acked delivery is not lost on shutdown.
//!
//! Retries re-enter the queue at its tail. A retried message may therefore
//! be delivered after messages published later than the original.

use crate::{
    config::RabbitMQConfigs,
    errors::AmqpError,
    message::{InboundDelivery, OutboundMessage},
    publisher::Publisher,
};
use futures_util::future::join_all;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// What the coordinator decided for a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-publish with `next_attempt` as the new retry count.
    Retry { next_attempt: u32 },
    /// Attempts exhausted.
    DeadLetter,
}

/// Bounded retry policy.
///
/// `max_retry_attempts` counts retries, not executions: a value of `3`
/// allows the original delivery plus three retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retry_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_retry_attempts: u32) -> Self {
        RetryPolicy { max_retry_attempts }
    }

    /// `retry_count` is the number of retries already performed for the
    /// delivery that just failed.
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if retry_count < self.max_retry_attempts {
            RetryDecision::Retry {
                next_attempt: retry_count + 1,
            }
        } else {
            RetryDecision::DeadLetter
        }
    }
}

/// Terminal state of a delivery once the delivery handler is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Retrying { attempt: u32 },
    DeadLettered,
    Rejected,
}

pub struct RetryCoordinator {
    policy: RetryPolicy,
    retry_delay: Duration,
    publisher: Arc<dyn Publisher>,
    pending: Mutex<Vec<JoinHandle<()>>>,
    flush: watch::Sender<bool>,
}

impl RetryCoordinator {
    pub fn new(cfg: &RabbitMQConfigs, publisher: Arc<dyn Publisher>) -> Self {
        RetryCoordinator {
            policy: RetryPolicy::new(cfg.max_retry_attempts),
            retry_delay: cfg.retry_delay(),
            publisher,
            pending: Mutex::new(vec![]),
            flush: watch::channel(false).0,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Settles a delivery whose handler declined or failed with `reason`.
    ///
    /// On the retry path the re-publish runs in the background after the
    /// retry delay, or earlier once [`RetryCoordinator::drain`] was called.
    /// Its failure is logged and the message leaves the retry path.
    pub async fn handle_failure(
        &self,
        delivery: &InboundDelivery,
        reason: &str,
    ) -> Result<DeliveryOutcome, AmqpError> {
        match self.policy.decide(delivery.retry_count) {
            RetryDecision::Retry { next_attempt } => {
                delivery.ack().await?;

                warn!(
                    queue = delivery.queue_name.as_str(),
                    message_id = delivery.message_id.as_deref().unwrap_or_default(),
                    attempt = next_attempt,
                    max_attempts = self.policy.max_retry_attempts,
                    reason,
                    "error whiling handling msg, scheduling retry"
                );

                let msg = OutboundMessage::retry_of(delivery);
                let queue = delivery.queue_name.clone();
                let publisher = self.publisher.clone();
                let delay = self.retry_delay;
                let mut flush = self.flush.subscribe();

                let task = tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            Ok(()) = flushed(&mut flush) => {}
                        }
                    }

                    match publisher.publish_message(&msg, &queue).await {
                        Ok(_) => debug!(
                            queue = queue.as_str(),
                            message_id = msg.message_id.to_string(),
                            attempt = msg.retry_count,
                            "retry published"
                        ),
                        Err(err) => error!(
                            error = err.to_string(),
                            queue = queue.as_str(),
                            message_id = msg.message_id.to_string(),
                            attempt = msg.retry_count,
                            "error publishing retry, message dropped from retry path"
                        ),
                    }
                });

                let mut pending = self.pending.lock().await;
                pending.retain(|task| !task.is_finished());
                pending.push(task);

                Ok(DeliveryOutcome::Retrying {
                    attempt: next_attempt,
                })
            }
            RetryDecision::DeadLetter => {
                delivery.nack(false).await?;

                error!(
                    queue = delivery.queue_name.as_str(),
                    message_id = delivery.message_id.as_deref().unwrap_or_default(),
                    retries = delivery.retry_count,
                    reason,
                    "too many attempts, sending to dlq"
                );

                Ok(DeliveryOutcome::DeadLettered)
            }
        }
    }

    /// Publishes every pending retry without waiting out its delay and
    /// returns once all of them settled.
    ///
    /// Retries scheduled after this call are published right away.
    pub async fn drain(&self) -> Result<(), AmqpError> {
        self.flush.send_replace(true);

        let pending = std::mem::take(&mut *self.pending.lock().await);
        if !pending.is_empty() {
            info!(count = pending.len(), "flushing pending retries");
        }

        let mut failed = false;
        for res in join_all(pending).await {
            if let Err(err) = res {
                error!(error = err.to_string(), "retry task failed");
                failed = true;
            }
        }

        if failed {
            return Err(AmqpError::InternalError);
        }

        Ok(())
    }
}

async fn flushed(flush: &mut watch::Receiver<bool>) -> Result<(), watch::error::RecvError> {
    flush.wait_for(|flushed| *flushed).await.map(|_| ())
}
