// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module publishes messages to queues. A plain publish goes through
//! the default exchange with the queue name as routing key. A delayed
//! publish goes to the queue's delayed exchange, from where the broker
//! moves the message into the queue once the delay expires.
//!
//! Every message carries `delivery-mode = 2`, a message id, a UTC timestamp
//! and the payload type tag, and the current OpenTelemetry context is
//! injected into its headers.

use crate::{
    channel::AmqpChannel,
    config::RabbitMQConfigs,
    errors::AmqpError,
    message::OutboundMessage,
    otel::RabbitMQTracePropagator,
    topology::{TopologyBuilder, TopologyOptions},
};
use async_trait::async_trait;
use lapin::types::FieldTable;
#[cfg(test)]
use mockall::automock;
use opentelemetry::{global, Context};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

/// Writes an [`OutboundMessage`] to a queue.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `msg` to `queue`, honoring `msg.delay`.
    async fn publish_message(&self, msg: &OutboundMessage, queue: &str) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the [`Publisher`] trait.
pub struct RabbitMQPublisher {
    channel: Arc<dyn AmqpChannel>,
    topology: Arc<TopologyBuilder>,
    durable: bool,
    enable_dead_letter: bool,
}

impl RabbitMQPublisher {
    pub fn new(
        channel: Arc<dyn AmqpChannel>,
        topology: Arc<TopologyBuilder>,
        cfg: &RabbitMQConfigs,
    ) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            channel,
            topology,
            durable: true,
            enable_dead_letter: cfg.enable_dead_letter_queue,
        })
    }

    /// Serializes `payload` as JSON and publishes it to `queue`.
    ///
    /// A serialization failure is returned without touching the broker.
    pub async fn publish<T>(&self, payload: &T, queue: &str) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let msg = OutboundMessage::json(payload)?;
        self.publish_message(&msg, queue).await
    }

    /// Publishes `payload` so that it reaches `queue` once `delay` elapsed.
    pub async fn publish_delayed<T>(
        &self,
        payload: &T,
        queue: &str,
        delay: Duration,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let msg = OutboundMessage::json(payload)?.with_delay(delay);
        self.publish_message(&msg, queue).await
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish_message(&self, msg: &OutboundMessage, queue: &str) -> Result<(), AmqpError> {
        let topology = self
            .topology
            .ensure_topology(
                queue,
                &TopologyOptions {
                    durable: self.durable,
                    enable_dead_letter: self.enable_dead_letter,
                    delay: msg.delay,
                },
            )
            .await?;

        let (exchange, routing_key) = match (&topology.delayed_exchange, &topology.delayed_queue) {
            (Some(exchange), Some(delayed_queue)) => (exchange.as_str(), delayed_queue.as_str()),
            _ => ("", queue),
        };

        let mut headers = FieldTable::default();
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(
                &Context::current(),
                &mut RabbitMQTracePropagator::new(&mut headers),
            )
        });

        self.channel
            .publish(exchange, routing_key, &msg.payload, msg.properties(headers))
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    queue,
                    message_id = msg.message_id.to_string(),
                    "error publishing message"
                );
                err
            })?;

        debug!(
            queue,
            exchange,
            message_id = msg.message_id.to_string(),
            msg_type = msg.type_tag.as_str(),
            retry_count = msg.retry_count,
            "message published"
        );

        Ok(())
    }
}
