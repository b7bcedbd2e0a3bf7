// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Client
//!
//! [`RabbitMQMessaging`] wires the connection manager, topology builder,
//! publisher, retry coordinator and consumer registry together and exposes
//! the operations the rest of an application uses:
//!
//! ```ignore
//! let messaging = RabbitMQMessaging::connect(RabbitMQConfigs::load()?).await?;
//!
//! messaging.publish(&OrderPlaced { id: 1 }, "orders").await?;
//! messaging
//!     .start_consuming("orders", handler_fn(|order: OrderPlaced| async move {
//!         Ok(order.id > 0)
//!     }))
//!     .await?;
//! ```

use crate::{
    channel::AmqpChannel,
    config::RabbitMQConfigs,
    connection::AmqpConnection,
    dispatcher::{ConsumerRegistration, RabbitMQDispatcher},
    errors::AmqpError,
    handler::ConsumerHandler,
    publisher::RabbitMQPublisher,
    retry::RetryCoordinator,
    topology::TopologyBuilder,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

pub struct RabbitMQMessaging {
    connection: Option<Arc<AmqpConnection>>,
    publisher: Arc<RabbitMQPublisher>,
    retry: Arc<RetryCoordinator>,
    dispatcher: Arc<RabbitMQDispatcher>,
}

impl RabbitMQMessaging {
    /// Connects to the broker described by `cfg`.
    pub async fn connect(cfg: RabbitMQConfigs) -> Result<RabbitMQMessaging, AmqpError> {
        let connection = AmqpConnection::connect(cfg).await?;
        let channel: Arc<dyn AmqpChannel> = connection.clone();
        let cfg = connection.configs().clone();

        Ok(Self::build(channel, &cfg, Some(connection)))
    }

    /// Runs on top of an existing channel implementation.
    pub fn with_channel(
        channel: Arc<dyn AmqpChannel>,
        cfg: &RabbitMQConfigs,
    ) -> Result<RabbitMQMessaging, AmqpError> {
        cfg.validate()?;
        Ok(Self::build(channel, cfg, None))
    }

    fn build(
        channel: Arc<dyn AmqpChannel>,
        cfg: &RabbitMQConfigs,
        connection: Option<Arc<AmqpConnection>>,
    ) -> RabbitMQMessaging {
        let topology = Arc::new(TopologyBuilder::new(channel.clone()));
        let publisher = RabbitMQPublisher::new(channel.clone(), topology.clone(), cfg);
        let retry = Arc::new(RetryCoordinator::new(cfg, publisher.clone()));
        let dispatcher = RabbitMQDispatcher::new(channel, topology, retry.clone(), cfg);

        RabbitMQMessaging {
            connection,
            publisher,
            retry,
            dispatcher,
        }
    }

    pub async fn publish<T>(&self, payload: &T, queue: &str) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.publisher.publish(payload, queue).await
    }

    /// Publishes `payload` so that no consumer of `queue` sees it before
    /// `delay` elapsed. Every delayed publish to a queue must use the same
    /// delay.
    pub async fn publish_delayed<T>(
        &self,
        payload: &T,
        queue: &str,
        delay: Duration,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.publisher.publish_delayed(payload, queue, delay).await
    }

    pub async fn start_consuming<T, H>(
        &self,
        queue: &str,
        handler: H,
    ) -> Result<ConsumerRegistration, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: ConsumerHandler<T> + 'static,
    {
        self.dispatcher.start_consuming(queue, handler).await
    }

    pub async fn stop_consuming(&self, queue: &str) -> Result<(), AmqpError> {
        self.dispatcher.stop_consuming(queue).await
    }

    pub fn publisher(&self) -> Arc<RabbitMQPublisher> {
        self.publisher.clone()
    }

    /// Stops all consumers and waits for their deliveries to settle,
    /// publishes pending retries without their delay, then closes the
    /// channel and the connection.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        debug!("stopping consumers...");
        let consumers = self.dispatcher.shutdown().await;

        debug!("flushing retries...");
        let retries = self.retry.drain().await;

        if let Some(connection) = &self.connection {
            connection.close().await?;
        }

        consumers.and(retries)?;

        info!("messaging shut down");
        Ok(())
    }
}
