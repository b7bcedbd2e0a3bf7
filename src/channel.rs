// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel
//!
//! This module defines [`AmqpChannel`], the set of broker operations the
//! publisher, topology builder and consumer registry rely on, and the lapin
//! plumbing shared by the connection manager: opening a connection and its
//! channel within a timeout, turning lapin consumers into streams of
//! [`InboundDelivery`], and classifying lapin errors.

use crate::{
    config::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{DeliveryAcker, InboundDelivery},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicNackOptions, ConfirmSelectOptions},
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::LongString,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, error};

/// Stream of deliveries for one consumer. It ends when the consumer is
/// cancelled and yields an error when the connection is lost.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Broker operations used by the delivery subsystem.
///
/// Implementations must serialize declare and publish calls; deliveries are
/// acknowledged through each delivery's own [`DeliveryAcker`].
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue. Redeclaring with identical arguments succeeds,
    /// different arguments fail with `ConflictingQueueArguments`.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Starts a consumer limited to `prefetch` unacknowledged deliveries.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Generation counter bumped after every connection recovery.
    fn recovered(&self) -> watch::Receiver<u64>;
}

/// Opens a connection to RabbitMQ and a channel on it.
///
/// Both steps share the configured connection timeout. When publisher
/// confirms are enabled the channel is switched to confirm mode.
pub async fn new_amqp_channel(cfg: &RabbitMQConfigs) -> Result<(Connection, Channel), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    let conn = match tokio::time::timeout(
        cfg.connection_timeout(),
        Connection::connect_uri(cfg.amqp_uri(), options),
    )
    .await
    {
        Ok(Ok(c)) => Ok(c),
        Ok(Err(err)) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
        Err(_) => {
            error!(host = cfg.host.as_str(), port = cfg.port, "connection attempt timed out");
            Err(AmqpError::ConnectionTimeout)
        }
    }?;
    debug!("amqp connected");

    let channel = open_channel(&conn, cfg.publisher_confirms).await?;

    Ok((conn, channel))
}

/// Creates a channel on an established connection.
pub(crate) async fn open_channel(conn: &Connection, confirms: bool) -> Result<Channel, AmqpError> {
    debug!("creating amqp channel...");
    let channel = conn.create_channel().await.map_err(|err| {
        error!(error = err.to_string(), "error to create the channel");
        AmqpError::ChannelError(err.to_string())
    })?;

    if confirms {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable publisher confirms");
                AmqpError::ChannelError(err.to_string())
            })?;
    }

    debug!("channel created");
    Ok(channel)
}

/// Runs a broker `operation`, failing with `OperationTimeout` once `limit`
/// elapsed.
pub(crate) async fn bounded<T>(
    limit: Duration,
    operation: &str,
    fut: impl Future<Output = Result<T, AmqpError>>,
) -> Result<T, AmqpError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => {
            error!(operation, timeout_ms = limit.as_millis() as u64, "broker operation timed out");
            Err(AmqpError::OperationTimeout(operation.to_owned()))
        }
    }
}

/// Whether a lapin error is the broker refusing a redeclaration with
/// different arguments (`PRECONDITION_FAILED`).
pub(crate) fn is_precondition_failed(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp) => {
            matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED))
        }
        _ => false,
    }
}

/// Acknowledges lapin deliveries.
struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

/// Adapts a lapin consumer into a [`DeliveryStream`] for `queue`.
pub(crate) fn delivery_stream(queue: &str, consumer: Consumer) -> DeliveryStream {
    let queue = queue.to_owned();

    consumer
        .map(move |result| match result {
            Ok(delivery) => {
                let acker: Arc<dyn DeliveryAcker> = Arc::new(LapinAcker {
                    acker: delivery.acker,
                });

                Ok(InboundDelivery::new(
                    &queue,
                    delivery.delivery_tag,
                    &delivery.properties,
                    delivery.data,
                    acker,
                ))
            }
            Err(err) => Err(AmqpError::ChannelError(err.to_string())),
        })
        .boxed()
}
