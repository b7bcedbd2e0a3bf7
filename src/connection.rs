// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! [`AmqpConnection`] owns the single broker connection and the channel
//! shared by publishing, topology declaration and consumers.
//!
//! - Declare, bind, publish, consume and cancel calls go through one writer
//!   lock. Acks and nacks travel on each delivery's own acker.
//! - Publishes are bounded by the publish timeout, every other call by the
//!   operation timeout, lock wait included.
//! - A supervisor task reconnects after a connection error, waiting the
//!   configured recovery interval between attempts. Every successful
//!   recovery bumps the generation published by [`AmqpChannel::recovered`]
//!   so consumers can re-subscribe.
//! - A channel closed by the broker (for example after a rejected
//!   redeclaration) is reopened on the next operation, which also counts as
//!   a recovery.
//! - [`AmqpConnection::close`] closes the channel, then the connection, and
//!   stops the supervisor.

use crate::{
    channel::{
        bounded, delivery_stream, is_precondition_failed, new_amqp_channel, open_channel,
        AmqpChannel, DeliveryStream,
    },
    config::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ExchangeKind,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// AMQP reply code for a normal close
const REPLY_SUCCESS: u16 = 200;

struct ConnectionState {
    conn: Connection,
    channel: Channel,
}

/// Single long-lived broker connection with automatic recovery.
pub struct AmqpConnection {
    cfg: RabbitMQConfigs,
    state: RwLock<Option<ConnectionState>>,
    writer: Mutex<()>,
    generation: watch::Sender<u64>,
    epoch: AtomicU64,
    lost: mpsc::UnboundedSender<u64>,
    closing: AtomicBool,
}

impl AmqpConnection {
    /// Connects to the broker and starts the recovery supervisor.
    ///
    /// Fails when the configuration is invalid or the first connection
    /// attempt does not succeed within the connection timeout.
    pub async fn connect(cfg: RabbitMQConfigs) -> Result<Arc<AmqpConnection>, AmqpError> {
        cfg.validate()?;

        let (conn, channel) = new_amqp_channel(&cfg).await?;
        let (lost, lost_rx) = mpsc::unbounded_channel();
        let (generation, _) = watch::channel(0);

        watch_connection(&conn, lost.clone(), 0);

        info!(
            host = cfg.host.as_str(),
            port = cfg.port,
            vhost = cfg.vhost.as_str(),
            "amqp connection established"
        );

        let manager = Arc::new(AmqpConnection {
            cfg,
            state: RwLock::new(Some(ConnectionState { conn, channel })),
            writer: Mutex::new(()),
            generation,
            epoch: AtomicU64::new(0),
            lost,
            closing: AtomicBool::new(false),
        });

        tokio::spawn(supervise(Arc::downgrade(&manager), lost_rx));

        Ok(manager)
    }

    pub fn configs(&self) -> &RabbitMQConfigs {
        &self.cfg
    }

    /// Closes the channel, then the connection. Recovery stops for good.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.closing.store(true, Ordering::Release);

        let Some(state) = self.state.write().await.take() else {
            return Ok(());
        };

        debug!("closing amqp channel...");
        let channel_result = state
            .channel
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the channel");
                AmqpError::ChannelError(err.to_string())
            });

        debug!("closing amqp connection...");
        let conn_result = state
            .conn
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the connection");
                AmqpError::ConnectionError(err.to_string())
            });

        info!("amqp connection closed");
        channel_result.and(conn_result)
    }

    /// Returns the shared channel, reopening it when the broker closed it
    /// while the connection stayed up.
    async fn current_channel(&self) -> Result<Channel, AmqpError> {
        {
            let guard = self.state.read().await;
            match guard.as_ref() {
                Some(state) if state.channel.status().connected() => {
                    return Ok(state.channel.clone())
                }
                None => return Err(AmqpError::ConnectionError("connection closed".to_owned())),
                _ => {}
            }
        }

        let mut guard = self.state.write().await;
        let Some(state) = guard.as_mut() else {
            return Err(AmqpError::ConnectionError("connection closed".to_owned()));
        };

        if state.channel.status().connected() {
            return Ok(state.channel.clone());
        }

        if !state.conn.status().connected() {
            return Err(AmqpError::ConnectionError("connection is not open".to_owned()));
        }

        warn!("amqp channel was closed by the broker, reopening");
        state.channel = open_channel(&state.conn, self.cfg.publisher_confirms).await?;
        let channel = state.channel.clone();
        drop(guard);

        self.generation.send_modify(|generation| *generation += 1);

        Ok(channel)
    }
}

/// Reports errors of the connection opened at `epoch` to the supervisor.
fn watch_connection(conn: &Connection, lost: mpsc::UnboundedSender<u64>, epoch: u64) {
    conn.on_error(move |err| {
        error!(error = err.to_string(), epoch, "amqp connection lost");
        let _ = lost.send(epoch);
    });
}

async fn supervise(manager: Weak<AmqpConnection>, mut lost: mpsc::UnboundedReceiver<u64>) {
    while let Some(failed) = lost.recv().await {
        let Some(mgr) = manager.upgrade() else {
            return;
        };

        if mgr.closing.load(Ordering::Acquire) {
            return;
        }

        // errors reported by a connection that was already replaced
        if failed != mgr.epoch.load(Ordering::Acquire) {
            continue;
        }
        drop(mgr);

        recover(&manager).await;
    }
}

async fn recover(manager: &Weak<AmqpConnection>) {
    loop {
        let Some(mgr) = manager.upgrade() else {
            return;
        };
        if mgr.closing.load(Ordering::Acquire) {
            return;
        }
        let interval = mgr.cfg.network_recovery_interval();
        drop(mgr);

        tokio::time::sleep(interval).await;

        let Some(mgr) = manager.upgrade() else {
            return;
        };
        if mgr.closing.load(Ordering::Acquire) {
            return;
        }

        match new_amqp_channel(&mgr.cfg).await {
            Ok((conn, channel)) => {
                let epoch = mgr.epoch.fetch_add(1, Ordering::AcqRel) + 1;
                watch_connection(&conn, mgr.lost.clone(), epoch);

                *mgr.state.write().await = Some(ConnectionState { conn, channel });
                mgr.generation.send_modify(|generation| *generation += 1);

                info!(epoch, "amqp connection recovered");
                return;
            }
            Err(err) => {
                warn!(error = err.to_string(), "amqp recovery attempt failed, retrying");
            }
        }
    }
}

#[async_trait]
impl AmqpChannel for AmqpConnection {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        bounded(self.cfg.operation_timeout(), "declare exchange", async {
            let _writer = self.writer.lock().await;
            let channel = self.current_channel().await?;

            debug!("creating exchange: {}", def.name);

            channel
                .exchange_declare(
                    &def.name,
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        passive: false,
                        durable: def.durable,
                        auto_delete: false,
                        internal: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(
                        error = err.to_string(),
                        name = def.name.as_str(),
                        "error to declare the exchange"
                    );

                    if is_precondition_failed(&err) {
                        AmqpError::ConflictingQueueArguments(def.name.clone())
                    } else {
                        AmqpError::DeclareExchangeError(def.name.clone())
                    }
                })?;

            debug!("exchange: {} was created", def.name);
            Ok(())
        })
        .await
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        bounded(self.cfg.operation_timeout(), "declare queue", async {
            let _writer = self.writer.lock().await;
            let channel = self.current_channel().await?;

            debug!("creating queue: {}", def.name);

            channel
                .queue_declare(
                    &def.name,
                    QueueDeclareOptions {
                        passive: false,
                        durable: def.durable,
                        exclusive: false,
                        auto_delete: false,
                        nowait: false,
                    },
                    def.arguments(),
                )
                .await
                .map_err(|err| {
                    error!(
                        error = err.to_string(),
                        name = def.name.as_str(),
                        "error to declare the queue"
                    );

                    if is_precondition_failed(&err) {
                        AmqpError::ConflictingQueueArguments(def.name.clone())
                    } else {
                        AmqpError::DeclareQueueError(def.name.clone())
                    }
                })?;

            debug!("queue: {} was created", def.name);
            Ok(())
        })
        .await
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        bounded(self.cfg.operation_timeout(), "bind queue", async {
            let _writer = self.writer.lock().await;
            let channel = self.current_channel().await?;

            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to bind queue to exchange");
                    AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    )
                })
        })
        .await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let publishing = async {
            let confirm = {
                let _writer = self.writer.lock().await;
                let channel = self.current_channel().await?;

                channel
                    .basic_publish(
                        exchange,
                        routing_key,
                        BasicPublishOptions {
                            immediate: false,
                            mandatory: false,
                        },
                        payload,
                        properties,
                    )
                    .await
                    .map_err(|err| AmqpError::PublishingError(err.to_string()))?
            };

            let confirmation = confirm
                .await
                .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

            if confirmation.is_nack() {
                return Err(AmqpError::PublishingError(
                    "publisher confirm nack".to_owned(),
                ));
            }

            Ok(())
        };

        match tokio::time::timeout(self.cfg.publish_timeout(), publishing).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "error publishing message"
                );
                Err(err)
            }
            Err(_) => {
                error!(exchange, routing_key, "publish timed out");
                Err(AmqpError::PublishTimeout)
            }
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, AmqpError> {
        bounded(self.cfg.operation_timeout(), "consume", async {
            let _writer = self.writer.lock().await;
            let channel = self.current_channel().await?;

            channel
                .basic_qos(prefetch, BasicQosOptions { global: false })
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to configure qos");
                    AmqpError::QoSDeclarationError(err.to_string())
                })?;

            let consumer = channel
                .basic_consume(
                    queue,
                    consumer_tag,
                    BasicConsumeOptions {
                        no_local: false,
                        no_ack: false,
                        exclusive: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), queue, "error to create the consumer");
                    AmqpError::ConsumerDeclarationError(queue.to_owned())
                })?;

            Ok(delivery_stream(queue, consumer))
        })
        .await
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        bounded(self.cfg.operation_timeout(), "cancel consumer", async {
            let _writer = self.writer.lock().await;
            let channel = self.current_channel().await?;

            channel
                .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                    AmqpError::ConsumerCancelError(consumer_tag.to_owned())
                })
        })
        .await
    }

    fn recovered(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}
