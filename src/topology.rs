// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Builder
//!
//! Declares, for a base queue name, everything publishing and consuming on
//! that queue needs:
//!
//! - the durable main queue, with `x-dead-letter-exchange` /
//!   `x-dead-letter-routing-key` pointing at its dead-letter exchange when
//!   dead-lettering is enabled;
//! - the direct dead-letter exchange `<queue>.dlx` and the durable
//!   dead-letter queue `<queue>.dlq`, bound with the queue name as key;
//! - on demand, the direct delayed exchange `<queue>.delayed` and the
//!   delayed queue of the same name. The delayed queue has a message TTL
//!   equal to the delay and dead-letters into the default exchange with the
//!   main queue as routing key, so an expired message lands in the main
//!   queue.
//!
//! Each queue is declared once per connection. The builder remembers the
//! definition it declared and refuses a later request for different
//! arguments with `ConflictingQueueArguments` instead of sending a
//! redeclaration the broker would reject. The cache is dropped after every
//! connection recovery.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{
        dead_letter_exchange_name, dead_letter_queue_name, delayed_name, QueueBinding,
        QueueDefinition,
    },
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error};

/// Options for [`TopologyBuilder::ensure_topology`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyOptions {
    pub durable: bool,
    pub enable_dead_letter: bool,
    pub delay: Option<Duration>,
}

/// Names of the resources declared for a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub queue_name: String,
    pub durable: bool,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_queue: Option<String>,
    pub delayed_exchange: Option<String>,
    pub delayed_queue: Option<String>,
}

#[derive(Default)]
struct DeclaredTopology {
    generation: u64,
    queues: HashMap<String, QueueDefinition>,
}

impl DeclaredTopology {
    /// `Ok(true)` when `def` still has to be declared, `Ok(false)` when the
    /// same definition was already declared.
    fn needs_declare(&self, def: &QueueDefinition) -> Result<bool, AmqpError> {
        match self.queues.get(&def.name) {
            None => Ok(true),
            Some(existing) if existing == def => Ok(false),
            Some(existing) => {
                error!(
                    queue = def.name.as_str(),
                    declared = ?existing,
                    requested = ?def,
                    "queue already declared with different arguments"
                );
                Err(AmqpError::ConflictingQueueArguments(def.name.clone()))
            }
        }
    }
}

/// Declares queue topologies on a shared channel.
pub struct TopologyBuilder {
    channel: Arc<dyn AmqpChannel>,
    recovered: watch::Receiver<u64>,
    declared: Mutex<DeclaredTopology>,
}

impl TopologyBuilder {
    pub fn new(channel: Arc<dyn AmqpChannel>) -> TopologyBuilder {
        let recovered = channel.recovered();
        let generation = *recovered.borrow();

        TopologyBuilder {
            channel,
            recovered,
            declared: Mutex::new(DeclaredTopology {
                generation,
                queues: HashMap::default(),
            }),
        }
    }

    /// Declares the topology of `queue` according to `opts`.
    ///
    /// Calls with the options already used for this queue do not reach the
    /// broker. Broker failures are returned as they are and leave nothing
    /// cached, so the next call declares again.
    pub async fn ensure_topology(
        &self,
        queue: &str,
        opts: &TopologyOptions,
    ) -> Result<QueueTopology, AmqpError> {
        if queue.is_empty() {
            return Err(AmqpError::InvalidConfig(
                "queue name must not be empty".to_owned(),
            ));
        }

        let mut declared = self.declared.lock().await;

        let generation = *self.recovered.borrow();
        if generation != declared.generation {
            debug!(generation, "connection recovered, forgetting declared topology");
            declared.queues.clear();
            declared.generation = generation;
        }

        let mut topology = QueueTopology {
            queue_name: queue.to_owned(),
            durable: opts.durable,
            dead_letter_exchange: None,
            dead_letter_queue: None,
            delayed_exchange: None,
            delayed_queue: None,
        };

        let mut main = QueueDefinition::new(queue);
        if opts.durable {
            main = main.durable();
        }

        if opts.enable_dead_letter {
            let dlx = dead_letter_exchange_name(queue);
            let dlq = QueueDefinition::new(&dead_letter_queue_name(queue)).durable();
            main = main.dead_letter(&dlx, queue);

            // validate the main queue before touching the broker
            declared.needs_declare(&main)?;

            if declared.needs_declare(&dlq)? {
                self.channel
                    .declare_exchange(&ExchangeDefinition::new(&dlx).durable())
                    .await?;
                self.channel.declare_queue(&dlq).await?;
                self.channel
                    .bind_queue(&QueueBinding::new(&dlq.name).exchange(&dlx).routing_key(queue))
                    .await?;
                declared.queues.insert(dlq.name.clone(), dlq.clone());
            }

            topology.dead_letter_exchange = Some(dlx);
            topology.dead_letter_queue = Some(dlq.name);
        }

        if declared.needs_declare(&main)? {
            self.channel.declare_queue(&main).await?;
            declared.queues.insert(main.name.clone(), main);
        }

        if let Some(delay) = opts.delay {
            let ttl = i32::try_from(delay.as_millis()).map_err(|_| {
                AmqpError::InvalidConfig(format!("delay of {:?} is too long", delay))
            })?;

            let name = delayed_name(queue);
            let delayed = QueueDefinition::new(&name)
                .durable()
                .ttl(ttl)
                .dead_letter("", queue);

            if declared.needs_declare(&delayed)? {
                self.channel
                    .declare_exchange(&ExchangeDefinition::new(&name).durable())
                    .await?;
                self.channel.declare_queue(&delayed).await?;
                self.channel
                    .bind_queue(&QueueBinding::new(&name).exchange(&name).routing_key(&name))
                    .await?;
                declared.queues.insert(name.clone(), delayed);
            }

            topology.delayed_exchange = Some(name.clone());
            topology.delayed_queue = Some(name);
        }

        Ok(topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mocks::channel_with_recovery;

    fn dead_letter_opts() -> TopologyOptions {
        TopologyOptions {
            durable: true,
            enable_dead_letter: true,
            delay: None,
        }
    }

    #[tokio::test]
    async fn should_declare_dead_letter_topology_once() {
        let (mut channel, _recovery) = channel_with_recovery();

        channel
            .expect_declare_exchange()
            .withf(|def| def.name() == "orders.dlx" && def.is_durable())
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|def| def.name() == "orders.dlq" && def.arguments().inner().is_empty())
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_bind_queue()
            .withf(|b| {
                b.queue_name() == "orders.dlq"
                    && b.exchange_name() == "orders.dlx"
                    && b.key() == "orders"
            })
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|def| {
                def.name() == "orders"
                    && def.is_durable()
                    && def.dead_letter_exchange() == Some("orders.dlx")
                    && def.dead_letter_routing_key() == Some("orders")
            })
            .times(1)
            .returning(|_| Ok(()));

        let builder = TopologyBuilder::new(Arc::new(channel));

        let first = builder
            .ensure_topology("orders", &dead_letter_opts())
            .await
            .unwrap();
        let second = builder
            .ensure_topology("orders", &dead_letter_opts())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.dead_letter_exchange.as_deref(), Some("orders.dlx"));
        assert_eq!(first.dead_letter_queue.as_deref(), Some("orders.dlq"));
        assert_eq!(first.delayed_exchange, None);
    }

    #[tokio::test]
    async fn should_refuse_conflicting_arguments() {
        let (mut channel, _recovery) = channel_with_recovery();
        channel.expect_declare_exchange().returning(|_| Ok(()));
        channel.expect_declare_queue().returning(|_| Ok(()));
        channel.expect_bind_queue().returning(|_| Ok(()));

        let builder = TopologyBuilder::new(Arc::new(channel));
        builder
            .ensure_topology("orders", &dead_letter_opts())
            .await
            .unwrap();

        let without_dlx = TopologyOptions {
            durable: true,
            enable_dead_letter: false,
            delay: None,
        };
        let result = builder.ensure_topology("orders", &without_dlx).await;

        assert_eq!(
            result,
            Err(AmqpError::ConflictingQueueArguments("orders".to_owned()))
        );
    }

    #[tokio::test]
    async fn should_declare_delayed_queue_routing_back_to_main_queue() {
        let (mut channel, _recovery) = channel_with_recovery();
        channel
            .expect_declare_exchange()
            .withf(|def| def.name() == "orders.delayed")
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|def| {
                def.name() == "orders.delayed"
                    && def.message_ttl() == Some(2000)
                    && def.dead_letter_exchange() == Some("")
                    && def.dead_letter_routing_key() == Some("orders")
            })
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|def| def.name() == "orders")
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_bind_queue()
            .withf(|b| b.queue_name() == "orders.delayed" && b.key() == "orders.delayed")
            .times(1)
            .returning(|_| Ok(()));

        let builder = TopologyBuilder::new(Arc::new(channel));
        let opts = TopologyOptions {
            durable: true,
            enable_dead_letter: false,
            delay: Some(Duration::from_secs(2)),
        };

        let topology = builder.ensure_topology("orders", &opts).await.unwrap();
        assert_eq!(topology.delayed_exchange.as_deref(), Some("orders.delayed"));
        assert_eq!(topology.delayed_queue.as_deref(), Some("orders.delayed"));

        builder.ensure_topology("orders", &opts).await.unwrap();

        let other_delay = TopologyOptions {
            delay: Some(Duration::from_secs(5)),
            ..opts
        };
        assert_eq!(
            builder.ensure_topology("orders", &other_delay).await,
            Err(AmqpError::ConflictingQueueArguments(
                "orders.delayed".to_owned()
            ))
        );
    }

    #[tokio::test]
    async fn should_redeclare_after_recovery() {
        let (mut channel, recovery) = channel_with_recovery();
        channel
            .expect_declare_queue()
            .withf(|def| def.name() == "orders")
            .times(2)
            .returning(|_| Ok(()));

        let builder = TopologyBuilder::new(Arc::new(channel));
        let opts = TopologyOptions {
            durable: true,
            ..TopologyOptions::default()
        };

        builder.ensure_topology("orders", &opts).await.unwrap();
        builder.ensure_topology("orders", &opts).await.unwrap();

        recovery.send_modify(|generation| *generation += 1);

        builder.ensure_topology("orders", &opts).await.unwrap();
    }

    #[tokio::test]
    async fn should_not_cache_failed_declarations() {
        let (mut channel, _recovery) = channel_with_recovery();
        let mut calls = 0;
        channel
            .expect_declare_queue()
            .times(2)
            .returning(move |def| {
                calls += 1;
                if calls == 1 {
                    Err(AmqpError::DeclareQueueError(def.name().to_owned()))
                } else {
                    Ok(())
                }
            });

        let builder = TopologyBuilder::new(Arc::new(channel));
        let opts = TopologyOptions::default();

        assert_eq!(
            builder.ensure_topology("orders", &opts).await,
            Err(AmqpError::DeclareQueueError("orders".to_owned()))
        );
        assert!(builder.ensure_topology("orders", &opts).await.is_ok());
    }

    #[tokio::test]
    async fn should_reject_empty_queue_name() {
        let (channel, _recovery) = channel_with_recovery();
        let builder = TopologyBuilder::new(Arc::new(channel));

        assert!(matches!(
            builder.ensure_topology("", &dead_letter_opts()).await,
            Err(AmqpError::InvalidConfig(_))
        ));
    }
}
