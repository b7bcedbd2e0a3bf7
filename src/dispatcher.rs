// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Registry
//!
//! Tracks at most one active consumer per queue name within the process.
//! Registering a second consumer for a queue fails with
//! `ConsumerAlreadyRegistered`; stopping is idempotent.
//!
//! Each consumer runs its own delivery loop. Deliveries are processed one
//! at a time and the broker never holds more than `prefetch_count`
//! unacknowledged deliveries for the consumer.
//!
//! When the connection manager reports a recovery, every registration
//! subscribed before that recovery is re-declared and re-subscribed with its
//! original consumer tag and handler.

use crate::{
    channel::{AmqpChannel, DeliveryStream},
    config::RabbitMQConfigs,
    consumer::consume,
    errors::AmqpError,
    handler::{ConsumerHandler, DeliveryHandler, JsonHandler},
    otel::CONSUMER_TRACER,
    retry::RetryCoordinator,
    topology::{TopologyBuilder, TopologyOptions},
};
use futures_util::{future::join_all, FutureExt, StreamExt};
use opentelemetry::global;
use serde::de::DeserializeOwned;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Identifies an active consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRegistration {
    pub queue_name: String,
    pub consumer_tag: String,
}

struct ActiveConsumer {
    registration: ConsumerRegistration,
    handler: Arc<dyn DeliveryHandler>,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    /// Recovery generation the broker consumer was created in.
    generation: u64,
}

/// RabbitMQ consumer registry.
pub struct RabbitMQDispatcher {
    channel: Arc<dyn AmqpChannel>,
    topology: Arc<TopologyBuilder>,
    retry: Arc<RetryCoordinator>,
    prefetch: u16,
    enable_dead_letter: bool,
    tag_prefix: String,
    consumers: Mutex<HashMap<String, ActiveConsumer>>,
}

impl RabbitMQDispatcher {
    /// Creates the registry and starts watching for connection recoveries.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(
        channel: Arc<dyn AmqpChannel>,
        topology: Arc<TopologyBuilder>,
        retry: Arc<RetryCoordinator>,
        cfg: &RabbitMQConfigs,
    ) -> Arc<RabbitMQDispatcher> {
        let recovered = channel.recovered();

        let dispatcher = Arc::new(RabbitMQDispatcher {
            channel,
            topology,
            retry,
            prefetch: cfg.prefetch_count,
            enable_dead_letter: cfg.enable_dead_letter_queue,
            tag_prefix: cfg.connection_name.clone(),
            consumers: Mutex::new(HashMap::default()),
        });

        tokio::spawn(watch_recovery(Arc::downgrade(&dispatcher), recovered));

        dispatcher
    }

    /// Starts consuming `queue`, handing every JSON payload to `handler`.
    ///
    /// Declares the queue topology first, so consuming may start before
    /// anything was published.
    pub async fn start_consuming<T, H>(
        &self,
        queue: &str,
        handler: H,
    ) -> Result<ConsumerRegistration, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: ConsumerHandler<T> + 'static,
    {
        let mut consumers = self.consumers.lock().await;

        if consumers.contains_key(queue) {
            warn!(queue, "consumer already registered");
            return Err(AmqpError::ConsumerAlreadyRegistered(queue.to_owned()));
        }

        let handler: Arc<dyn DeliveryHandler> = Arc::new(JsonHandler::<T, H>::new(handler));
        let registration = ConsumerRegistration {
            queue_name: queue.to_owned(),
            consumer_tag: format!("{}.{}.{}", self.tag_prefix, queue, Uuid::new_v4()),
        };

        let (stop, stop_rx) = watch::channel(false);
        let (task, generation) = self.subscribe(&registration, handler.clone(), stop_rx).await?;

        info!(
            queue,
            consumer_tag = registration.consumer_tag.as_str(),
            "consumer started"
        );

        consumers.insert(
            queue.to_owned(),
            ActiveConsumer {
                registration: registration.clone(),
                handler,
                stop,
                tasks: vec![task],
                generation,
            },
        );

        Ok(registration)
    }

    /// Stops consuming `queue`.
    ///
    /// Cancels the broker consumer and signals the delivery loop, then
    /// returns without waiting: a delivery being handled is settled
    /// normally, deliveries already buffered are nacked with requeue. A
    /// queue without consumer is a no-op.
    pub async fn stop_consuming(&self, queue: &str) -> Result<(), AmqpError> {
        let active = self.consumers.lock().await.remove(queue);

        match active {
            Some(active) => {
                self.stop(&active).await;
                info!(queue, "consumer stopped");
            }
            None => debug!(queue, "no consumer to stop"),
        }

        Ok(())
    }

    /// Stops every consumer and waits until their delivery loops finished.
    ///
    /// Fails with `InternalError` when a delivery loop panicked.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        let active: Vec<ActiveConsumer> = self
            .consumers
            .lock()
            .await
            .drain()
            .map(|(_, active)| active)
            .collect();

        let mut tasks = vec![];
        for consumer in active {
            self.stop(&consumer).await;
            tasks.extend(consumer.tasks);
        }

        let mut failed = false;
        for res in join_all(tasks).await {
            if let Err(err) = res {
                error!(error = err.to_string(), "consumer task failed");
                failed = true;
            }
        }

        if failed {
            return Err(AmqpError::InternalError);
        }

        Ok(())
    }

    /// Registrations currently tracked, in no particular order.
    pub async fn registrations(&self) -> Vec<ConsumerRegistration> {
        self.consumers
            .lock()
            .await
            .values()
            .map(|active| active.registration.clone())
            .collect()
    }

    async fn stop(&self, active: &ActiveConsumer) {
        let tag = active.registration.consumer_tag.as_str();

        if let Err(err) = self.channel.cancel(tag).await {
            warn!(
                error = err.to_string(),
                consumer_tag = tag,
                "error to cancel consumer"
            );
        }

        let _ = active.stop.send(true);
    }

    /// Declares the queue topology and spawns a delivery loop for
    /// `registration`. Returns the loop and the recovery generation the
    /// broker consumer was created in.
    async fn subscribe(
        &self,
        registration: &ConsumerRegistration,
        handler: Arc<dyn DeliveryHandler>,
        stop: watch::Receiver<bool>,
    ) -> Result<(JoinHandle<()>, u64), AmqpError> {
        let queue = registration.queue_name.as_str();

        self.topology
            .ensure_topology(
                queue,
                &TopologyOptions {
                    durable: true,
                    enable_dead_letter: self.enable_dead_letter,
                    delay: None,
                },
            )
            .await?;

        let stream = self
            .channel
            .consume(queue, &registration.consumer_tag, self.prefetch)
            .await?;
        let generation = *self.channel.recovered().borrow();

        let task = tokio::spawn(run_consumer(
            registration.clone(),
            stream,
            handler,
            self.retry.clone(),
            stop,
        ));

        Ok((task, generation))
    }

    /// Re-subscribes every registration whose broker consumer predates
    /// recovery `generation` or whose delivery loop ended.
    async fn resubscribe_all(&self, generation: u64) {
        let mut consumers = self.consumers.lock().await;

        for active in consumers.values_mut() {
            let running = active.tasks.iter().any(|task| !task.is_finished());
            if active.generation >= generation && running {
                debug!(
                    queue = active.registration.queue_name.as_str(),
                    generation, "consumer already subscribed on the recovered channel"
                );
                continue;
            }

            let (stop, stop_rx) = watch::channel(false);
            // the previous loop ends once its sender is dropped
            let _ = active.stop.send(true);
            active.stop = stop;
            active.tasks.retain(|task| !task.is_finished());

            match self
                .subscribe(&active.registration, active.handler.clone(), stop_rx)
                .await
            {
                Ok((task, subscribed_in)) => {
                    info!(
                        queue = active.registration.queue_name.as_str(),
                        consumer_tag = active.registration.consumer_tag.as_str(),
                        "consumer resubscribed"
                    );
                    active.tasks.push(task);
                    active.generation = subscribed_in;
                }
                Err(err) => error!(
                    error = err.to_string(),
                    queue = active.registration.queue_name.as_str(),
                    "error to resubscribe consumer"
                ),
            }
        }
    }
}

async fn watch_recovery(dispatcher: Weak<RabbitMQDispatcher>, mut recovered: watch::Receiver<u64>) {
    while recovered.changed().await.is_ok() {
        let generation = *recovered.borrow_and_update();

        let Some(dispatcher) = dispatcher.upgrade() else {
            break;
        };

        debug!(generation, "connection recovered, resubscribing consumers");
        dispatcher.resubscribe_all(generation).await;
    }
}

async fn run_consumer(
    registration: ConsumerRegistration,
    stream: DeliveryStream,
    handler: Arc<dyn DeliveryHandler>,
    retry: Arc<RetryCoordinator>,
    mut stop: watch::Receiver<bool>,
) {
    let tracer = global::tracer(CONSUMER_TRACER);
    let queue = registration.queue_name.as_str();
    let mut stream = stream.fuse();

    loop {
        tokio::select! {
            biased;

            _ = stop.changed() => break,

            next = stream.next() => match next {
                Some(Ok(delivery)) => {
                    if let Err(err) = consume(&tracer, &delivery, handler.as_ref(), &retry).await {
                        error!(error = err.to_string(), queue, "error consume msg");
                    }
                }
                Some(Err(err)) => {
                    error!(error = err.to_string(), queue, "consumer stream failed");
                    break;
                }
                None => {
                    debug!(queue, "consumer stream ended");
                    break;
                }
            },
        }
    }

    // hand buffered deliveries back to the broker
    while let Some(Some(next)) = stream.next().now_or_never() {
        if let Ok(delivery) = next {
            if let Err(err) = delivery.nack(true).await {
                error!(error = err.to_string(), queue, "error to requeue buffered msg");
            }
        }
    }

    debug!(
        queue,
        consumer_tag = registration.consumer_tag.as_str(),
        "delivery loop finished"
    );
}
