// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing [`AmqpChannel`], with the RabbitMQ
//! behaviors the delivery subsystem relies on: the default exchange, direct
//! bindings, dead-letter arguments, per-queue message TTL, prefetch,
//! requeue, consumer cancel and connection loss.

#![allow(dead_code)]

use amqp_delivery::{
    channel::{AmqpChannel, DeliveryStream},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{DeliveryAcker, InboundDelivery},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};

type Shared = Arc<Mutex<BrokerState>>;

#[derive(Clone)]
pub struct StoredMessage {
    id: u64,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
    pub enqueued_at: Instant,
}

struct MemConsumer {
    tag: String,
    prefetch: usize,
    unacked: usize,
    tx: mpsc::UnboundedSender<Result<InboundDelivery, AmqpError>>,
}

struct MemQueue {
    def: QueueDefinition,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<MemConsumer>,
    delivered: usize,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    epoch: u64,
    exchanges: HashSet<String>,
    queues: HashMap<String, MemQueue>,
    bindings: HashSet<(String, String, String)>,
    unacked: HashMap<u64, Unacked>,
    queue_declarations: HashMap<String, usize>,
    published: usize,
    dropped: usize,
}

#[derive(Clone)]
pub struct MemoryBroker {
    state: Shared,
    recovered: Arc<watch::Sender<u64>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker::new()
    }
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        let (recovered, _) = watch::channel(0);
        MemoryBroker {
            state: Arc::new(Mutex::new(BrokerState::default())),
            recovered: Arc::new(recovered),
        }
    }

    /// Drops every consumer as a lost connection would, requeues unacked
    /// deliveries and reports a recovery.
    pub fn kill_connection(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.epoch += 1;

            for queue in state.queues.values_mut() {
                for consumer in queue.consumers.drain(..) {
                    let _ = consumer
                        .tx
                        .send(Err(AmqpError::ChannelError("connection lost".to_owned())));
                }
            }

            let mut unacked: Vec<Unacked> = state.unacked.drain().map(|(_, u)| u).collect();
            unacked.sort_by_key(|u| std::cmp::Reverse(u.message.id));
            for u in unacked {
                if let Some(queue) = state.queues.get_mut(&u.queue) {
                    queue.ready.push_front(u.message);
                }
            }
        }

        self.recovered.send_modify(|generation| *generation += 1);
    }

    /// Publishes straight to a queue through the default exchange, bypassing
    /// any client-side serialization.
    pub fn inject(&self, queue: &str, body: &[u8], properties: BasicProperties) {
        let mut state = self.state.lock().unwrap();
        state.published += 1;
        route(&self.state, &mut state, "", queue, body.to_vec(), properties);
    }

    pub fn ready(&self, queue: &str) -> Vec<StoredMessage> {
        let state = self.state.lock().unwrap();
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.ready(queue).len()
    }

    /// Number of deliveries handed to consumers of `queue`, redeliveries
    /// included.
    pub fn delivered(&self, queue: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.queues.get(queue).map(|q| q.delivered).unwrap_or_default()
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unwrap().unacked.len()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    pub fn queue_definition(&self, queue: &str) -> Option<QueueDefinition> {
        let state = self.state.lock().unwrap();
        state.queues.get(queue).map(|q| q.def.clone())
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state.lock().unwrap().exchanges.contains(exchange)
    }

    pub fn has_binding(&self, exchange: &str, routing_key: &str, queue: &str) -> bool {
        self.state.lock().unwrap().bindings.contains(&(
            exchange.to_owned(),
            routing_key.to_owned(),
            queue.to_owned(),
        ))
    }

    pub fn queue_declarations(&self, queue: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .queue_declarations
            .get(queue)
            .copied()
            .unwrap_or_default()
    }

    pub fn published(&self) -> usize {
        self.state.lock().unwrap().published
    }

    pub fn dropped(&self) -> usize {
        self.state.lock().unwrap().dropped
    }
}

/// Routes a message the way RabbitMQ does for the default exchange and
/// direct exchanges. Unroutable messages are dropped.
fn route(
    shared: &Shared,
    state: &mut BrokerState,
    exchange: &str,
    routing_key: &str,
    body: Vec<u8>,
    properties: BasicProperties,
) {
    let targets: Vec<String> = if exchange.is_empty() {
        if state.queues.contains_key(routing_key) {
            vec![routing_key.to_owned()]
        } else {
            vec![]
        }
    } else {
        state
            .bindings
            .iter()
            .filter(|(ex, key, _)| ex == exchange && key == routing_key)
            .map(|(_, _, queue)| queue.clone())
            .collect()
    };

    if targets.is_empty() {
        state.dropped += 1;
        return;
    }

    for target in targets {
        state.next_id += 1;
        let message = StoredMessage {
            id: state.next_id,
            body: body.clone(),
            properties: properties.clone(),
            enqueued_at: Instant::now(),
        };
        enqueue(shared, state, &target, message);
    }
}

fn enqueue(shared: &Shared, state: &mut BrokerState, queue: &str, message: StoredMessage) {
    let Some(q) = state.queues.get_mut(queue) else {
        state.dropped += 1;
        return;
    };

    if let Some(ttl) = q.def.message_ttl() {
        let shared = shared.clone();
        let queue = queue.to_owned();
        let id = message.id;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ttl.max(0) as u64)).await;
            expire(&shared, &queue, id);
        });
    }

    q.ready.push_back(message);
    dispatch(shared, state, queue);
}

fn expire(shared: &Shared, queue: &str, id: u64) {
    let mut state = shared.lock().unwrap();

    let Some(q) = state.queues.get_mut(queue) else {
        return;
    };
    let Some(pos) = q.ready.iter().position(|m| m.id == id) else {
        return;
    };
    let Some(message) = q.ready.remove(pos) else {
        return;
    };

    dead_letter(shared, &mut state, queue, message);
}

fn dead_letter(shared: &Shared, state: &mut BrokerState, queue: &str, message: StoredMessage) {
    let Some(def) = state.queues.get(queue).map(|q| q.def.clone()) else {
        return;
    };

    match def.dead_letter_exchange() {
        Some(exchange) => {
            let routing_key = def.dead_letter_routing_key().unwrap_or(queue).to_owned();
            route(
                shared,
                state,
                exchange,
                &routing_key,
                message.body,
                message.properties,
            );
        }
        None => state.dropped += 1,
    }
}

fn dispatch(shared: &Shared, state: &mut BrokerState, queue: &str) {
    loop {
        let epoch = state.epoch;
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        if q.ready.is_empty() {
            return;
        }
        let Some(consumer) = q.consumers.iter_mut().find(|c| c.unacked < c.prefetch) else {
            return;
        };
        let Some(message) = q.ready.pop_front() else {
            return;
        };

        consumer.unacked += 1;
        q.delivered += 1;

        let acker = Arc::new(MemAcker {
            shared: shared.clone(),
            id: message.id,
            epoch,
        });
        let delivery = InboundDelivery::new(
            queue,
            message.id,
            &message.properties,
            message.body.clone(),
            acker,
        );

        let sent = consumer.tx.send(Ok(delivery)).is_ok();
        let consumer_tag = consumer.tag.clone();

        if sent {
            state.unacked.insert(
                message.id,
                Unacked {
                    queue: queue.to_owned(),
                    consumer_tag,
                    message,
                },
            );
        } else {
            q.delivered -= 1;
            q.ready.push_front(message);
            q.consumers.retain(|c| c.tag != consumer_tag);
        }
    }
}

struct MemAcker {
    shared: Shared,
    id: u64,
    epoch: u64,
}

impl MemAcker {
    fn settle(&self) -> Option<Unacked> {
        let mut state = self.shared.lock().unwrap();
        if state.epoch != self.epoch {
            return None;
        }

        let unacked = state.unacked.remove(&self.id)?;
        if let Some(q) = state.queues.get_mut(&unacked.queue) {
            if let Some(c) = q
                .consumers
                .iter_mut()
                .find(|c| c.tag == unacked.consumer_tag)
            {
                c.unacked = c.unacked.saturating_sub(1);
            }
        }

        Some(unacked)
    }
}

#[async_trait]
impl DeliveryAcker for MemAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        let unacked = self.settle().ok_or(AmqpError::AckMessageError)?;

        let mut state = self.shared.lock().unwrap();
        dispatch(&self.shared, &mut state, &unacked.queue);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        let unacked = self.settle().ok_or(AmqpError::NackMessageError)?;

        let mut state = self.shared.lock().unwrap();
        if requeue {
            if let Some(q) = state.queues.get_mut(&unacked.queue) {
                q.ready.push_front(unacked.message);
            }
        } else {
            dead_letter(&self.shared, &mut state, &unacked.queue, unacked.message);
        }
        dispatch(&self.shared, &mut state, &unacked.queue);
        Ok(())
    }
}

#[async_trait]
impl AmqpChannel for MemoryBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.state
            .lock()
            .unwrap()
            .exchanges
            .insert(def.name().to_owned());
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        *state
            .queue_declarations
            .entry(def.name().to_owned())
            .or_default() += 1;

        match state.queues.get(def.name()) {
            Some(existing) if &existing.def != def => Err(AmqpError::ConflictingQueueArguments(
                def.name().to_owned(),
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name().to_owned(),
                    MemQueue {
                        def: def.clone(),
                        ready: VecDeque::new(),
                        consumers: vec![],
                        delivered: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        if !state.queues.contains_key(binding.queue_name())
            || !state.exchanges.contains(binding.exchange_name())
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            ));
        }

        state.bindings.insert((
            binding.exchange_name().to_owned(),
            binding.key().to_owned(),
            binding.queue_name().to_owned(),
        ));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        if !exchange.is_empty() && !state.exchanges.contains(exchange) {
            return Err(AmqpError::PublishingError(format!(
                "no exchange '{}'",
                exchange
            )));
        }

        state.published += 1;
        route(
            &self.state,
            &mut state,
            exchange,
            routing_key,
            payload.to_vec(),
            properties,
        );
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.state.lock().unwrap();
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        };

        let (tx, rx) = mpsc::unbounded_channel();
        q.consumers.push(MemConsumer {
            tag: consumer_tag.to_owned(),
            prefetch: usize::from(prefetch.max(1)),
            unacked: 0,
            tx,
        });
        dispatch(&self.state, &mut state, queue);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.tag != consumer_tag);
        }
        Ok(())
    }

    fn recovered(&self) -> watch::Receiver<u64> {
        self.recovered.subscribe()
    }
}

/// Polls `condition` until it holds or `timeout` elapsed.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Awaits `fut`, failing the test when it does not finish within `timeout`.
pub async fn within<T>(timeout: Duration, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(timeout, fut).await {
        Ok(value) => value,
        Err(_) => panic!("timed out after {:?}", timeout),
    }
}
