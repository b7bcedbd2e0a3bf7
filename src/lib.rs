// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Delivery
//!
//! Reliable message delivery on RabbitMQ: publishing with required message
//! properties, delayed delivery through TTL queues, a single consumer per
//! queue, bounded retries tracked in the `x-retry-count` header and
//! dead-lettering once retries are exhausted.

mod consumer;
mod otel;

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;

pub use crate::client::RabbitMQMessaging;
pub use crate::config::{ConfigLoader, RabbitMQConfigs};
pub use crate::dispatcher::ConsumerRegistration;
pub use crate::errors::AmqpError;
pub use crate::handler::{handler_fn, ConsumerHandler, HandlerError};
