// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for Reliable Delivery
//!
//! This module provides the error type shared by every component of the
//! delivery subsystem. The `AmqpError` enum covers connection and channel
//! failures, topology declaration, configuration, publishing, payload
//! handling, acknowledgement and consumer registration.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Errors that leave the subsystem unusable (cannot connect, cannot declare
/// topology) are returned to the caller of `publish` / `start_consuming`.
/// Errors caused by a message or a handler are settled inside the subsystem
/// by ack, nack or dead-lettering and only logged.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// The connection attempt did not complete within the configured timeout
    #[error("connection attempt timed out")]
    ConnectionTimeout,

    /// Error creating or using a channel
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// A queue or exchange already exists with different arguments
    #[error("conflicting arguments for `{0}`")]
    ConflictingQueueArguments(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// The broker did not accept the publish within the configured timeout
    #[error("publish timed out")]
    PublishTimeout,

    /// A declare, consume or cancel call did not complete within the
    /// configured operation timeout
    #[error("broker operation `{0}` timed out")]
    OperationTimeout(String),

    /// Error serializing an outbound payload
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error parsing an inbound payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// A consumer is already registered for the queue
    #[error("consumer already registered for queue `{0}`")]
    ConsumerAlreadyRegistered(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    ConsumerCancelError(String),

    /// Invalid configuration value
    #[error("invalid configuration `{0}`")]
    InvalidConfig(String),
}

impl AmqpError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Connectivity and publish failures are transient, the client recovers
    /// from them on its own. Configuration, payload and registration errors
    /// will fail the same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_)
                | AmqpError::ConnectionTimeout
                | AmqpError::ChannelError(_)
                | AmqpError::PublishingError(_)
                | AmqpError::PublishTimeout
                | AmqpError::OperationTimeout(_)
                | AmqpError::AckMessageError
                | AmqpError::NackMessageError
        )
    }
}
