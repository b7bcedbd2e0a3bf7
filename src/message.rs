// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! Outbound messages built by the publisher and inbound deliveries handed to
//! the delivery handler, together with the wire-level properties they carry.
//!
//! The retry count travels inside the message as the `x-retry-count` header.
//! There is no other record of it: a message moved between queues by hand
//! keeps whatever count it had, and one re-published without the header
//! starts again from zero.

use crate::errors::AmqpError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::{
    types::{AMQPValue, FieldTable, LongInt, ShortString},
    BasicProperties,
};
#[cfg(test)]
use mockall::automock;
use std::{fmt, sync::Arc, time::Duration};
use uuid::Uuid;

/// Header carrying the number of retries already performed
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Content type of every payload published by this crate
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode for persistent messages
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Returns the tag identifying a payload type on the wire: the last path
/// segment of the Rust type name, generics included.
pub fn type_tag<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let (path, generics) = match full.find('<') {
        Some(idx) => full.split_at(idx),
        None => (full, ""),
    };

    let name = path.rsplit("::").next().unwrap_or(path);
    format!("{}{}", name, generics)
}

/// A message ready to be written to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub type_tag: String,
    pub message_id: Uuid,
    pub timestamp_utc: DateTime<Utc>,
    pub persistent: bool,
    pub delay: Option<Duration>,
    pub retry_count: u32,
}

impl OutboundMessage {
    /// Creates a persistent message with a fresh id and the current time.
    pub fn new(payload: Vec<u8>, type_tag: &str) -> Self {
        OutboundMessage {
            payload,
            type_tag: type_tag.to_owned(),
            message_id: Uuid::new_v4(),
            timestamp_utc: Utc::now(),
            persistent: true,
            delay: None,
            retry_count: 0,
        }
    }

    /// Serializes `payload` as JSON, tagging it with its type name.
    pub fn json<T: serde::Serialize + ?Sized>(payload: &T) -> Result<Self, AmqpError> {
        let body = serde_json::to_vec(payload)
            .map_err(|err| AmqpError::SerializePayloadError(err.to_string()))?;

        Ok(OutboundMessage::new(body, &type_tag::<T>()))
    }

    /// Builds the next attempt of a failed delivery: same body, type and id,
    /// retry count incremented.
    pub fn retry_of(delivery: &InboundDelivery) -> Self {
        let message_id = delivery
            .message_id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id).ok())
            .unwrap_or_else(Uuid::new_v4);

        OutboundMessage {
            payload: delivery.body.clone(),
            type_tag: delivery.type_tag.clone(),
            message_id,
            timestamp_utc: Utc::now(),
            persistent: true,
            delay: None,
            retry_count: delivery.retry_count.saturating_add(1),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = if delay.is_zero() { None } else { Some(delay) };
        self
    }

    /// AMQP properties for this message. `headers` may already hold trace
    /// context; the retry count is added when non-zero.
    pub fn properties(&self, mut headers: FieldTable) -> BasicProperties {
        if self.retry_count > 0 {
            headers.insert(
                ShortString::from(AMQP_HEADERS_RETRY_COUNT),
                AMQPValue::LongInt(LongInt::try_from(self.retry_count).unwrap_or(LongInt::MAX)),
            );
        }

        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_type(ShortString::from(self.type_tag.clone()))
            .with_message_id(ShortString::from(self.message_id.to_string()))
            .with_timestamp(self.timestamp_utc.timestamp().max(0) as u64)
            .with_headers(headers);

        if self.persistent {
            props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        props
    }
}

/// Reads `x-retry-count` from message headers. Absent or unreadable values
/// count as zero.
pub fn retry_count_from(headers: Option<&FieldTable>) -> u32 {
    let Some(value) = headers.and_then(|h| h.inner().get(AMQP_HEADERS_RETRY_COUNT)) else {
        return 0;
    };

    let count: i64 = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or_default(),
        _ => 0,
    };

    u32::try_from(count.max(0)).unwrap_or(u32::MAX)
}

/// Settles a delivery on the broker.
///
/// Implementations must tolerate being called once per delivery only; the
/// delivery handler never settles the same delivery twice.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message received from a queue, owned by the delivery handler until it
/// is acked or nacked.
#[derive(Clone)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    pub type_tag: String,
    pub retry_count: u32,
    pub queue_name: String,
    pub headers: FieldTable,
    pub(crate) acker: Arc<dyn DeliveryAcker>,
}

impl InboundDelivery {
    /// Builds a delivery from the broker frame data.
    pub fn new(
        queue_name: &str,
        delivery_tag: u64,
        properties: &BasicProperties,
        body: Vec<u8>,
        acker: Arc<dyn DeliveryAcker>,
    ) -> Self {
        let headers = properties.headers().clone().unwrap_or_default();

        InboundDelivery {
            delivery_tag,
            body,
            message_id: properties.message_id().as_ref().map(|id| id.to_string()),
            type_tag: properties
                .kind()
                .as_ref()
                .map(|kind| kind.to_string())
                .unwrap_or_default(),
            retry_count: retry_count_from(Some(&headers)),
            queue_name: queue_name.to_owned(),
            headers,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("queue_name", &self.queue_name)
            .field("message_id", &self.message_id)
            .field("type_tag", &self.type_tag)
            .field("retry_count", &self.retry_count)
            .field("body_len", &self.body.len())
            .finish()
    }
}
