// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Handler
//!
//! Runs one delivery through its life cycle:
//!
//! ```text
//! Received -> Deserializing -> Processing -> Acked | Retrying | DeadLettered
//!                          \-> Rejected
//! ```
//!
//! Every path ends in an ack or a nack. Bodies that cannot be deserialized
//! are rejected without requeue and land in the dead-letter queue without
//! consuming a retry attempt. Handler failures go through the
//! [`RetryCoordinator`].

use crate::{
    errors::AmqpError,
    handler::{DeliveryHandler, HandlerResult},
    message::InboundDelivery,
    otel,
    retry::{DeliveryOutcome, RetryCoordinator},
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::borrow::Cow;
use tracing::{debug, error, warn};

/// Processes a delivery and settles it on the broker.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &InboundDelivery,
    handler: &dyn DeliveryHandler,
    retry: &RetryCoordinator,
) -> Result<DeliveryOutcome, AmqpError> {
    let span_name = if delivery.type_tag.is_empty() {
        delivery.queue_name.as_str()
    } else {
        delivery.type_tag.as_str()
    };
    let (_ctx, mut span) = otel::new_span(&delivery.headers, tracer, span_name);

    debug!(
        queue = delivery.queue_name.as_str(),
        delivery_tag = delivery.delivery_tag,
        msg_type = delivery.type_tag.as_str(),
        retry_count = delivery.retry_count,
        "received"
    );

    let result = match handler.handle(&delivery.body).await {
        HandlerResult::Handled => {
            debug!("message successfully processed");
            delivery.ack().await.map(|_| DeliveryOutcome::Acked)
        }
        HandlerResult::Malformed(reason) => {
            warn!(
                queue = delivery.queue_name.as_str(),
                delivery_tag = delivery.delivery_tag,
                message_id = delivery.message_id.as_deref().unwrap_or_default(),
                reason = reason.as_str(),
                "poison message, removing from queue"
            );
            span.record_error(&AmqpError::ParsePayloadError(reason));
            delivery.nack(false).await.map(|_| DeliveryOutcome::Rejected)
        }
        HandlerResult::Declined => retry.handle_failure(delivery, "handler declined").await,
        HandlerResult::Failed(reason) => {
            span.record_error(&AmqpError::InternalError);
            retry.handle_failure(delivery, &reason).await
        }
    };

    match &result {
        Ok(DeliveryOutcome::Acked) => span.set_status(Status::Ok),
        Ok(DeliveryOutcome::Retrying { .. }) => span.set_status(Status::Error {
            description: Cow::from("msg sent to retry"),
        }),
        Ok(DeliveryOutcome::DeadLettered) => span.set_status(Status::Error {
            description: Cow::from("msg sent to dlq"),
        }),
        Ok(DeliveryOutcome::Rejected) => span.set_status(Status::Error {
            description: Cow::from("msg rejected, bad format"),
        }),
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = delivery.queue_name.as_str(),
                delivery_tag = delivery.delivery_tag,
                "error settling msg"
            );
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from("error to settle msg"),
            });
        }
    }
    span.end();

    result
}
