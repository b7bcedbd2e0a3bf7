// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! Callers process payloads through [`ConsumerHandler`]. The handler's
//! answer drives the delivery outcome:
//!
//! - `Ok(true)`: the message is acked;
//! - `Ok(false)`, `Err(_)` or a panic: the message is retried, then
//!   dead-lettered once retries are exhausted.
//!
//! Payloads that cannot be deserialized never reach the handler.

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use std::{future::Future, marker::PhantomData, panic::AssertUnwindSafe};

/// Error returned by a failing handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one payload of type `T`.
#[async_trait]
pub trait ConsumerHandler<T: Send + 'static>: Send + Sync {
    /// Returns whether the payload was processed successfully.
    async fn exec(&self, payload: T) -> Result<bool, HandlerError>;
}

/// A [`ConsumerHandler`] backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wraps an async closure into a [`ConsumerHandler`].
///
/// ```ignore
/// let handler = handler_fn(|order: OrderPlaced| async move {
///     Ok(order.id > 0)
/// });
/// ```
pub fn handler_fn<T, F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<bool, HandlerError>>,
{
    FnHandler { f }
}

#[async_trait]
impl<T, F, Fut> ConsumerHandler<T> for FnHandler<F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, HandlerError>> + Send + 'static,
{
    async fn exec(&self, payload: T) -> Result<bool, HandlerError> {
        (self.f)(payload).await
    }
}

/// What a handler made of a delivery body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HandlerResult {
    Handled,
    Declined,
    Failed(String),
    Malformed(String),
}

/// Type-erased handler operating on raw delivery bodies.
#[async_trait]
pub(crate) trait DeliveryHandler: Send + Sync {
    async fn handle(&self, body: &[u8]) -> HandlerResult;
}

/// Deserializes JSON bodies into `T` before calling the inner handler.
pub(crate) struct JsonHandler<T, H> {
    handler: H,
    payload: PhantomData<fn() -> T>,
}

impl<T, H> JsonHandler<T, H> {
    pub(crate) fn new(handler: H) -> Self {
        JsonHandler {
            handler,
            payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> DeliveryHandler for JsonHandler<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: ConsumerHandler<T> + 'static,
{
    async fn handle(&self, body: &[u8]) -> HandlerResult {
        let payload = match serde_json::from_slice::<T>(body) {
            Ok(payload) => payload,
            Err(err) => return HandlerResult::Malformed(err.to_string()),
        };

        match AssertUnwindSafe(self.handler.exec(payload))
            .catch_unwind()
            .await
        {
            Ok(Ok(true)) => HandlerResult::Handled,
            Ok(Ok(false)) => HandlerResult::Declined,
            Ok(Err(err)) => HandlerResult::Failed(err.to_string()),
            Err(_) => HandlerResult::Failed("handler panicked".to_owned()),
        }
    }
}
