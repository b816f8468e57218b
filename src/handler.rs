// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! A handler receives one decoded message and reports success or failure.
//! The message type is a generic parameter, so a callback of the wrong shape
//! is rejected by the compiler at registration. Plain async closures are
//! handlers too:
//!
//! ```ignore
//! broker
//!     .register_subscribe_handler("billing", "orders.created", |order: OrderCreated| async move {
//!         charge(order).await?;
//!         Ok(())
//!     }, SubscribeOptions::default().reliable())
//!     .await?;
//! ```

use async_trait::async_trait;
use std::{error::Error, future::Future};

/// Business error returned by a handler; it drives the ack/nack decision and
/// is logged, never propagated.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Callback invoked for every decoded message of type `M`.
#[async_trait]
pub trait ConsumerHandler<M>: Send + Sync + 'static {
    async fn exec(&self, msg: M) -> Result<(), HandlerError>;
}

#[async_trait]
impl<M, F, Fut> ConsumerHandler<M> for F
where
    M: Send + 'static,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, msg: M) -> Result<(), HandlerError> {
        (self)(msg).await
    }
}
