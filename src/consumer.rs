// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! Turns every delivery of a subscription into exactly one settlement:
//! 1. decode the body into the handler's message type; a body that does not
//!    decode is rejected without requeue and never reaches the handler;
//! 2. run the handler;
//! 3. on success ack (reliable subscriptions only, the others are auto-acked
//!    by the broker);
//! 4. on failure of a reliable subscription wait the nack delay, then
//!    requeue a first delivery when one retry is allowed, or reject it so the
//!    queue dead-letters it. A redelivery is always rejected.
//!
//! Net effect with `max_retry = 1`: one automatic retry, then dead-letter.

use crate::{codec::Codec, errors::AmqpError, handler::ConsumerHandler, otel};
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
};
use opentelemetry::{
    context::FutureExt,
    trace::{Status, TraceContextExt},
};
use std::{borrow::Cow, marker::PhantomData, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

#[cfg(test)]
use mockall::automock;

/// Highest supported retry count
pub const MAX_RETRY: u8 = 1;

/// Settlement of a manually acknowledged delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl Acknowledge for Acker {
    async fn ack(&self) -> Result<(), AmqpError> {
        Acker::ack(self, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        Acker::nack(
            self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Acknowledged after the handler succeeded
    Ack,
    /// Nacked with requeue, the broker redelivers it
    Requeue,
    /// Nacked without requeue, the queue dead-letters it
    Reject,
    /// Settled by the broker on delivery (auto-ack subscription)
    AutoAcked,
}

/// Retry behaviour of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Manual ack/nack; otherwise the subscription is auto-acked
    pub reliable: bool,
    pub max_retry: u8,
    pub nack_delay: Duration,
}

impl RetryPolicy {
    /// Settlement after the handler failed.
    pub fn on_failure(&self, redelivered: bool) -> DeliveryOutcome {
        if !self.reliable {
            DeliveryOutcome::AutoAcked
        } else if redelivered || self.max_retry == 0 {
            DeliveryOutcome::Reject
        } else {
            DeliveryOutcome::Requeue
        }
    }

    /// Settlement of a body that does not decode.
    pub fn on_malformed(&self) -> DeliveryOutcome {
        if self.reliable {
            DeliveryOutcome::Reject
        } else {
            DeliveryOutcome::AutoAcked
        }
    }

    pub fn on_success(&self) -> DeliveryOutcome {
        if self.reliable {
            DeliveryOutcome::Ack
        } else {
            DeliveryOutcome::AutoAcked
        }
    }
}

/// Decodes deliveries into `M` and dispatches them to one handler.
pub struct Consumer<M, H, C> {
    name: String,
    handler: H,
    codec: C,
    policy: RetryPolicy,
    _msg: PhantomData<fn() -> M>,
}

impl<M, H, C> Consumer<M, H, C>
where
    M: Send + 'static,
    H: ConsumerHandler<M>,
    C: Codec<M>,
{
    /// Fails with [`AmqpError::MaxRetryTooMuch`] above one retry and with
    /// [`AmqpError::InvalidHandler`] for an empty name.
    pub fn new(name: &str, handler: H, codec: C, policy: RetryPolicy) -> Result<Self, AmqpError> {
        if policy.max_retry > MAX_RETRY {
            return Err(AmqpError::MaxRetryTooMuch(policy.max_retry));
        }

        if name.is_empty() {
            return Err(AmqpError::InvalidHandler("empty queue name".to_owned()));
        }

        Ok(Consumer {
            name: name.to_owned(),
            handler,
            codec,
            policy,
            _msg: PhantomData,
        })
    }

    /// Consumer of an error-sink queue: auto-acked, no retry.
    pub fn error_sink(name: &str, handler: H, codec: C) -> Result<Self, AmqpError> {
        Consumer::new(
            name,
            handler,
            codec,
            RetryPolicy {
                reliable: false,
                max_retry: 0,
                nack_delay: Duration::ZERO,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Consumes until the delivery stream ends.
    ///
    /// Every delivery is handled inside the trace context carried by its
    /// headers, under a consumer span named after the queue.
    pub async fn run(self, mut deliveries: mpsc::Receiver<Delivery>) {
        while let Some(delivery) = deliveries.recv().await {
            let cx = otel::consumer_context(&delivery.properties, &self.name);

            debug!(
                queue = self.name.as_str(),
                routing_key = delivery.routing_key.as_str(),
                redelivered = delivery.redelivered,
                "received"
            );

            let outcome = self
                .dispatch(&delivery.data, delivery.redelivered, &delivery.acker)
                .with_context(cx.clone())
                .await;

            let span = cx.span();
            match outcome {
                Ok(DeliveryOutcome::Ack | DeliveryOutcome::AutoAcked) => span.set_status(Status::Ok),
                Ok(outcome) => span.set_status(Status::Error {
                    description: Cow::from(format!("{outcome:?}")),
                }),
                Err(err) => {
                    error!(error = err.to_string(), "error to settle msg");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from(err.to_string()),
                    });
                }
            }
            span.end();
        }

        debug!(queue = self.name.as_str(), "delivery stream closed, consumer stopped");
    }

    /// Decodes one body, runs the handler and settles the delivery.
    pub async fn dispatch<A>(
        &self,
        data: &[u8],
        redelivered: bool,
        acker: &A,
    ) -> Result<DeliveryOutcome, AmqpError>
    where
        A: Acknowledge + ?Sized,
    {
        let msg = match self.codec.decode(data) {
            Ok(msg) => msg,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    body = %String::from_utf8_lossy(data),
                    "removing message from queue - reason: malformed payload"
                );
                let outcome = self.policy.on_malformed();
                settle(acker, outcome).await?;
                return Ok(outcome);
            }
        };

        match self.handler.exec(msg).await {
            Ok(()) => {
                let outcome = self.policy.on_success();
                settle(acker, outcome).await?;
                Ok(outcome)
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    queue = self.name.as_str(),
                    redelivered,
                    "handle message error"
                );

                let outcome = self.policy.on_failure(redelivered);
                if outcome != DeliveryOutcome::AutoAcked {
                    tokio::time::sleep(self.policy.nack_delay).await;
                }
                settle(acker, outcome).await?;
                Ok(outcome)
            }
        }
    }
}

async fn settle<A>(acker: &A, outcome: DeliveryOutcome) -> Result<(), AmqpError>
where
    A: Acknowledge + ?Sized,
{
    match outcome {
        DeliveryOutcome::Ack => acker.ack().await,
        DeliveryOutcome::Requeue => acker.nack(true).await,
        DeliveryOutcome::Reject => acker.nack(false).await,
        DeliveryOutcome::AutoAcked => Ok(()),
    }
}
