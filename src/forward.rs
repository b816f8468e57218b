// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Forwarder
//!
//! Drains a bounded number of messages from a source queue and republishes
//! them into a destination exchange, one at a time, with confirm-gated
//! handoff: the source message is acked only once the destination confirms
//! (or reports the message unroutable). Anything else rejects the source
//! message without requeue, so a poisoned batch cannot loop forever.
//!
//! Used to replay dead-lettered messages ([`retry_error_queue`]) or to mirror
//! a queue ([`copy_queue`]).

use crate::{
    connection::Connection,
    consumer::Acknowledge,
    errors::AmqpError,
    publisher::{await_confirm, ConfirmOutcome},
    queue::ERROR_TOPIC_PREFIX,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions},
    types::FieldTable,
    BasicProperties,
};
use std::time::Duration;
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

/// Consumer tag of the forwarder on the source queue
pub const SHOVEL_CONSUMER_TAG: &str = "shovel";

/// Routing key transform applied while forwarding.
pub type RouteKeyConverter = fn(&str) -> String;

/// Message transform applied while forwarding.
pub type MessageConverter = fn(&SourceDelivery) -> Publishing;

/// A message taken from the source queue, still unsettled.
pub struct SourceDelivery {
    pub routing_key: String,
    pub delivery_tag: u64,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    pub acker: Box<dyn Acknowledge>,
}

/// A message about to be published to the destination.
#[derive(Debug, Clone, Default)]
pub struct Publishing {
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait ForwardSource: Send {
    /// Next delivery, `None` once the source stream is gone.
    async fn next(&mut self) -> Option<SourceDelivery>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ForwardDestination: Send + Sync {
    /// Publishes and waits for the broker's answer.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
    ) -> Result<ConfirmOutcome, AmqpError>;
}

/// Result of a forwarding run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardReport {
    /// Confirmed by the destination and acked on the source
    pub forwarded: usize,
    /// Rejected on the source
    pub rejected: usize,
}

impl ForwardReport {
    pub fn total(&self) -> usize {
        self.forwarded + self.rejected
    }
}

/// Moves `count` messages from `source` to `exchange` on `destination`.
///
/// Fails with [`AmqpError::ForwardSourceClosed`] when the source ends before
/// `count` messages were taken, and with the destination error when a publish
/// cannot be issued at all. A negative or missing confirm only rejects the
/// message at hand.
///
/// # Parameters
/// * `source` - Queue the messages are taken from
/// * `destination` - Confirming publisher on the target broker
/// * `exchange` - Exchange every message is published to
/// * `count` - Number of messages to take from the source
/// * `route_key` - Routing key transform
/// * `message` - Message transform
///
/// # Returns
/// A [`ForwardReport`] with the forwarded and rejected counts
pub async fn forward_batch<S, D>(
    source: &mut S,
    destination: &D,
    exchange: &str,
    count: usize,
    route_key: RouteKeyConverter,
    message: MessageConverter,
) -> Result<ForwardReport, AmqpError>
where
    S: ForwardSource + ?Sized,
    D: ForwardDestination + ?Sized,
{
    let mut report = ForwardReport::default();

    while report.total() < count {
        let Some(delivery) = source.next().await else {
            error!(counts = report.total(), "source channel closed before the batch completed");
            return Err(AmqpError::ForwardSourceClosed(report.total()));
        };

        let key = route_key(&delivery.routing_key);
        let outcome = destination.publish(exchange, &key, message(&delivery)).await;

        info!(
            counts = report.total() + 1,
            route_key = delivery.routing_key.as_str(),
            delivery_tag = delivery.delivery_tag,
            "forward"
        );

        match outcome {
            Ok(ConfirmOutcome::Acked | ConfirmOutcome::Returned) => {
                delivery.acker.ack().await?;
                report.forwarded += 1;
            }
            Ok(outcome) => {
                warn!(?outcome, delivery_tag = delivery.delivery_tag, "destination did not confirm");
                delivery.acker.nack(false).await?;
                report.rejected += 1;
            }
            Err(AmqpError::PublishConfirmTimeout) => {
                warn!(delivery_tag = delivery.delivery_tag, "destination confirm timed out");
                delivery.acker.nack(false).await?;
                report.rejected += 1;
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to publish to destination");
                if let Err(nack_err) = delivery.acker.nack(false).await {
                    error!(error = nack_err.to_string(), "failure to reject source message");
                }
                return Err(err);
            }
        }
    }

    info!(counts = report.total(), forwarded = report.forwarded, "finished forward message");
    Ok(report)
}

/// Source queue consumed with manual ack, one message in flight.
pub struct QueueSource {
    consumer: lapin::Consumer,
}

impl QueueSource {
    pub async fn open(channel: &lapin::Channel, queue: &str) -> Result<QueueSource, AmqpError> {
        channel
            .basic_qos(1, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to set source prefetch");
                AmqpError::QoSDeclarationError(err.to_string())
            })?;

        let consumer = channel
            .basic_consume(
                queue,
                SHOVEL_CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to consume source queue");
                AmqpError::ConsumerDeclarationError(err.to_string())
            })?;

        Ok(QueueSource { consumer })
    }
}

#[async_trait]
impl ForwardSource for QueueSource {
    async fn next(&mut self) -> Option<SourceDelivery> {
        match self.consumer.next().await? {
            Ok(delivery) => Some(SourceDelivery {
                routing_key: delivery.routing_key.as_str().to_owned(),
                delivery_tag: delivery.delivery_tag,
                properties: delivery.properties,
                data: delivery.data,
                acker: Box::new(delivery.acker),
            }),
            Err(err) => {
                error!(error = err.to_string(), "error to receive from source queue");
                None
            }
        }
    }
}

/// Destination channel in confirm mode.
pub struct ConfirmingDestination {
    channel: lapin::Channel,
    confirm_timeout: Duration,
}

impl ConfirmingDestination {
    pub async fn open(
        channel: lapin::Channel,
        confirm_timeout: Duration,
    ) -> Result<ConfirmingDestination, AmqpError> {
        channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable confirms on destination");
                AmqpError::ChannelError(err.to_string())
            })?;

        Ok(ConfirmingDestination {
            channel,
            confirm_timeout,
        })
    }
}

#[async_trait]
impl ForwardDestination for ConfirmingDestination {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
    ) -> Result<ConfirmOutcome, AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &publishing.data,
                publishing.properties,
            )
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        await_confirm(confirm, self.confirm_timeout).await
    }
}

/// Settings of one forwarding run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSettings {
    pub src_url: String,
    pub dst_url: String,
    pub src_queue: String,
    pub dst_exchange: String,
    pub count: usize,
    pub confirm_timeout: Duration,
}

/// Forwards `count` messages between two brokers, using dedicated
/// connections that are closed when the run ends.
///
/// # Parameters
/// * `settings` - Brokers, queue, exchange, count and confirm timeout
/// * `route_key` - Routing key transform
/// * `message` - Message transform
///
/// # Returns
/// A [`ForwardReport`], or the first dial, setup or publish error
pub async fn forward(
    settings: &ForwardSettings,
    route_key: RouteKeyConverter,
    message: MessageConverter,
) -> Result<ForwardReport, AmqpError> {
    let source = Connection::dial(&settings.src_url, SHOVEL_CONSUMER_TAG).await?;
    let destination = match Connection::dial(&settings.dst_url, SHOVEL_CONSUMER_TAG).await {
        Ok(destination) => destination,
        Err(err) => {
            if let Err(close_err) = source.close().await {
                error!(error = close_err.to_string(), "failure to close source connection");
            }
            return Err(err);
        }
    };

    let result = run(settings, &source, &destination, route_key, message).await;

    for conn in [&source, &destination] {
        if let Err(err) = conn.close().await {
            error!(error = err.to_string(), "failure to close forward connection");
        }
    }

    result
}

async fn run(
    settings: &ForwardSettings,
    source: &Connection,
    destination: &Connection,
    route_key: RouteKeyConverter,
    message: MessageConverter,
) -> Result<ForwardReport, AmqpError> {
    let src_channel = source.channel(false).await?;
    let dst_channel = destination.channel(false).await?;

    let mut queue = QueueSource::open(&src_channel.raw().await, &settings.src_queue).await?;
    let confirming = ConfirmingDestination::open(dst_channel.raw().await, settings.confirm_timeout).await?;

    forward_batch(
        &mut queue,
        &confirming,
        &settings.dst_exchange,
        settings.count,
        route_key,
        message,
    )
    .await
}

/// Replays dead-lettered messages, restoring their original routing key.
///
/// # Parameters
/// * `settings` - Usually an error queue as source and the primary exchange
///   as destination
///
/// # Returns
/// A [`ForwardReport`] of the run
pub async fn retry_error_queue(settings: &ForwardSettings) -> Result<ForwardReport, AmqpError> {
    forward(settings, error_route_key, same_message).await
}

/// Copies messages keeping their routing key.
///
/// # Parameters
/// * `settings` - Source queue and destination exchange
///
/// # Returns
/// A [`ForwardReport`] of the run
pub async fn copy_queue(settings: &ForwardSettings) -> Result<ForwardReport, AmqpError> {
    forward(settings, same_route_key, same_message).await
}

/// Strips the `error.` prefix added when a message is dead-lettered.
pub fn error_route_key(key: &str) -> String {
    key.strip_prefix(ERROR_TOPIC_PREFIX).unwrap_or(key).to_owned()
}

pub fn same_route_key(key: &str) -> String {
    key.to_owned()
}

/// Copies every property, headers included, and the body.
pub fn same_message(delivery: &SourceDelivery) -> Publishing {
    Publishing {
        properties: delivery.properties.clone(),
        data: delivery.data.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::MockAcknowledge;
    use lapin::types::ShortString;
    use mockall::predicate::eq;
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    #[derive(Default)]
    struct Counters {
        acks: AtomicUsize,
        rejects: AtomicUsize,
    }

    struct VecSource(VecDeque<SourceDelivery>);

    #[async_trait]
    impl ForwardSource for VecSource {
        async fn next(&mut self) -> Option<SourceDelivery> {
            self.0.pop_front()
        }
    }

    fn delivery(tag: u64, key: &str, counters: &Arc<Counters>) -> SourceDelivery {
        let mut acker = MockAcknowledge::new();

        let acks = counters.clone();
        acker.expect_ack().returning(move || {
            acks.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let rejects = counters.clone();
        acker.expect_nack().with(eq(false)).returning(move |_| {
            rejects.rejects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        SourceDelivery {
            routing_key: key.to_owned(),
            delivery_tag: tag,
            properties: BasicProperties::default()
                .with_message_id(ShortString::from(format!("msg-{tag}"))),
            data: format!("{{\"id\":{tag}}}").into_bytes(),
            acker: Box::new(acker),
        }
    }

    fn source(n: u64, key: &str, counters: &Arc<Counters>) -> VecSource {
        VecSource((1..=n).map(|tag| delivery(tag, key, counters)).collect())
    }

    #[tokio::test]
    async fn confirmed_messages_are_acked_on_the_source() {
        let counters = Arc::new(Counters::default());
        let mut src = source(3, "error.orders.created", &counters);

        let mut dst = MockForwardDestination::new();
        dst.expect_publish()
            .withf(|exchange, key, _| exchange == "micro" && key == "orders.created")
            .times(3)
            .returning(|_, _, _| Ok(ConfirmOutcome::Acked));

        let report = forward_batch(&mut src, &dst, "micro", 3, error_route_key, same_message)
            .await
            .unwrap();

        assert_eq!(report, ForwardReport { forwarded: 3, rejected: 0 });
        assert_eq!(counters.acks.load(Ordering::SeqCst), 3);
        assert_eq!(counters.rejects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unconfirmed_messages_are_never_acked() {
        let counters = Arc::new(Counters::default());
        let mut src = source(2, "orders.created", &counters);

        let calls = AtomicUsize::new(0);
        let mut dst = MockForwardDestination::new();
        dst.expect_publish().times(2).returning(move |_, _, _| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(AmqpError::PublishConfirmTimeout)
            } else {
                Ok(ConfirmOutcome::Nacked)
            }
        });

        let report = forward_batch(&mut src, &dst, "micro", 2, same_route_key, same_message)
            .await
            .unwrap();

        assert_eq!(report, ForwardReport { forwarded: 0, rejected: 2 });
        assert_eq!(counters.acks.load(Ordering::SeqCst), 0);
        assert_eq!(counters.rejects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unroutable_message_is_still_handed_off() {
        let counters = Arc::new(Counters::default());
        let mut src = source(1, "orders.created", &counters);

        let mut dst = MockForwardDestination::new();
        dst.expect_publish()
            .returning(|_, _, _| Ok(ConfirmOutcome::Returned));

        let report = forward_batch(&mut src, &dst, "micro", 1, same_route_key, same_message)
            .await
            .unwrap();

        assert_eq!(report.forwarded, 1);
        assert_eq!(counters.acks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_source_fails_fast() {
        let counters = Arc::new(Counters::default());
        let mut src = source(2, "orders.created", &counters);

        let mut dst = MockForwardDestination::new();
        dst.expect_publish()
            .times(2)
            .returning(|_, _, _| Ok(ConfirmOutcome::Acked));

        let result = forward_batch(&mut src, &dst, "micro", 5, same_route_key, same_message).await;

        assert_eq!(result, Err(AmqpError::ForwardSourceClosed(2)));
        assert_eq!(counters.acks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn publish_failure_rejects_and_stops() {
        let counters = Arc::new(Counters::default());
        let mut src = source(3, "orders.created", &counters);

        let mut dst = MockForwardDestination::new();
        dst.expect_publish()
            .times(1)
            .returning(|_, _, _| Err(AmqpError::PublishingError("channel closed".into())));

        let result = forward_batch(&mut src, &dst, "micro", 3, same_route_key, same_message).await;

        assert_eq!(result, Err(AmqpError::PublishingError("channel closed".into())));
        assert_eq!(counters.rejects.load(Ordering::SeqCst), 1);
        assert_eq!(src.0.len(), 2);
    }

    #[tokio::test]
    async fn zero_count_takes_nothing() {
        let counters = Arc::new(Counters::default());
        let mut src = source(1, "orders.created", &counters);
        let dst = MockForwardDestination::new();

        let report = forward_batch(&mut src, &dst, "micro", 0, same_route_key, same_message)
            .await
            .unwrap();

        assert_eq!(report, ForwardReport::default());
        assert_eq!(src.0.len(), 1);
    }

    #[test]
    fn route_key_transforms() {
        assert_eq!(error_route_key("error.orders.created"), "orders.created");
        assert_eq!(error_route_key("orders.created"), "orders.created");
        assert_eq!(error_route_key("error.error.x"), "error.x");
        assert_eq!(same_route_key("error.orders.created"), "error.orders.created");
    }

    #[test]
    fn same_message_keeps_properties_and_body() {
        let counters = Arc::new(Counters::default());
        let d = delivery(7, "orders.created", &counters);

        let publishing = same_message(&d);

        assert_eq!(publishing.data, br#"{"id":7}"#.to_vec());
        assert_eq!(
            publishing.properties.message_id(),
            &Some(ShortString::from("msg-7"))
        );
    }
}
