// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishers own a dedicated supervised connection and open a fresh,
//! non-reconnecting channel for every publish, closed right after, so that
//! confirm bookkeeping never mixes two messages.
//!
//! In reliable mode the channel is put in confirm mode, the message is
//! published persistent and mandatory, and the call waits for the broker:
//! - a return (no queue bound for the topic) fails with
//!   [`AmqpError::PublishUnroutable`];
//! - a negative confirm fails with [`AmqpError::PublishNotAcked`];
//! - no answer within the deadline fails with
//!   [`AmqpError::PublishConfirmTimeout`].
//!
//! Non-reliable publishes are fire-and-forget.

use crate::{
    codec::{Codec, JsonCodec},
    connection::Connection,
    errors::AmqpError,
    otel,
};
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation,
    types::ShortString,
    BasicProperties,
};
use std::{future::Future, time::Duration};
use tracing::error;
use uuid::Uuid;

/// AMQP delivery mode of messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A typed message and the topic it is published under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<M> {
    pub topic: String,
    pub value: M,
}

impl<M> Message<M> {
    pub fn new(topic: &str, value: M) -> Message<M> {
        Message {
            topic: topic.to_owned(),
            value,
        }
    }
}

/// Publisher options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Confirm-tracked, mandatory, persistent publishing
    pub reliable: bool,
    /// Deadline for the broker confirm in reliable mode
    pub confirm_timeout: Duration,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            reliable: false,
            confirm_timeout: crate::config::DEFAULT_CONFIRM_TIMEOUT,
        }
    }
}

impl PublishOptions {
    pub fn reliable(mut self) -> Self {
        self.reliable = true;
        self
    }

    pub fn confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }
}

/// The broker's answer to one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Acked,
    Nacked,
    /// The mandatory message could not be routed and came back
    Returned,
    /// The channel is not in confirm mode
    NotRequested,
}

impl From<Confirmation> for ConfirmOutcome {
    fn from(confirmation: Confirmation) -> Self {
        match confirmation {
            Confirmation::Ack(Some(_)) | Confirmation::Nack(Some(_)) => ConfirmOutcome::Returned,
            Confirmation::Ack(None) => ConfirmOutcome::Acked,
            Confirmation::Nack(None) => ConfirmOutcome::Nacked,
            Confirmation::NotRequested => ConfirmOutcome::NotRequested,
        }
    }
}

impl ConfirmOutcome {
    /// Maps the answer to the result of a reliable publish; a return wins
    /// over whatever confirm accompanies it.
    pub fn into_result(self) -> Result<(), AmqpError> {
        match self {
            ConfirmOutcome::Acked | ConfirmOutcome::NotRequested => Ok(()),
            ConfirmOutcome::Nacked => Err(AmqpError::PublishNotAcked),
            ConfirmOutcome::Returned => Err(AmqpError::PublishUnroutable),
        }
    }
}

/// Waits for a publisher confirm, at most `deadline`.
pub(crate) async fn await_confirm<F>(confirm: F, deadline: Duration) -> Result<ConfirmOutcome, AmqpError>
where
    F: Future<Output = Result<Confirmation, lapin::Error>>,
{
    match tokio::time::timeout(deadline, confirm).await {
        Err(_) => Err(AmqpError::PublishConfirmTimeout),
        Ok(Err(err)) => Err(AmqpError::PublishingError(err.to_string())),
        Ok(Ok(confirmation)) => Ok(confirmation.into()),
    }
}

/// Connection and settings shared by both publisher flavours.
struct PublisherCore {
    exchange: String,
    options: PublishOptions,
    connection: Connection,
}

impl PublisherCore {
    async fn new(
        url: &str,
        name: &str,
        exchange: &str,
        options: PublishOptions,
    ) -> Result<PublisherCore, AmqpError> {
        Ok(PublisherCore {
            exchange: exchange.to_owned(),
            options,
            connection: Connection::dial(url, name).await?,
        })
    }

    async fn publish_encoded(
        &self,
        topic: &str,
        payload: &[u8],
        content_type: &str,
        deadline: Duration,
    ) -> Result<(), AmqpError> {
        let channel = self.connection.channel(false).await?;
        let result = self
            .publish_on(&channel.raw().await, topic, payload, content_type, deadline)
            .await;

        if let Err(err) = channel.close().await {
            error!(error = err.to_string(), "failure to close publish channel");
        }

        if let Err(err) = &result {
            error!(error = err.to_string(), topic, "publish message error");
        }
        result
    }

    async fn publish_on(
        &self,
        channel: &lapin::Channel,
        topic: &str,
        payload: &[u8],
        content_type: &str,
        deadline: Duration,
    ) -> Result<(), AmqpError> {
        let reliable = self.options.reliable;

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(content_type))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(otel::context_headers());

        if reliable {
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await
                .map_err(|err| AmqpError::ChannelError(err.to_string()))?;
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        let confirm = channel
            .basic_publish(
                &self.exchange,
                topic,
                BasicPublishOptions {
                    mandatory: reliable,
                    immediate: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        if !reliable {
            return Ok(());
        }

        await_confirm(confirm, deadline).await?.into_result()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.connection.close().await
    }
}

/// Publisher bound to one topic.
pub struct TopicPublisher<C = JsonCodec> {
    topic: String,
    codec: C,
    core: PublisherCore,
}

impl TopicPublisher<JsonCodec> {
    pub(crate) async fn new(
        url: &str,
        name: &str,
        exchange: &str,
        topic: &str,
        options: PublishOptions,
    ) -> Result<Self, AmqpError> {
        Ok(TopicPublisher {
            topic: topic.to_owned(),
            codec: JsonCodec,
            core: PublisherCore::new(url, name, exchange, options).await?,
        })
    }
}

impl<C> TopicPublisher<C> {
    /// Swaps the codec used to encode messages.
    pub fn with_codec<C2>(self, codec: C2) -> TopicPublisher<C2> {
        TopicPublisher {
            topic: self.topic,
            codec,
            core: self.core,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publishes `msg` under the bound topic.
    pub async fn publish<M>(&self, msg: &M) -> Result<(), AmqpError>
    where
        C: Codec<M>,
    {
        let payload = self.codec.encode(msg)?;
        self.core
            .publish_encoded(
                &self.topic,
                &payload,
                self.codec.content_type(),
                self.core.options.confirm_timeout,
            )
            .await
    }

    /// Publishes under the message's own topic.
    pub async fn publish_message<M>(&self, msg: &Message<M>) -> Result<(), AmqpError>
    where
        C: Codec<M>,
    {
        self.publish_message_within(msg, self.core.options.confirm_timeout)
            .await
    }

    /// Like [`TopicPublisher::publish_message`] with a caller-supplied
    /// confirm deadline.
    pub async fn publish_message_within<M>(
        &self,
        msg: &Message<M>,
        deadline: Duration,
    ) -> Result<(), AmqpError>
    where
        C: Codec<M>,
    {
        let payload = self.codec.encode(&msg.value)?;
        self.core
            .publish_encoded(&msg.topic, &payload, self.codec.content_type(), deadline)
            .await
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.core.close().await
    }
}

/// Publisher usable with any topic per call.
pub struct MultiTopicPublisher<C = JsonCodec> {
    codec: C,
    core: PublisherCore,
}

impl MultiTopicPublisher<JsonCodec> {
    pub(crate) async fn new(
        url: &str,
        name: &str,
        exchange: &str,
        options: PublishOptions,
    ) -> Result<Self, AmqpError> {
        Ok(MultiTopicPublisher {
            codec: JsonCodec,
            core: PublisherCore::new(url, name, exchange, options).await?,
        })
    }
}

impl<C> MultiTopicPublisher<C> {
    pub fn with_codec<C2>(self, codec: C2) -> MultiTopicPublisher<C2> {
        MultiTopicPublisher {
            codec,
            core: self.core,
        }
    }

    pub async fn publish_message<M>(&self, msg: &Message<M>) -> Result<(), AmqpError>
    where
        C: Codec<M>,
    {
        self.publish_message_within(msg, self.core.options.confirm_timeout)
            .await
    }

    pub async fn publish_message_within<M>(
        &self,
        msg: &Message<M>,
        deadline: Duration,
    ) -> Result<(), AmqpError>
    where
        C: Codec<M>,
    {
        if msg.topic.is_empty() {
            return Err(AmqpError::MissingTopic);
        }

        let payload = self.codec.encode(&msg.value)?;
        self.core
            .publish_encoded(&msg.topic, &payload, self.codec.content_type(), deadline)
            .await
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.core.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::{acker::Acker, message::{BasicReturnMessage, Delivery}};
    use std::future;

    #[tokio::test]
    async fn broker_ack_means_success() {
        let outcome = await_confirm(async { Ok::<_, lapin::Error>(Confirmation::Ack(None)) }, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(outcome, ConfirmOutcome::Acked);
        assert_eq!(outcome.into_result(), Ok(()));
    }

    #[tokio::test]
    async fn broker_nack_is_not_acked() {
        let outcome = await_confirm(async { Ok::<_, lapin::Error>(Confirmation::Nack(None)) }, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(outcome.into_result(), Err(AmqpError::PublishNotAcked));
    }

    /// What the broker hands back for a mandatory message no queue is bound for.
    fn returned(topic: &str) -> Box<BasicReturnMessage> {
        Box::new(BasicReturnMessage {
            delivery: Delivery {
                delivery_tag: 0,
                exchange: ShortString::from("micro"),
                routing_key: ShortString::from(topic),
                redelivered: false,
                properties: BasicProperties::default(),
                data: br#"{"id":1}"#.to_vec(),
                acker: Acker::default(),
            },
            reply_code: 312,
            reply_text: ShortString::from("NO_ROUTE"),
        })
    }

    #[tokio::test]
    async fn unbound_topic_is_unroutable_whatever_the_confirm() {
        for confirmation in [
            Confirmation::Ack(Some(returned("orders.created"))),
            Confirmation::Nack(Some(returned("orders.created"))),
        ] {
            let outcome = await_confirm(async move { Ok::<_, lapin::Error>(confirmation) }, Duration::from_secs(1))
                .await
                .unwrap();

            assert_eq!(outcome, ConfirmOutcome::Returned);
            assert_eq!(outcome.into_result(), Err(AmqpError::PublishUnroutable));
        }
    }

    #[test]
    fn returned_message_is_unroutable() {
        assert_eq!(
            ConfirmOutcome::Returned.into_result(),
            Err(AmqpError::PublishUnroutable)
        );
    }

    #[test]
    fn unconfirmed_channel_publishes_fire_and_forget() {
        assert_eq!(
            ConfirmOutcome::from(Confirmation::NotRequested).into_result(),
            Ok(())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_confirm_hits_the_deadline() {
        let result = await_confirm(
            future::pending::<Result<Confirmation, lapin::Error>>(),
            Duration::from_secs(30),
        )
        .await;

        assert_eq!(result, Err(AmqpError::PublishConfirmTimeout));
    }

    #[test]
    fn options_builder() {
        let opts = PublishOptions::default()
            .reliable()
            .confirm_timeout(Duration::from_secs(2));

        assert!(opts.reliable);
        assert_eq!(opts.confirm_timeout, Duration::from_secs(2));
        assert!(!PublishOptions::default().reliable);
    }
}
