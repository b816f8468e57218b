// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Broker Client
//!
//! `AmqpError` covers every failure the broker client can surface: startup
//! errors (dial, topology declaration, handler registration), publish-time
//! errors the caller is expected to branch on (unroutable, not acked, confirm
//! deadline) and message-level errors that the consume loop converts into
//! ack/nack decisions instead of returning them.

use thiserror::Error;

/// Represents errors that can occur while talking to the message broker.
///
/// Variants carry the rendered message of the underlying transport error so
/// the enum stays comparable; the original error is logged where it happens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// The broker URL is not a valid `amqp://` or `amqps://` URL
    #[error("invalid broker url `{0}`")]
    InvalidUrl(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating, using or closing a channel
    #[error("channel failure: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// The broker refused the consumer registration
    #[error("failure to declare consumer on queue `{0}`")]
    ConsumerDeclarationError(String),

    /// The payload could not be encoded by the message codec
    #[error("message is not serializable: {0}")]
    NotSerializable(String),

    /// A publish was attempted on a publisher that has no bound topic
    #[error("message has no topic")]
    MissingTopic,

    /// Transport failure while publishing
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker answered the publish with a negative confirm
    #[error("message not ack by broker")]
    PublishNotAcked,

    /// The broker returned a mandatory message because no queue was bound
    #[error("message cannot route to any queue")]
    PublishUnroutable,

    /// No confirm or return arrived before the publish deadline
    #[error("timed out waiting for the broker confirm")]
    PublishConfirmTimeout,

    /// Error decoding a delivery into the handler's message type
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// The handler registration is unusable
    #[error("invalid handler: {0}")]
    InvalidHandler(String),

    /// Only "no retry" (0) and "retry once" (1) are supported
    #[error("max retry {0} is not supported, only 0 or 1")]
    MaxRetryTooMuch(u8),

    /// An error-sink subscription was requested on a broker without a DLX
    #[error("broker without dead-letter exchange")]
    NoDeadLetterExchange,

    /// The forward source stopped delivering before the requested count
    #[error("forward source closed after {0} messages")]
    ForwardSourceClosed(usize),
}
