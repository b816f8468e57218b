// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriber
//!
//! A subscriber owns a dedicated connection and a reconnecting channel,
//! declares its queue with reliability-dependent arguments (see
//! [`crate::queue`]) and binds it with the topic as routing key, either to
//! the primary exchange or, for an error sink, to the dead-letter exchange.
//!
//! Deliveries are auto-acked except on reliable, non-error-sink queues,
//! which are settled by the consumer.

use crate::{
    channel::Channel,
    config::BrokerConfig,
    connection::Connection,
    errors::AmqpError,
    queue::{QueueBinding, QueueDefinition},
    topology::{AmqpTopology, Topology},
};
use lapin::{message::Delivery, options::BasicConsumeOptions, types::FieldTable};
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Consumer tag; empty lets the broker generate one
const SERVER_GENERATED_TAG: &str = "";

pub struct Subscriber {
    name: String,
    topic: String,
    reliable: bool,
    error_sink: bool,
    connection: Connection,
    channel: Channel,
}

impl Subscriber {
    /// Subscriber on the primary exchange.
    ///
    /// # Parameters
    /// * `config` - Broker settings, the dead-letter exchange and queue TTL
    /// * `name` - Queue name
    /// * `topic` - Routing key the queue is bound with
    /// * `reliable` - Dead-lettered queue with manual ack when set
    ///
    /// # Returns
    /// A subscriber with its queue declared and bound
    pub async fn new(
        config: &BrokerConfig,
        name: &str,
        topic: &str,
        reliable: bool,
    ) -> Result<Subscriber, AmqpError> {
        let queue = QueueDefinition::subscription(
            name,
            topic,
            reliable,
            config.dlx.as_deref(),
            config.queue_ttl,
        );
        let binding = QueueBinding::new(name)
            .exchange(&config.exchange)
            .routing_key(topic);

        Subscriber::init(config, name, topic, reliable, false, queue, binding).await
    }

    /// Subscriber on the dead-letter exchange, `topic` is usually
    /// `error.<original topic>`.
    ///
    /// # Parameters
    /// * `config` - Broker settings, must name a dead-letter exchange
    /// * `name` - Error queue name
    /// * `topic` - Dead-letter routing key
    ///
    /// # Returns
    /// A subscriber, or [`AmqpError::NoDeadLetterExchange`]
    pub async fn new_error_sink(
        config: &BrokerConfig,
        name: &str,
        topic: &str,
    ) -> Result<Subscriber, AmqpError> {
        let Some(dlx) = config.dlx.as_deref() else {
            return Err(AmqpError::NoDeadLetterExchange);
        };

        let queue = QueueDefinition::error_sink(name);
        let binding = QueueBinding::new(name).exchange(dlx).routing_key(topic);

        Subscriber::init(config, name, topic, true, true, queue, binding).await
    }

    async fn init(
        config: &BrokerConfig,
        name: &str,
        topic: &str,
        reliable: bool,
        error_sink: bool,
        queue: QueueDefinition,
        binding: QueueBinding,
    ) -> Result<Subscriber, AmqpError> {
        let connection = Connection::dial(&config.url, &config.app_name).await?;

        let installed = AmqpTopology::new(connection.clone())
            .queue(queue)
            .queue_binding(binding)
            .install()
            .await;

        let channel = match installed {
            Ok(()) => connection.channel(true).await,
            Err(err) => Err(err),
        };

        match channel {
            Ok(channel) => {
                debug!(queue = name, topic, reliable, error_sink, "subscriber ready");
                Ok(Subscriber {
                    name: name.to_owned(),
                    topic: topic.to_owned(),
                    reliable,
                    error_sink,
                    connection,
                    channel,
                })
            }
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    error!(error = close_err.to_string(), "failure to close subscriber connection");
                }
                Err(err)
            }
        }
    }

    /// Whether deliveries are settled by the broker on delivery.
    pub fn auto_ack(&self) -> bool {
        !(self.reliable && !self.error_sink)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Starts consuming; the stream survives channel and connection loss and
    /// ends once the subscriber is closed.
    pub async fn consume(&self) -> Result<mpsc::Receiver<Delivery>, AmqpError> {
        self.channel
            .consume(
                &self.name,
                SERVER_GENERATED_TAG,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: self.auto_ack(),
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
    }

    /// Closes the channel, then the connection, even when the channel close
    /// fails. The first error is returned.
    pub async fn close(&self) -> Result<(), AmqpError> {
        close_in_order(self.channel.close(), self.connection.close()).await
    }
}

/// Awaits `channel` then `connection`, returning the first error.
async fn close_in_order<C, N>(channel: C, connection: N) -> Result<(), AmqpError>
where
    C: Future<Output = Result<(), AmqpError>>,
    N: Future<Output = Result<(), AmqpError>>,
{
    let channel_closed = channel.await;
    if let Err(err) = &channel_closed {
        error!(error = err.to_string(), "failure to close subscriber channel");
    }

    let connection_closed = connection.await;
    if let Err(err) = &connection_closed {
        error!(error = err.to_string(), "failure to close subscriber connection");
    }

    channel_closed.and(connection_closed)
}
