// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Subscriber queues come in three shapes, decided by the subscription's
//! reliability:
//! - reliable queues dead-letter rejected messages into the broker's DLX with
//!   the routing key `error.<topic>`;
//! - non-reliable queues carry a message TTL instead;
//! - error-sink queues (bound to the DLX) carry neither, they are the end of
//!   the line.

use lapin::{
    options::{QueueDeclareOptions, QueueDeleteOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
};
use std::{collections::BTreeMap, time::Duration};

/// Queue argument naming the dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument holding the message TTL in milliseconds
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Prefix of the routing key used when a message is dead-lettered
pub const ERROR_TOPIC_PREFIX: &str = "error.";

/// Definition of a durable, shared queue with its declare arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) ttl: Option<i32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a durable queue definition without arguments.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Queue definition of a normal subscription on `topic`.
    ///
    /// A reliable subscription dead-letters into `dlx` when the broker has
    /// one; a non-reliable one expires messages after `ttl`.
    pub fn subscription(
        name: &str,
        topic: &str,
        reliable: bool,
        dlx: Option<&str>,
        ttl: Duration,
    ) -> QueueDefinition {
        let def = QueueDefinition::new(name);

        match (reliable, dlx) {
            (true, Some(dlx)) => def.dead_letter(dlx, &error_topic(topic)),
            (true, None) => def,
            (false, _) => def.ttl(ttl),
        }
    }

    /// Queue definition of an error-sink subscription: reliable, never
    /// dead-lettering further.
    pub fn error_sink(name: &str) -> QueueDefinition {
        QueueDefinition::new(name)
    }

    /// Sets the message Time-To-Live (TTL) for the queue.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(i32::try_from(ttl.as_millis()).unwrap_or(i32::MAX));
        self
    }

    /// Sends rejected messages to `exchange` with `routing_key`.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: false,
            durable: true,
            exclusive: false,
            auto_delete: false,
            nowait: false,
        }
    }

    /// Options of the unconditional delete used to clear a queue whose
    /// arguments conflict with this definition.
    pub(crate) fn unsafe_delete_options(&self) -> QueueDeleteOptions {
        QueueDeleteOptions {
            if_unused: false,
            if_empty: false,
            nowait: false,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.clone())),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.clone())),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        FieldTable::from(args)
    }
}

/// Routing key a message of `topic` carries once dead-lettered.
pub fn error_topic(topic: &str) -> String {
    format!("{ERROR_TOPIC_PREFIX}{topic}")
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key are empty until set with
    /// [`QueueBinding::exchange`] and [`QueueBinding::routing_key`].
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
