// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Every exchange the broker declares is a durable topic exchange. The primary
//! exchange may name an alternate exchange that catches messages no queue is
//! bound for; the alternate exchange and the dead-letter exchange are plain
//! topic exchanges declared before the primary one.

use lapin::{
    options::ExchangeDeclareOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    ExchangeKind,
};
use std::collections::BTreeMap;

/// Exchange argument naming the alternate exchange
pub const AMQP_ARGS_ALTERNATE_EXCHANGE: &str = "alternate-exchange";

/// Definition of a topic exchange with its declare arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a durable topic exchange definition.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            params: BTreeMap::default(),
        }
    }

    /// Routes messages that match no binding to `exchange`.
    pub fn alternate(mut self, exchange: &str) -> Self {
        self.params.insert(
            ShortString::from(AMQP_ARGS_ALTERNATE_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange)),
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn kind(&self) -> ExchangeKind {
        ExchangeKind::Topic
    }

    pub(crate) fn options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: false,
            durable: true,
            auto_delete: false,
            internal: false,
            nowait: false,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}

/// Exchanges of a broker in declaration order: dead-letter exchange and
/// alternate exchange first, the primary exchange last.
pub fn broker_exchanges(
    exchange: &str,
    dlx: Option<&str>,
    alt: Option<&str>,
) -> Vec<ExchangeDefinition> {
    let mut defs = vec![];

    if let Some(dlx) = dlx {
        defs.push(ExchangeDefinition::new(dlx));
    }

    let mut primary = ExchangeDefinition::new(exchange);
    if let Some(alt) = alt {
        defs.push(ExchangeDefinition::new(alt));
        primary = primary.alternate(alt);
    }

    defs.push(primary);
    defs
}
