// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! Declares exchanges, queues and queue bindings. Topology is treated as
//! static and mandatory: any failure is returned to the caller, which is
//! expected to abort startup.
//!
//! Queue declaration is the one step with recovery. When a queue already
//! exists with different arguments (for example a subscription switched from
//! non-reliable to reliable) the broker refuses the declare and closes the
//! channel; the queue is then deleted unconditionally and declared once more.

use crate::{
    channel::Channel,
    connection::Connection,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{options::QueueBindOptions, types::FieldTable};
use std::future::Future;
use tracing::{debug, error, warn};

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Declares everything, exchanges first, then queues, then bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Topology installer working on short-lived channels of one connection.
pub struct AmqpTopology {
    connection: Connection,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new(connection: Connection) -> AmqpTopology {
        AmqpTopology {
            connection,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchanges().await?;
        self.install_queues().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology {
    async fn install_exchanges(&self) -> Result<(), AmqpError> {
        if self.exchanges.is_empty() {
            return Ok(());
        }

        let channel = self.connection.channel(false).await?;
        let raw = channel.raw().await;

        let mut result = Ok(());
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            if let Err(err) = raw
                .exchange_declare(&exch.name, exch.kind(), exch.options(), exch.arguments())
                .await
            {
                error!(
                    error = err.to_string(),
                    name = exch.name.as_str(),
                    "error to declare the exchange"
                );
                result = Err(AmqpError::DeclareExchangeError(exch.name.clone()));
                break;
            }

            debug!("exchange: {} was created", exch.name);
        }

        close_channel(&channel).await;
        result
    }

    async fn install_queues(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            declare_with_recovery(
                &def.name,
                || self.declare_queue(def),
                || self.delete_queue(def),
            )
            .await?;

            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    /// Declares on a fresh channel, the broker closes it on a refused declare.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let channel = self.connection.channel(false).await?;

        let result = channel
            .raw()
            .await
            .queue_declare(&def.name, def.options(), def.arguments())
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name = def.name.as_str(), "error to declare the queue");
                AmqpError::DeclareQueueError(def.name.clone())
            });

        close_channel(&channel).await;
        result
    }

    async fn delete_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let channel = self.connection.channel(false).await?;

        let result = channel
            .raw()
            .await
            .queue_delete(&def.name, def.unsafe_delete_options())
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name = def.name.as_str(), "error to delete the queue");
                AmqpError::DeclareQueueError(def.name.clone())
            });

        close_channel(&channel).await;
        result
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        if self.queues_binding.is_empty() {
            return Ok(());
        }

        let channel = self.connection.channel(false).await?;
        let raw = channel.raw().await;

        let mut result = Ok(());
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            if let Err(err) = raw
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
            {
                error!(error = err.to_string(), "error to bind queue to exchange");
                result = Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ));
                break;
            }
        }

        close_channel(&channel).await;
        result
    }
}

async fn close_channel(channel: &Channel) {
    if let Err(err) = channel.close().await {
        error!(error = err.to_string(), "failure to close topology channel");
    }
}

/// Runs `declare`; on failure runs `delete` and `declare` once more.
///
/// When the retry cannot fix it, the error of the first declare is returned.
pub(crate) async fn declare_with_recovery<D, DF, R, RF>(
    name: &str,
    mut declare: D,
    delete: R,
) -> Result<(), AmqpError>
where
    D: FnMut() -> DF,
    DF: Future<Output = Result<(), AmqpError>>,
    R: FnOnce() -> RF,
    RF: Future<Output = Result<(), AmqpError>>,
{
    let original = match declare().await {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };

    warn!(name, "queue declare refused, deleting the existing queue");

    if let Err(err) = delete().await {
        error!(error = err.to_string(), name, "failure to delete conflicting queue");
        return Err(original);
    }

    declare().await.map_err(|_| original)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    #[tokio::test]
    async fn declare_success_skips_delete() {
        let deletes = AtomicUsize::new(0);

        let result = declare_with_recovery(
            "q",
            || async { Ok(()) },
            || {
                deletes.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .await;

        assert_eq!(result, Ok(()));
        assert_eq!(deletes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn conflicting_queue_is_deleted_and_declared_again() {
        let outcomes = Mutex::new(vec![
            Ok(()),
            Err(AmqpError::DeclareQueueError("q".into())),
        ]);
        let deletes = AtomicUsize::new(0);

        let result = declare_with_recovery(
            "q",
            || {
                let next = outcomes.lock().unwrap().pop().unwrap();
                async move { next }
            },
            || {
                deletes.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .await;

        assert_eq!(result, Ok(()));
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
        assert!(outcomes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_failure_surfaces_the_original_error() {
        let attempts = AtomicUsize::new(0);

        let result = declare_with_recovery(
            "q",
            || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(AmqpError::DeclareQueueError("first".into()))
                    } else {
                        Err(AmqpError::ChannelError("second".into()))
                    }
                }
            },
            || async { Ok(()) },
        )
        .await;

        assert_eq!(result, Err(AmqpError::DeclareQueueError("first".into())));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_delete_surfaces_the_original_error() {
        let attempts = AtomicUsize::new(0);

        let result = declare_with_recovery(
            "q",
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(AmqpError::DeclareQueueError("q".into())) }
            },
            || async { Err(AmqpError::ChannelError("gone".into())) },
        )
        .await;

        assert_eq!(result, Err(AmqpError::DeclareQueueError("q".into())));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
