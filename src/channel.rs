// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Supervised AMQP Channel
//!
//! A [`Channel`] wraps one logical channel of a [`Connection`] together with a
//! "closed by developer" flag. The flag is set before the underlying close is
//! issued, which lets the monitor task tell an intentional shutdown apart from
//! a broker-initiated drop. Reconnecting channels are recreated against the
//! connection's current transport handle, and [`Channel::consume`] hides those
//! recreations behind one stable delivery stream.

use crate::{
    connection::{Connection, REPLY_SUCCESS},
    errors::AmqpError,
    supervisor::{relay_deliveries, retry_until_closed, CHANNEL_RECREATE_DELAY, CONSUME_RETRY_DELAY},
};
use lapin::{message::Delivery, options::BasicConsumeOptions, types::FieldTable, Consumer};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Logical channel that survives broker-initiated closes when created with
/// `reconnect = true`.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

struct ChannelShared {
    connection: Connection,
    current: RwLock<lapin::Channel>,
    closed: CancellationToken,
}

impl Channel {
    pub(crate) fn supervise(
        connection: Connection,
        raw: lapin::Channel,
        lost: mpsc::UnboundedReceiver<lapin::Error>,
        reconnect: bool,
    ) -> Channel {
        let shared = Arc::new(ChannelShared {
            closed: connection.close_token(),
            connection,
            current: RwLock::new(raw),
        });

        if reconnect {
            tokio::spawn(monitor(shared.clone(), lost));
        }

        Channel { shared }
    }

    /// The channel currently backing this supervisor.
    pub async fn raw(&self) -> lapin::Channel {
        self.shared.current.read().await.clone()
    }

    /// Marks the channel as closed by the developer, then closes it.
    ///
    /// Closing twice, or closing a channel whose connection was closed, is a
    /// no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.shared.closed.is_cancelled() {
            return Ok(());
        }
        self.shared.closed.cancel();
        self.shared.close_current().await
    }

    /// Whether the channel was closed by the developer, directly or through
    /// its connection.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Registers a consumer on `queue` and returns a delivery stream that
    /// outlives channel recreations.
    ///
    /// The first registration happens before this returns, so a refused
    /// consumer is reported to the caller. Afterwards a relay task registers
    /// the consumer again whenever the broker drops it; the returned receiver
    /// yields `None` only once the channel is closed by the developer.
    pub async fn consume(
        &self,
        queue: &str,
        tag: &str,
        options: BasicConsumeOptions,
        args: FieldTable,
    ) -> Result<mpsc::Receiver<Delivery>, AmqpError> {
        let first = self
            .shared
            .basic_consume(queue, tag, options.clone(), args.clone())
            .await?;

        let (tx, rx) = mpsc::channel(1);
        let shared = self.shared.clone();
        let queue = queue.to_owned();
        let tag = tag.to_owned();

        let register = move || {
            let shared = shared.clone();
            let queue = queue.clone();
            let tag = tag.clone();
            let options = options.clone();
            let args = args.clone();
            async move { shared.basic_consume(&queue, &tag, options, args).await }
        };

        tokio::spawn(relay_deliveries(
            first,
            register,
            tx,
            self.shared.closed.clone(),
            CONSUME_RETRY_DELAY,
        ));

        Ok(rx)
    }
}

impl ChannelShared {
    async fn basic_consume(
        &self,
        queue: &str,
        tag: &str,
        options: BasicConsumeOptions,
        args: FieldTable,
    ) -> Result<Consumer, AmqpError> {
        let raw = self.current.read().await.clone();

        raw.basic_consume(queue, tag, options, args)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned())
            })
    }

    async fn close_current(&self) -> Result<(), AmqpError> {
        let raw = self.current.read().await.clone();
        if !raw.status().connected() {
            return Ok(());
        }

        raw.close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}

async fn monitor(shared: Arc<ChannelShared>, mut lost: mpsc::UnboundedReceiver<lapin::Error>) {
    let mut generation = shared.connection.watch_generation();
    generation.mark_unchanged();

    loop {
        let reason = tokio::select! {
            _ = shared.closed.cancelled() => break,
            reason = lost.recv() => match reason {
                Some(err) => err.to_string(),
                None => "channel error notifier dropped".to_owned(),
            },
            _ = connection_replaced(&mut generation) => "connection replaced".to_owned(),
        };

        if shared.closed.is_cancelled() {
            break;
        }
        warn!(reason = %reason, "channel closed by broker");

        let recreated = retry_until_closed(
            &shared.closed,
            CHANNEL_RECREATE_DELAY,
            "channel recreate",
            || shared.connection.open_raw_channel(&shared.closed),
        )
        .await;

        let Some((raw, next)) = recreated else {
            break;
        };

        *shared.current.write().await = raw;
        lost = next;
        generation.mark_unchanged();

        info!("channel recreate success");
    }

    info!("channel closed");

    // the flag may have been set by the connection, close the transport side too
    if let Err(err) = shared.close_current().await {
        debug!(error = err.to_string(), "channel already closed");
    }
}

async fn connection_replaced(generation: &mut watch::Receiver<u64>) {
    if generation.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}
