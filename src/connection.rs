// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Supervised AMQP Connection
//!
//! [`Connection`] owns one transport connection and transparently redials it
//! when the broker or the network drops it. The live `lapin::Connection` sits
//! behind a lock together with a generation counter: every successful redial
//! swaps the handle and bumps the generation, so channels derived from this
//! connection can tell that their transport was replaced and recreate
//! themselves against the current handle instead of a stale one.

use crate::{
    channel::Channel,
    errors::AmqpError,
    supervisor::{live_handle, retry_until_closed, CONNECTION_RECONNECT_DELAY},
};
use lapin::{types::LongString, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// AMQP reply code used for every client-initiated close
pub(crate) const REPLY_SUCCESS: u16 = 200;

/// A connection that redials itself until it is closed by the developer.
///
/// Cloning is cheap; all clones share the same transport handle and the same
/// close flag.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

struct ConnectionShared {
    url: String,
    name: String,
    current: RwLock<Arc<lapin::Connection>>,
    generation: watch::Sender<u64>,
    closed: CancellationToken,
}

type ErrorNotifications = mpsc::UnboundedReceiver<lapin::Error>;

impl Connection {
    /// Dials `url` and starts supervising the connection.
    ///
    /// The first dial is not retried: a broker that is unreachable at startup
    /// is reported to the caller.
    pub async fn dial(url: &str, name: &str) -> Result<Connection, AmqpError> {
        let (conn, lost) = connect(url, name).await?;

        let (generation, _) = watch::channel(0);
        let shared = Arc::new(ConnectionShared {
            url: url.to_owned(),
            name: name.to_owned(),
            current: RwLock::new(Arc::new(conn)),
            generation,
            closed: CancellationToken::new(),
        });

        tokio::spawn(supervise(shared.clone(), lost));

        Ok(Connection { shared })
    }

    /// Opens a logical channel on the current transport handle.
    ///
    /// With `reconnect` the channel recreates itself after a broker-initiated
    /// close; without it the channel is meant to be short-lived.
    pub async fn channel(&self, reconnect: bool) -> Result<Channel, AmqpError> {
        let (raw, lost) = self.open_raw_channel(&self.shared.closed).await?;
        Ok(Channel::supervise(self.clone(), raw, lost, reconnect))
    }

    /// Closes the transport and stops the redial loop.
    ///
    /// Closing an already closed connection is a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.shared.closed.is_cancelled() {
            return Ok(());
        }
        self.shared.closed.cancel();

        let conn = self.current().await;
        if !conn.status().connected() {
            return Ok(());
        }

        conn.close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close connection");
                AmqpError::ConnectionError(err.to_string())
            })
    }

    /// Whether [`Connection::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Number of successful redials since the first dial.
    pub fn generation(&self) -> u64 {
        *self.shared.generation.borrow()
    }

    /// Close flag for channels derived from this connection; closing the
    /// connection closes them too.
    pub(crate) fn close_token(&self) -> CancellationToken {
        self.shared.closed.child_token()
    }

    pub(crate) fn watch_generation(&self) -> watch::Receiver<u64> {
        self.shared.generation.subscribe()
    }

    /// Opens a channel on the current transport handle.
    ///
    /// While the transport is being redialed the call waits for the new
    /// handle, so an outage only adds latency. It gives up once `closed`
    /// fires.
    pub(crate) async fn open_raw_channel(
        &self,
        closed: &CancellationToken,
    ) -> Result<(lapin::Channel, ErrorNotifications), AmqpError> {
        let mut generation = self.watch_generation();
        let shared = &self.shared;

        let conn = live_handle(&mut generation, closed, move || async move {
            let conn = shared.current.read().await.clone();
            conn.status().connected().then_some(conn)
        })
        .await?;

        let raw = conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError(err.to_string())
        })?;

        let (tx, lost) = mpsc::unbounded_channel();
        raw.on_error(move |err| {
            let _ = tx.send(err);
        });

        debug!(id = raw.id(), "channel created");
        Ok((raw, lost))
    }

    async fn current(&self) -> Arc<lapin::Connection> {
        self.shared.current.read().await.clone()
    }
}

async fn connect(url: &str, name: &str) -> Result<(lapin::Connection, ErrorNotifications), AmqpError> {
    debug!("creating amqp connection...");
    let options =
        ConnectionProperties::default().with_connection_name(LongString::from(name.to_owned()));

    let conn = lapin::Connection::connect(url, options).await.map_err(|err| {
        error!(error = err.to_string(), "failure to connect");
        AmqpError::ConnectionError(err.to_string())
    })?;

    let (tx, lost) = mpsc::unbounded_channel();
    conn.on_error(move |err| {
        let _ = tx.send(err);
    });

    debug!("amqp connected");
    Ok((conn, lost))
}

async fn supervise(shared: Arc<ConnectionShared>, mut lost: ErrorNotifications) {
    loop {
        let reason = tokio::select! {
            _ = shared.closed.cancelled() => break,
            reason = lost.recv() => reason,
        };

        if shared.closed.is_cancelled() {
            break;
        }

        match reason {
            Some(err) => warn!(error = err.to_string(), "connection lost"),
            None => warn!("connection error notifier dropped"),
        }

        let redialed = retry_until_closed(
            &shared.closed,
            CONNECTION_RECONNECT_DELAY,
            "reconnect",
            || connect(&shared.url, &shared.name),
        )
        .await;

        let Some((conn, next)) = redialed else {
            break;
        };

        if shared.closed.is_cancelled() {
            if let Err(err) = conn.close(REPLY_SUCCESS, "closed by client").await {
                error!(error = err.to_string(), "failure to close redialed connection");
            }
            break;
        }

        *shared.current.write().await = Arc::new(conn);
        shared.generation.send_modify(|generation| *generation += 1);
        lost = next;

        info!(generation = *shared.generation.borrow(), "reconnect success");
    }

    info!("connection closed");
}
