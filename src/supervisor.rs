// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Fixed-interval loops shared by the connection and channel supervisors.
//!
//! Both loops stop as soon as the developer-initiated close token fires, which
//! is the only cancellation signal the supervisors know about.

use crate::errors::AmqpError;
use futures_util::{Stream, StreamExt};
use std::{fmt::Display, future::Future, time::Duration};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Delay between two redial attempts of a lost connection
pub const CONNECTION_RECONNECT_DELAY: Duration = Duration::from_secs(2);
/// Delay between two recreation attempts of a lost channel
pub const CHANNEL_RECREATE_DELAY: Duration = Duration::from_secs(4);
/// Delay before a dropped consumer is registered again
pub const CONSUME_RETRY_DELAY: Duration = Duration::from_secs(8);

/// Sleeps `delay`, then calls `attempt`, until it succeeds or `closed` fires.
///
/// Returns `None` when the loop was interrupted by a close.
pub(crate) async fn retry_until_closed<T, F, Fut>(
    closed: &CancellationToken,
    delay: Duration,
    what: &str,
    mut attempt: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AmqpError>>,
{
    loop {
        tokio::select! {
            _ = closed.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        if closed.is_cancelled() {
            return None;
        }

        match attempt().await {
            Ok(value) => return Some(value),
            Err(err) => error!(error = err.to_string(), "{} error, retrying", what),
        }
    }
}

/// Returns the first live handle yielded by `current`.
///
/// While `current` yields `None` (the transport is being redialed) this waits
/// for the next generation bump and asks again. Fails with
/// [`AmqpError::ConnectionError`] once `closed` fires.
pub(crate) async fn live_handle<T, F, Fut>(
    generation: &mut watch::Receiver<u64>,
    closed: &CancellationToken,
    mut current: F,
) -> Result<T, AmqpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    loop {
        if closed.is_cancelled() {
            return Err(AmqpError::ConnectionError("connection closed".to_owned()));
        }

        if let Some(handle) = current().await {
            return Ok(handle);
        }

        debug!("connection is being redialed, waiting for the new handle");

        tokio::select! {
            _ = closed.cancelled() => {
                return Err(AmqpError::ConnectionError("connection closed".to_owned()));
            }
            changed = generation.changed() => {
                if changed.is_err() {
                    return Err(AmqpError::ConnectionError("connection supervisor stopped".to_owned()));
                }
            }
        }
    }
}

/// Relays every item of `stream` onto `output`, registering a new stream with
/// `register` whenever the current one ends.
///
/// `output` is dropped, and the receiving side observes the end of the
/// stream, only once `closed` fires or the receiver itself went away.
pub(crate) async fn relay_deliveries<T, E, S, F, Fut>(
    stream: S,
    mut register: F,
    output: mpsc::Sender<T>,
    closed: CancellationToken,
    delay: Duration,
) where
    E: Display,
    S: Stream<Item = Result<T, E>> + Send + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S, AmqpError>>,
{
    let mut stream = Box::pin(stream);

    loop {
        loop {
            let next = tokio::select! {
                _ = closed.cancelled() => return,
                next = stream.next() => next,
            };

            match next {
                None => break,
                Some(Ok(item)) => {
                    tokio::select! {
                        _ = closed.cancelled() => return,
                        sent = output.send(item) => {
                            if sent.is_err() {
                                debug!("delivery receiver dropped, stopping relay");
                                return;
                            }
                        }
                    }
                }
                Some(Err(err)) => warn!(error = err.to_string(), "consumer stream error"),
            }
        }

        warn!("consumer stream ended, registering again");

        match retry_until_closed(&closed, delay, "consume", &mut register).await {
            Some(next) => stream = Box::pin(next),
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test(start_paused = true)]
    async fn retry_until_closed_keeps_trying_until_success() {
        let closed = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = attempts.clone();
        let value = retry_until_closed(&closed, Duration::from_secs(2), "dial", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AmqpError::ConnectionError("refused".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(value, Some(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_until_closed_stops_without_attempt_once_closed() {
        let closed = CancellationToken::new();
        closed.cancel();
        let attempts = AtomicUsize::new(0);

        let value: Option<()> = retry_until_closed(&closed, Duration::from_secs(2), "dial", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert_eq!(value, None);
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn handle_request_during_redial_resolves_after_swap() {
        let closed = CancellationToken::new();
        let (bump, mut generation) = watch::channel(0u64);
        let live = Arc::new(AtomicUsize::new(0));

        let swapped = live.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CONNECTION_RECONNECT_DELAY).await;
            swapped.store(1, Ordering::SeqCst);
            bump.send_modify(|generation| *generation += 1);
        });

        let started = tokio::time::Instant::now();
        let handle = live_handle(&mut generation, &closed, || {
            let live = live.clone();
            async move { (live.load(Ordering::SeqCst) == 1).then_some("redialed") }
        })
        .await;

        assert_eq!(handle, Ok("redialed"));
        assert!(started.elapsed() >= CONNECTION_RECONNECT_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn live_handle_returns_at_once_when_connected() {
        let closed = CancellationToken::new();
        let (_bump, mut generation) = watch::channel(0u64);

        let handle = live_handle(&mut generation, &closed, || async { Some(7) }).await;
        assert_eq!(handle, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_redial_fails_the_handle_request() {
        let closed = CancellationToken::new();
        let (_bump, mut generation) = watch::channel(0u64);

        let closer = closed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            closer.cancel();
        });

        let handle: Result<u32, _> = live_handle(&mut generation, &closed, || async { None }).await;
        assert!(matches!(handle, Err(AmqpError::ConnectionError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn relay_presents_one_stream_across_registrations() {
        let closed = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let registrations = Arc::new(AtomicUsize::new(0));

        let counter = registrations.clone();
        let first = stream::iter(vec![Ok::<u32, String>(1), Err("dropped".to_owned()), Ok(2)]);
        let relay = tokio::spawn(relay_deliveries(
            first,
            move || {
                let round = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if round == 1 {
                        Ok(stream::iter(vec![Ok(3), Ok(4)]))
                    } else {
                        Err(AmqpError::ConsumerDeclarationError("q".into()))
                    }
                }
            },
            tx,
            closed.clone(),
            CONSUME_RETRY_DELAY,
        ));

        let mut seen = vec![];
        for _ in 0..4 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);

        closed.cancel();
        assert_eq!(rx.recv().await, None);
        relay.await.unwrap();
        assert!(registrations.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_ends_output_when_closed_before_any_drop() {
        let closed = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<u32>(1);
        let registrations = Arc::new(AtomicUsize::new(0));

        let counter = registrations.clone();
        let relay = tokio::spawn(relay_deliveries(
            stream::pending::<Result<u32, String>>(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(stream::pending()) }
            },
            tx,
            closed.clone(),
            CONSUME_RETRY_DELAY,
        ));

        closed.cancel();
        assert_eq!(rx.recv().await, None);
        relay.await.unwrap();
        assert_eq!(registrations.load(Ordering::SeqCst), 0);
    }
}
