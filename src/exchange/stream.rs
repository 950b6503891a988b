//! Market data streams.
//!
//! A [`MarketStream`] is a cancellable producer task feeding a channel. Push
//! feeds are wrapped by [`supervised_stream`], which replaces stale messages
//! with REST snapshots, falls back to polling while the feed is silent, and
//! reconnects closed sockets with backoff.

use crate::exchange::error::ExchangeError;
use crate::exchange::types::{OrderBook, Quote, Trade};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Buffered messages per stream before the producer waits.
pub const STREAM_BUFFER: usize = 64;

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Messages carrying the venue time they were produced at.
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;

    /// Time elapsed since the message was produced.
    fn age(&self) -> Duration {
        (Utc::now() - self.timestamp()).to_std().unwrap_or_default()
    }
}

impl Timestamped for Quote {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Timestamped for OrderBook {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Timestamped for Trade {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// An infinite sequence of normalized messages from one venue channel.
///
/// Dropping the stream stops its producer task.
pub struct MarketStream<T> {
    rx: mpsc::Receiver<T>,
    producer: Option<JoinHandle<()>>,
}

impl<T> MarketStream<T> {
    pub fn new(rx: mpsc::Receiver<T>, producer: JoinHandle<()>) -> Self {
        Self {
            rx,
            producer: Some(producer),
        }
    }

    /// Stream fed by a sender owned elsewhere (mock venues, tests).
    pub fn from_receiver(rx: mpsc::Receiver<T>) -> Self {
        Self { rx, producer: None }
    }

    /// Next message, or `None` once the producer has stopped.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Drop for MarketStream<T> {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

/// Stream produced by calling `fetch` every `interval`.
///
/// Fetch failures are logged and skipped; the next poll tries again.
pub fn polling_stream<T, F, Fut>(label: String, interval: Duration, mut fetch: F) -> MarketStream<T>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, ExchangeError>> + Send,
{
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let producer = tokio::spawn(async move {
        loop {
            match fetch().await {
                Ok(msg) => {
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!(stream = %label, error = %e, "Poll failed"),
            }
            tokio::time::sleep(interval).await;
        }
    });
    MarketStream::new(rx, producer)
}

/// Freshness limits for one supervised channel.
#[derive(Debug, Clone, Copy)]
pub struct Freshness {
    /// Pushed messages older than this are replaced by a snapshot
    pub max_age: Duration,
    /// Silence after which a snapshot is fetched instead of waiting
    pub stall_timeout: Duration,
}

/// Wrap a push feed with staleness replacement, stall fallback and reconnects.
///
/// `connect` opens the push feed; `snapshot` fetches the same data over REST.
pub fn supervised_stream<T, C, CFut, S, SFut>(
    label: String,
    freshness: Freshness,
    mut connect: C,
    mut snapshot: S,
) -> MarketStream<T>
where
    T: Timestamped + Send + 'static,
    C: FnMut() -> CFut + Send + 'static,
    CFut: Future<Output = Result<MarketStream<T>, ExchangeError>> + Send,
    S: FnMut() -> SFut + Send + 'static,
    SFut: Future<Output = Result<T, ExchangeError>> + Send,
{
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let producer = tokio::spawn(async move {
        let mut backoff = RECONNECT_BASE;
        while !tx.is_closed() {
            match connect().await {
                Ok(mut push) => {
                    backoff = RECONNECT_BASE;
                    loop {
                        let next = tokio::time::timeout(freshness.stall_timeout, push.next()).await;
                        let msg = match next {
                            Ok(Some(msg)) if msg.age() <= freshness.max_age => Some(msg),
                            Ok(Some(stale)) => {
                                debug!(stream = %label, age_ms = stale.age().as_millis() as u64, "Stale message, fetching snapshot");
                                snapshot().await.ok().or(Some(stale))
                            }
                            Ok(None) => break,
                            Err(_) => {
                                debug!(stream = %label, "Stream silent, fetching snapshot");
                                snapshot().await.ok()
                            }
                        };
                        if let Some(msg) = msg {
                            if tx.send(msg).await.is_err() {
                                return;
                            }
                        }
                    }
                    warn!(stream = %label, "Push feed closed, reconnecting");
                }
                Err(e) => {
                    warn!(stream = %label, error = %e, "Push feed unavailable, polling");
                    if let Ok(msg) = snapshot().await {
                        if tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    });
    MarketStream::new(rx, producer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quote(age_ms: i64) -> Quote {
        Quote {
            symbol: "BTC/USDT".into(),
            bid: dec!(100),
            ask: dec!(101),
            last: dec!(100.5),
            timestamp: Utc::now() - chrono::Duration::milliseconds(age_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_stream_emits_each_interval() {
        let polls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&polls);
        let mut stream = polling_stream("test".into(), Duration::from_secs(2), move || {
            let counter = Arc::clone(&counter);
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst)) }
        });

        assert_eq!(stream.next().await, Some(0));
        assert_eq!(stream.next().await, Some(1));
        assert_eq!(stream.next().await, Some(2));
    }

    #[tokio::test]
    async fn test_stale_push_message_replaced_by_snapshot() {
        let freshness = Freshness {
            max_age: Duration::from_millis(1500),
            stall_timeout: Duration::from_secs(10),
        };
        let mut stream = supervised_stream(
            "quote".into(),
            freshness,
            || async {
                let (tx, rx) = mpsc::channel(4);
                let _ = tx.send(quote(60_000)).await;
                // keep the feed open without further messages
                std::mem::forget(tx);
                Ok(MarketStream::from_receiver(rx))
            },
            || async {
                let mut fresh = quote(0);
                fresh.bid = dec!(200);
                Ok(fresh)
            },
        );

        let first = stream.next().await.unwrap();
        assert_eq!(first.bid, dec!(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_push_feed_falls_back_to_snapshots() {
        let freshness = Freshness {
            max_age: Duration::from_millis(1500),
            stall_timeout: Duration::from_secs(10),
        };
        let (push_tx, push_rx) = mpsc::channel::<Quote>(4);
        let push_rx = Arc::new(tokio::sync::Mutex::new(Some(push_rx)));
        let mut stream = supervised_stream(
            "quote".into(),
            freshness,
            move || {
                let push_rx = Arc::clone(&push_rx);
                async move {
                    match push_rx.lock().await.take() {
                        Some(rx) => Ok(MarketStream::from_receiver(rx)),
                        None => Err(ExchangeError::Network("gone".into())),
                    }
                }
            },
            || async { Ok(quote(0)) },
        );

        let started = tokio::time::Instant::now();
        assert!(stream.next().await.is_some());
        assert!(started.elapsed() >= Duration::from_secs(10));
        drop(push_tx);
    }
}
