//! Binance spot market streams.

use crate::exchange::error::ExchangeError;
use crate::exchange::stream::{MarketStream, STREAM_BUFFER};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

pub const SPOT_WS_URL: &str = "wss://stream.binance.com:9443";
pub const SPOT_TESTNET_WS_URL: &str = "wss://stream.testnet.binance.vision";

/// Stream name for a venue symbol id, e.g. `btcusdt@bookTicker`.
pub fn stream_name(market_id: &str, channel: &str) -> String {
    format!("{}@{}", market_id.to_lowercase(), channel)
}

/// Connect to a raw stream and forward every message `parser` accepts.
///
/// The returned stream ends when the socket closes or errors.
pub async fn connect_and_handle<T, F>(
    base_url: &str,
    stream: &str,
    parser: F,
) -> Result<MarketStream<T>, ExchangeError>
where
    T: Send + 'static,
    F: Fn(&str) -> Option<T> + Send + 'static,
{
    let url = format!("{}/ws/{}", base_url, stream);
    info!("Connecting to WebSocket: {}", url);

    let (ws_stream, _) = connect_async(&url).await?;
    let (_write, mut read) = ws_stream.split();

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let producer = tokio::spawn(async move {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Some(item) = parser(&text) {
                        if tx.send(item).await.is_err() {
                            warn!("Stream receiver dropped");
                            return;
                        }
                    }
                }
                Ok(Message::Ping(_)) => {
                    // pong is sent by tungstenite
                    debug!("Received ping");
                }
                Ok(Message::Close(_)) => {
                    info!("WebSocket closed by server");
                    return;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    return;
                }
                _ => {}
            }
        }
    });

    Ok(MarketStream::new(rx, producer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_name() {
        assert_eq!(stream_name("BTCUSDT", "depth20@100ms"), "btcusdt@depth20@100ms");
    }
}
