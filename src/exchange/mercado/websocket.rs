//! Mercado Bitcoin public WebSocket channels.

use super::types::{Subscribe, Subscription, WsEnvelope};
use crate::exchange::error::ExchangeError;
use crate::exchange::stream::{MarketStream, STREAM_BUFFER};
use crate::exchange::types::Market;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

pub const WS_URL: &str = "wss://ws.mercadobitcoin.net/ws";

const HEARTBEAT: Duration = Duration::from_secs(10);

/// Public channel names accepted by `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsChannel {
    Ticker,
    OrderBook,
    Trade,
}

impl WsChannel {
    pub fn name(&self) -> &'static str {
        match self {
            WsChannel::Ticker => "ticker",
            WsChannel::OrderBook => "orderbook",
            WsChannel::Trade => "trade",
        }
    }
}

/// Open one socket subscribed to `channel` for `market`.
///
/// `parse` turns a message's `data` payload into the normalized type;
/// messages it rejects are skipped. The stream ends when the socket closes.
pub async fn subscribe<T, P>(
    url: &str,
    channel: WsChannel,
    market: &Market,
    parse: P,
) -> Result<MarketStream<T>, ExchangeError>
where
    T: Send + 'static,
    P: Fn(Value) -> Option<T> + Send + 'static,
{
    let endpoint = format!("{}:{}", channel.name(), market.symbol);
    info!(endpoint = %endpoint, "Opening WebSocket connection");

    let (ws_stream, _) = connect_async(url).await?;
    let (mut write, mut read) = ws_stream.split();

    let subscribe = Subscribe {
        kind: "subscribe",
        subscription: Subscription {
            name: channel.name(),
            id: format!("{}{}", market.quote, market.base),
            limit: 200,
        },
    };
    write
        .send(Message::Text(serde_json::to_string(&subscribe)?.into()))
        .await?;

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let producer = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if write.send(Message::Text(r#"{"type":"ping"}"#.into())).await.is_err() {
                        warn!(endpoint = %endpoint, "Heartbeat failed");
                        break;
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(envelope) = serde_json::from_str::<WsEnvelope>(&text) else {
                            continue;
                        };
                        if envelope.kind == "error" {
                            warn!(endpoint = %endpoint, message = %text, "Channel error");
                            break;
                        }
                        let (Some(_), Some(data)) = (envelope.id, envelope.data) else {
                            continue;
                        };
                        if let Some(item) = parse(data) {
                            if tx.send(item).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(endpoint = %endpoint, "WebSocket connection closed");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(endpoint = %endpoint, error = %e, "WebSocket error");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    });

    Ok(MarketStream::new(rx, producer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_payload() {
        let subscribe = Subscribe {
            kind: "subscribe",
            subscription: Subscription {
                name: WsChannel::OrderBook.name(),
                id: "BRLBTC".into(),
                limit: 200,
            },
        };
        let json = serde_json::to_value(&subscribe).unwrap();
        assert_eq!(json["type"], "subscribe");
        assert_eq!(json["subscription"]["name"], "orderbook");
        assert_eq!(json["subscription"]["id"], "BRLBTC");
    }
}
