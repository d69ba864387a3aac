// =============================================================================
// Bitget Market Feed — public WebSocket candles + ticker
// =============================================================================
//
// Subscribes to the candle and ticker channels for one instrument and turns
// pushes into engine events. Bar closes are detected by the candle open-time
// advancing; the previous in-progress candle is then final.
//
// The caller owns the reconnect policy (loop + sleep on error), mirroring the
// stream tasks in main.
// =============================================================================

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::engine::EngineEvent;
use crate::market_data::Candle;

const WS_URL: &str = "wss://ws.bitget.com/v2/ws/public";
const PING_INTERVAL_SECS: u64 = 25;

/// Run one WebSocket session; returns when the stream drops.
pub async fn run_market_feed(
    symbol: &str,
    bar_tf: &str,
    tx: UnboundedSender<EngineEvent>,
) -> Result<()> {
    let (ws, _) = connect_async(WS_URL)
        .await
        .context("failed to connect to market WebSocket")?;
    let (mut sink, mut stream) = ws.split();

    let channel = format!("candle{}", bar_tf);
    let subscribe = serde_json::json!({
        "op": "subscribe",
        "args": [
            { "instType": "USDT-FUTURES", "channel": channel, "instId": symbol },
            { "instType": "USDT-FUTURES", "channel": "ticker", "instId": symbol },
        ]
    });
    sink.send(Message::Text(subscribe.to_string()))
        .await
        .context("failed to send subscribe request")?;
    info!(symbol, bar_tf, "market feed subscribed");

    let mut ping = tokio::time::interval(std::time::Duration::from_secs(PING_INTERVAL_SECS));
    // The candle currently forming; emitted as BarClose once superseded.
    let mut forming: Option<Candle> = None;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                sink.send(Message::Text("ping".to_string()))
                    .await
                    .context("failed to send ping")?;
            }
            message = stream.next() => {
                let Some(message) = message else {
                    warn!(symbol, "market stream closed by peer");
                    return Ok(());
                };
                let message = message.context("market stream error")?;
                let Message::Text(text) = message else { continue };
                if text == "pong" {
                    continue;
                }

                let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
                    continue;
                };
                let channel_name = value["arg"]["channel"].as_str().unwrap_or_default();

                if channel_name.starts_with("candle") {
                    handle_candle(&value, &mut forming, &tx);
                } else if channel_name == "ticker" {
                    handle_ticker(&value, &tx);
                }
            }
        }
    }
}

fn handle_candle(
    value: &serde_json::Value,
    forming: &mut Option<Candle>,
    tx: &UnboundedSender<EngineEvent>,
) {
    let Some(rows) = value["data"].as_array() else {
        return;
    };
    for row in rows {
        let Some(candle) = parse_candle_row(row) else {
            continue;
        };

        match forming {
            Some(previous) if candle.open_time > previous.open_time => {
                // A new bar opened: the previous one is final.
                let mut closed = previous.clone();
                closed.is_closed = true;
                debug!(open_time = closed.open_time, close = closed.close, "bar closed");
                let _ = tx.send(EngineEvent::BarClose(closed));
                *forming = Some(candle);
            }
            _ => *forming = Some(candle),
        }
    }
}

fn handle_ticker(value: &serde_json::Value, tx: &UnboundedSender<EngineEvent>) {
    let Some(rows) = value["data"].as_array() else {
        return;
    };
    for row in rows {
        let last = parse_f64(&row["lastPr"]);
        let mark = parse_f64(&row["markPrice"]).or(last);
        if let (Some(mark), Some(last)) = (mark, last) {
            let _ = tx.send(EngineEvent::PriceUpdate { mark, last });
        }
    }
}

/// Candle rows arrive as arrays of strings:
/// `[ts, open, high, low, close, baseVol, quoteVol, usdtVol]`.
fn parse_candle_row(row: &serde_json::Value) -> Option<Candle> {
    let fields = row.as_array()?;
    if fields.len() < 6 {
        return None;
    }
    Some(Candle {
        open_time: fields[0].as_str()?.parse().ok()?,
        open: fields[1].as_str()?.parse().ok()?,
        high: fields[2].as_str()?.parse().ok()?,
        low: fields[3].as_str()?.parse().ok()?,
        close: fields[4].as_str()?.parse().ok()?,
        volume: fields[5].as_str()?.parse().ok()?,
        is_closed: false,
    })
}

fn parse_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}
