// =============================================================================
// Bitget REST Client — HMAC-SHA256 signed requests against the V2 mix API
// =============================================================================
//
// SECURITY: the secret and passphrase are never logged or serialized. Every
// signed request carries ACCESS-KEY / ACCESS-SIGN / ACCESS-TIMESTAMP /
// ACCESS-PASSPHRASE headers; the signature is
// base64(HMAC-SHA256(secret, timestamp + METHOD + path + body)).
//
// Transient failures (HTTP 429/5xx, transport errors) are retried up to
// MAX_RETRIES with linear backoff; only exhaustion surfaces as
// `ExecError::Transient`, which the caller turns into an api-fault count.
// Structured venue refusals map onto the classified error kinds and are
// never retried.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};

use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::execution::{ExecError, FillEvent};
use crate::types::{GridOrder, Side};

type HmacSha256 = Hmac<Sha256>;

const BASE_URL: &str = "https://api.bitget.com";
const PRODUCT_TYPE: &str = "USDT-FUTURES";
const MARGIN_COIN: &str = "USDT";
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;
/// Remembered trade IDs for fill-poll dedup.
const SEEN_TRADES_CAP: usize = 2048;

pub struct LiveBroker {
    api_key: String,
    secret: String,
    passphrase: String,
    base_url: String,
    client: reqwest::Client,

    /// exchange order id -> (client id, side, qty), for fill correlation.
    order_index: HashMap<String, (String, Side, f64)>,
    seen_trade_ids: HashSet<String>,
    seen_trade_order: VecDeque<String>,
}

impl LiveBroker {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("LiveBroker initialised (base_url={BASE_URL})");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
            base_url: BASE_URL.to_string(),
            client,
            order_index: HashMap::new(),
            seen_trade_ids: HashSet::new(),
            seen_trade_order: VecDeque::new(),
        }
    }

    pub fn supports_reduce_only(&self) -> bool {
        true
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// base64(HMAC-SHA256(secret, timestamp + METHOD + path + body)).
    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let payload = format!("{timestamp}{method}{path}{body}");
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ExecError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.signed_request_once(method.clone(), path, body.as_ref()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt <= MAX_RETRIES => {
                    warn!(path, attempt, error = %e, "transient venue error; retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(
                        RETRY_DELAY_MS * attempt as u64,
                    ))
                    .await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn signed_request_once(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, ExecError> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let signature = self.sign(&timestamp, method.as_str(), path, &body_str);

        let url = format!("{}{path}", self.base_url);
        let mut request = self
            .client
            .request(method, &url)
            .header("ACCESS-KEY", &self.api_key)
            .header("ACCESS-SIGN", signature)
            .header("ACCESS-TIMESTAMP", timestamp)
            .header("ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json")
            .header("locale", "en-US");
        if !body_str.is_empty() {
            request = request.body(body_str);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExecError::Transient(format!("request failed: {e}")))?;
        let status = response.status();

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ExecError::Transient(format!("invalid response body: {e}")))?;

        if status.as_u16() == 429 || status.is_server_error() {
            return Err(ExecError::Transient(format!("http {status}: {value}")));
        }

        let code = value["code"].as_str().unwrap_or_default();
        if code != "00000" {
            let msg = value["msg"].as_str().unwrap_or_default().to_string();
            return Err(classify_venue_error(code, &msg));
        }

        Ok(value)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    pub async fn place_order(&mut self, order: &GridOrder) -> Result<String, ExecError> {
        let body = serde_json::json!({
            "symbol": order.symbol,
            "productType": PRODUCT_TYPE,
            "marginMode": "crossed",
            "marginCoin": MARGIN_COIN,
            "size": format!("{}", order.qty),
            "price": format!("{}", order.price),
            "side": order.side.to_string(),
            "orderType": "limit",
            "force": "gtc",
            "clientOid": order.client_order_id,
            "reduceOnly": if order.reduce_only { "YES" } else { "NO" },
        });

        let value = self
            .signed_request(reqwest::Method::POST, "/api/v2/mix/order/place-order", Some(body))
            .await?;

        let exchange_id = value["data"]["orderId"]
            .as_str()
            .ok_or_else(|| ExecError::Rejected("response missing orderId".to_string()))?
            .to_string();

        self.order_index.insert(
            exchange_id.clone(),
            (order.client_order_id.clone(), order.side, order.qty),
        );
        debug!(
            client_order_id = %order.client_order_id,
            exchange_id = %exchange_id,
            "live order placed"
        );
        Ok(exchange_id)
    }

    pub async fn place_ioc_reduce(
        &mut self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
    ) -> Result<String, ExecError> {
        let client_oid = format!("exit_{}", Utc::now().timestamp_millis());
        let body = serde_json::json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "marginMode": "crossed",
            "marginCoin": MARGIN_COIN,
            "size": format!("{qty}"),
            "price": format!("{price}"),
            "side": side.to_string(),
            "orderType": "limit",
            "force": "ioc",
            "clientOid": client_oid,
            "reduceOnly": "YES",
        });

        let value = self
            .signed_request(reqwest::Method::POST, "/api/v2/mix/order/place-order", Some(body))
            .await?;
        let exchange_id = value["data"]["orderId"]
            .as_str()
            .ok_or_else(|| ExecError::Rejected("response missing orderId".to_string()))?
            .to_string();
        self.order_index
            .insert(exchange_id.clone(), (client_oid, side, qty));
        Ok(exchange_id)
    }

    pub async fn cancel_order(&mut self, client_order_id: &str) -> Result<bool, ExecError> {
        let body = serde_json::json!({
            "productType": PRODUCT_TYPE,
            "clientOid": client_order_id,
        });
        match self
            .signed_request(reqwest::Method::POST, "/api/v2/mix/order/cancel-order", Some(body))
            .await
        {
            Ok(_) => Ok(true),
            // Already gone counts as cancelled.
            Err(ExecError::Rejected(msg)) if msg.contains("order not exist") => Ok(true),
            Err(e) => Err(e),
        }
    }

    pub async fn cancel_all(&mut self, symbol: &str) -> Result<usize, ExecError> {
        let body = serde_json::json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
        });
        let value = self
            .signed_request(
                reqwest::Method::POST,
                "/api/v2/mix/order/cancel-all-orders",
                Some(body),
            )
            .await?;
        let count = value["data"]["successList"]
            .as_array()
            .map(|list| list.len())
            .unwrap_or(0);
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Fills & account
    // -------------------------------------------------------------------------

    /// Poll recent fills and correlate them back to client order IDs.
    /// Previously-seen trade IDs are skipped.
    pub async fn poll_fills(&mut self) -> Result<Vec<FillEvent>, ExecError> {
        let path = format!("/api/v2/mix/order/fills?productType={PRODUCT_TYPE}&limit=100");
        let value = self
            .signed_request(reqwest::Method::GET, &path, None)
            .await?;

        let mut fills = Vec::new();
        let Some(rows) = value["data"]["fillList"].as_array() else {
            return Ok(fills);
        };

        for row in rows {
            let trade_id = row["tradeId"].as_str().unwrap_or_default().to_string();
            if trade_id.is_empty() || self.seen_trade_ids.contains(&trade_id) {
                continue;
            }
            self.remember_trade(trade_id);

            let exchange_id = row["orderId"].as_str().unwrap_or_default().to_string();
            let Some((client_id, side, order_qty)) = self.order_index.get(&exchange_id).cloned()
            else {
                continue;
            };

            let fill_qty = parse_str_f64(&row["baseVolume"]);
            let fill_price = parse_str_f64(&row["price"]);
            let fee = row["feeDetail"]
                .as_array()
                .and_then(|fees| fees.first())
                .map(|f| parse_str_f64(&f["totalFee"]).abs())
                .unwrap_or(0.0);

            fills.push(FillEvent {
                symbol: row["symbol"].as_str().unwrap_or_default().to_string(),
                client_order_id: client_id,
                exchange_order_id: exchange_id,
                side,
                fill_price,
                fill_qty,
                fee,
                fee_currency: MARGIN_COIN.to_string(),
                is_partial: fill_qty + 1e-12 < order_qty,
                remaining_qty: (order_qty - fill_qty).max(0.0),
                timestamp: Utc::now(),
            });
        }

        Ok(fills)
    }

    fn remember_trade(&mut self, trade_id: String) {
        self.seen_trade_ids.insert(trade_id.clone());
        self.seen_trade_order.push_back(trade_id);
        while self.seen_trade_order.len() > SEEN_TRADES_CAP {
            if let Some(oldest) = self.seen_trade_order.pop_front() {
                self.seen_trade_ids.remove(&oldest);
            }
        }
    }

    /// GET the account view fields the engine reconciles from.
    pub async fn get_account(
        &self,
        symbol: &str,
    ) -> Result<(f64, f64, f64, f64, Option<f64>), ExecError> {
        let path = format!(
            "/api/v2/mix/account/account?symbol={symbol}&productType={PRODUCT_TYPE}&marginCoin={MARGIN_COIN}"
        );
        let value = self
            .signed_request(reqwest::Method::GET, &path, None)
            .await?;
        let data = &value["data"];

        Ok((
            parse_str_f64(&data["accountEquity"]),
            parse_str_f64(&data["available"]),
            parse_str_f64(&data["locked"]),
            // Cross maintenance-margin rate reads as a ratio.
            parse_str_f64(&data["crossedRiskRate"]),
            data["liquidationPrice"]
                .as_str()
                .and_then(|s| s.parse().ok()),
        ))
    }

    /// GET the venue-side position size (signed), for reconciliation.
    pub async fn get_position(&self, symbol: &str) -> Result<f64, ExecError> {
        let path = format!(
            "/api/v2/mix/position/single-position?symbol={symbol}&productType={PRODUCT_TYPE}&marginCoin={MARGIN_COIN}"
        );
        let value = self
            .signed_request(reqwest::Method::GET, &path, None)
            .await?;

        let Some(rows) = value["data"].as_array() else {
            return Ok(0.0);
        };
        let mut qty = 0.0;
        for row in rows {
            let size = parse_str_f64(&row["total"]);
            match row["holdSide"].as_str() {
                Some("long") => qty += size,
                Some("short") => qty -= size,
                _ => {}
            }
        }
        Ok(qty)
    }
}

impl std::fmt::Debug for LiveBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveBroker")
            .field("base_url", &self.base_url)
            .field("tracked_orders", &self.order_index.len())
            .finish()
    }
}

fn parse_str_f64(value: &serde_json::Value) -> f64 {
    match value {
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Map venue error codes onto the classified kinds.
fn classify_venue_error(code: &str, msg: &str) -> ExecError {
    match code {
        // Duplicate clientOid.
        "40757" | "40786" => ExecError::Duplicate(format!("{code}: {msg}")),
        // Insufficient margin / balance family.
        "40754" | "43012" | "40762" => ExecError::InsufficientMargin(format!("{code}: {msg}")),
        // Too many requests reported at the application layer.
        "429" | "30007" => ExecError::Transient(format!("{code}: {msg}")),
        _ => ExecError::Rejected(format!("{code}: {msg}")),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_base64() {
        let broker = LiveBroker::new("key", "secret", "pass");
        let a = broker.sign("1700000000000", "POST", "/api/v2/mix/order/place-order", "{}");
        let b = broker.sign("1700000000000", "POST", "/api/v2/mix/order/place-order", "{}");
        assert_eq!(a, b);
        assert!(base64::engine::general_purpose::STANDARD.decode(&a).is_ok());

        // Any payload change moves the signature.
        let c = broker.sign("1700000000001", "POST", "/api/v2/mix/order/place-order", "{}");
        assert_ne!(a, c);
    }

    #[test]
    fn venue_error_classification() {
        assert!(matches!(
            classify_venue_error("40757", "duplicate clientOid"),
            ExecError::Duplicate(_)
        ));
        assert!(matches!(
            classify_venue_error("40754", "balance not enough"),
            ExecError::InsufficientMargin(_)
        ));
        assert!(matches!(
            classify_venue_error("30007", "request too frequent"),
            ExecError::Transient(_)
        ));
        assert!(matches!(
            classify_venue_error("40034", "param error"),
            ExecError::Rejected(_)
        ));
    }

    #[test]
    fn trade_dedup_window_is_bounded() {
        let mut broker = LiveBroker::new("key", "secret", "pass");
        for i in 0..(SEEN_TRADES_CAP + 10) {
            broker.remember_trade(format!("trade_{i}"));
        }
        assert_eq!(broker.seen_trade_order.len(), SEEN_TRADES_CAP);
        assert!(!broker.seen_trade_ids.contains("trade_0"));
        assert!(broker
            .seen_trade_ids
            .contains(&format!("trade_{}", SEEN_TRADES_CAP + 9)));
    }
}
