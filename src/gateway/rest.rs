//! Signed Kraken REST client (spec §4.1, §6.1).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, instrument, warn};

use crate::errors::GatewayError;

const BASE_URL: &str = "https://api.kraken.com";

pub struct KrakenRestClient {
    api_key: String,
    api_secret: String,
    base_url: String,
    http: Client,
}

impl std::fmt::Debug for KrakenRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KrakenRestClient")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl KrakenRestClient {
    pub fn new(api_key: String, api_secret: String) -> Self {
        Self {
            api_key,
            api_secret,
            base_url: BASE_URL.to_string(),
            http: Client::new(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(api_key: String, api_secret: String, base_url: String) -> Self {
        Self {
            api_key,
            api_secret,
            base_url,
            http: Client::new(),
        }
    }

    fn nonce() -> String {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis()
            .to_string()
    }

    /// `HMAC-SHA512(secret, path || SHA256(nonce || body))`, base64-encoded.
    fn sign(&self, path: &str, nonce: &str, body: &str) -> Result<String, GatewayError> {
        let mut sha256 = Sha256::new();
        sha256.update(nonce.as_bytes());
        sha256.update(body.as_bytes());
        let digest = sha256.finalize();

        let secret = general_purpose::STANDARD
            .decode(&self.api_secret)
            .map_err(|e| GatewayError::Exchange(format!("invalid api secret encoding: {e}")))?;
        let mut mac = Hmac::<Sha512>::new_from_slice(&secret)
            .map_err(|e| GatewayError::Exchange(format!("invalid hmac key: {e}")))?;
        mac.update(path.as_bytes());
        mac.update(&digest);
        Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    #[instrument(skip(self), name = "kraken::public")]
    pub async fn public_request(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        self.with_retry(path, 3, || async {
            let resp = self
                .http
                .get(&url)
                .query(params)
                .send()
                .await
                .map_err(|e| GatewayError::Transport(e.to_string()))?;
            parse_kraken_response(resp).await
        })
        .await
    }

    #[instrument(skip(self, params), name = "kraken::private")]
    pub async fn private_request(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, GatewayError> {
        let max_attempts = if path == "/0/private/OpenOrders" { 5 } else { 3 };
        let url = format!("{}{}", self.base_url, path);

        self.with_retry(path, max_attempts, || async {
            let nonce = Self::nonce();
            let mut form: Vec<(String, String)> = vec![("nonce".to_string(), nonce.clone())];
            for (k, v) in params {
                form.push((k.to_string(), v.clone()));
            }
            let body = serde_urlencoded::to_string(&form)
                .map_err(|e| GatewayError::Parse(e.to_string()))?;

            let signature = self.sign(path, &nonce, &body)?;

            let resp = self
                .http
                .post(&url)
                .header("API-Key", &self.api_key)
                .header("API-Sign", signature)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(body)
                .send()
                .await
                .map_err(|e| GatewayError::Transport(e.to_string()))?;
            parse_kraken_response(resp).await
        })
        .await
    }

    /// Up to `max_attempts` tries, 250ms × attempt linear backoff. For
    /// `/0/private/OpenOrders`, retries extend to 5 attempts specifically for
    /// `"Invalid nonce"` / `"timeout"` errors; other errors are not retried.
    async fn with_retry<F, Fut>(
        &self,
        path: &str,
        max_attempts: u32,
        mut op: F,
    ) -> Result<Value, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Value, GatewayError>>,
    {
        let mut last_err = None;
        for attempt in 1..=max_attempts {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let retryable = match &e {
                        GatewayError::Transport(_) => true,
                        GatewayError::Exchange(_) if path == "/0/private/OpenOrders" => {
                            e.is_retryable_open_orders()
                        }
                        _ => false,
                    };
                    warn!(path, attempt, error = %e, retryable, "kraken request failed");
                    last_err = Some(e);
                    if !retryable || attempt == max_attempts {
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(250 * attempt as u64))
                        .await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| GatewayError::Transport("no attempts made".into())))
    }

    pub async fn latest_ohlc(&self, pair: &str, interval: u32) -> Result<Value, GatewayError> {
        self.public_request(
            "/0/public/OHLC",
            &[("pair", pair.to_string()), ("interval", interval.to_string())],
        )
        .await
    }

    pub async fn historical_ohlc(
        &self,
        pair: &str,
        interval: u32,
        since: Option<i64>,
    ) -> Result<Value, GatewayError> {
        let mut params = vec![("pair", pair.to_string()), ("interval", interval.to_string())];
        if let Some(s) = since {
            params.push(("since", s.to_string()));
        }
        self.public_request("/0/public/OHLC", &params).await
    }

    pub async fn tradable_pairs(&self, pair: &str) -> Result<Value, GatewayError> {
        self.public_request("/0/public/AssetPairs", &[("pair", pair.to_string())])
            .await
    }

    pub async fn ticker(&self, pair: &str) -> Result<Value, GatewayError> {
        self.public_request("/0/public/Ticker", &[("pair", pair.to_string())])
            .await
    }

    pub async fn account_balances(&self) -> Result<Value, GatewayError> {
        self.private_request("/0/private/Balance", &[]).await
    }

    pub async fn submit_order(
        &self,
        pair: &str,
        side: &str,
        order_type: &str,
        volume: f64,
        price: Option<f64>,
    ) -> Result<Value, GatewayError> {
        let mut params: HashMap<&str, String> = HashMap::new();
        params.insert("pair", pair.to_string());
        params.insert("type", side.to_string());
        params.insert("ordertype", order_type.to_string());
        params.insert("volume", volume.to_string());
        if let Some(p) = price {
            params.insert("price", p.to_string());
        }
        let kv: Vec<(&str, String)> = params.into_iter().collect();
        self.private_request("/0/private/AddOrder", &kv).await
    }

    pub async fn open_orders(&self) -> Result<Value, GatewayError> {
        self.private_request("/0/private/OpenOrders", &[]).await
    }

    pub async fn closed_orders(&self) -> Result<Value, GatewayError> {
        self.private_request("/0/private/ClosedOrders", &[]).await
    }

    pub async fn cancel_order(&self, txid: &str) -> Result<Value, GatewayError> {
        self.private_request("/0/private/CancelOrder", &[("txid", txid.to_string())])
            .await
    }

    pub async fn ws_token(&self) -> Result<Value, GatewayError> {
        self.private_request("/0/private/GetWebSocketsToken", &[]).await
    }
}

async fn parse_kraken_response(resp: reqwest::Response) -> Result<Value, GatewayError> {
    let text = resp
        .text()
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))?;
    let json: Value =
        serde_json::from_str(&text).map_err(|e| GatewayError::Parse(e.to_string()))?;
    extract_result(json)
}

/// Pure envelope-unwrapping step, split out from the async response read so
/// it can be exercised directly against fixture JSON in tests.
fn extract_result(json: Value) -> Result<Value, GatewayError> {
    if let Some(errors) = json.get("error").and_then(|e| e.as_array()) {
        if !errors.is_empty() {
            let message = errors
                .iter()
                .filter_map(|e| e.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(GatewayError::Exchange(message));
        }
    }
    debug!("kraken response ok");
    json.get("result")
        .cloned()
        .ok_or_else(|| GatewayError::Parse("missing result field".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_produces_deterministic_base64() {
        let client = KrakenRestClient::new(
            "key".into(),
            general_purpose::STANDARD.encode(b"supersecretvalue"),
        );
        let sig1 = client.sign("/0/private/Balance", "123", "nonce=123").unwrap();
        let sig2 = client.sign("/0/private/Balance", "123", "nonce=123").unwrap();
        assert_eq!(sig1, sig2);
        assert!(general_purpose::STANDARD.decode(&sig1).is_ok());
    }

    #[test]
    fn sign_differs_per_path() {
        let client = KrakenRestClient::new(
            "key".into(),
            general_purpose::STANDARD.encode(b"supersecretvalue"),
        );
        let sig_a = client.sign("/0/private/Balance", "123", "nonce=123").unwrap();
        let sig_b = client
            .sign("/0/private/AddOrder", "123", "nonce=123")
            .unwrap();
        assert_ne!(sig_a, sig_b);
    }

    #[test]
    fn invalid_secret_encoding_is_an_exchange_error() {
        let client = KrakenRestClient::new("key".into(), "not-valid-base64!!".into());
        assert!(client.sign("/0/private/Balance", "1", "nonce=1").is_err());
    }

    #[test]
    fn non_empty_error_array_is_fatal() {
        let json: Value =
            serde_json::from_str(r#"{"error":["EGeneral:Invalid arguments"],"result":{}}"#)
                .unwrap();
        assert!(matches!(extract_result(json), Err(GatewayError::Exchange(_))));
    }

    #[test]
    fn empty_error_array_returns_result_field() {
        let json: Value =
            serde_json::from_str(r#"{"error":[],"result":{"ZUSD":"1000.0"}}"#).unwrap();
        let result = extract_result(json).unwrap();
        assert_eq!(result["ZUSD"], "1000.0");
    }

    #[test]
    fn invalid_nonce_on_open_orders_is_retryable() {
        let e = GatewayError::Exchange("EAPI:Invalid nonce".into());
        assert!(e.is_retryable_open_orders());
        let e = GatewayError::Exchange("EGeneral:Invalid arguments".into());
        assert!(!e.is_retryable_open_orders());
    }
}
