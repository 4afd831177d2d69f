// =============================================================================
// Feed REST Client — HMAC-SHA256 signed historical trade queries
// =============================================================================
//
// SECURITY: the secret key is used only for request signing and is never
// logged or serialized. Every request carries the API key header plus a
// millisecond timestamp and signature in the query string.
// =============================================================================

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::feed::wire::{TradePage, WireTrade};

type HmacSha256 = Hmac<Sha256>;

/// Page size requested from the history endpoint.
const PAGE_LIMIT: u32 = 5000;

/// REST client for the feed's historical trade endpoint.
#[derive(Clone)]
pub struct FeedRestClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl FeedRestClient {
    /// Create a new client against `base_url`. The key travels as a header;
    /// the secret signs each query string.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-FEED-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");

        Self {
            secret: secret.into(),
            base_url: base_url.into(),
            client,
        }
    }

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp
    /// and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = format!("{params}&timestamp={ts}");
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// GET /v1/trades/{symbol} — all trades for `symbol` in
    /// `[start_utc_ms, end_utc_ms]`, following cursor pagination to the end.
    pub async fn fetch_trades(
        &self,
        symbol: &str,
        start_utc_ms: i64,
        end_utc_ms: i64,
    ) -> Result<Vec<WireTrade>> {
        let mut trades: Vec<WireTrade> = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params =
                format!("start_ms={start_utc_ms}&end_ms={end_utc_ms}&limit={PAGE_LIMIT}");
            if let Some(c) = &cursor {
                params.push_str(&format!("&cursor={c}"));
            }
            let qs = self.signed_query(&params);
            let url = format!("{}/v1/trades/{}?{}", self.base_url, symbol, qs);

            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .with_context(|| format!("GET /v1/trades/{symbol} request failed"))?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                anyhow::bail!("GET /v1/trades/{symbol} returned {status}: {body}");
            }

            let page: TradePage = resp
                .json()
                .await
                .with_context(|| format!("failed to parse trade page for {symbol}"))?;

            trades.extend(page.results);

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(symbol, count = trades.len(), "historical trades fetched");
        Ok(trades)
    }
}

impl std::fmt::Debug for FeedRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedRestClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
