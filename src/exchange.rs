//! Exchange identifiers and the adapter capability surface.
//!
//! Every venue implements [`ExchangeAdapter`]; callers pick adapters by
//! [`Exchange`] through an [`AdapterSet`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{ConfigError, FetchError};
use crate::strategy::types::{
    AccountSnapshot, FundingHistoryPoint, FundingRate, MarketKind, OrderBookSnapshot, PriceLevel,
};
use crate::{binance, bitget, bybit, gateio, hyperliquid, okx};

const HTTP_TIMEOUT_SECS: u64 = 10;

/// How far back adapters page through funding history.
pub(crate) const HISTORY_LOOKBACK_MS: i64 = 12 * 7 * 24 * 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Bybit,
    Okx,
    Bitget,
    Gateio,
    Hyperliquid,
}

/// Accepted spellings, lowercase.
static EXCHANGE_ALIASES: Lazy<HashMap<&'static str, Exchange>> = Lazy::new(|| {
    let mut map = HashMap::with_capacity(16);

    map.insert("binance", Exchange::Binance);
    map.insert("binanceusdm", Exchange::Binance);
    map.insert("bybit", Exchange::Bybit);
    map.insert("okx", Exchange::Okx);
    map.insert("okex", Exchange::Okx);
    map.insert("bitget", Exchange::Bitget);
    map.insert("gateio", Exchange::Gateio);
    map.insert("gate", Exchange::Gateio);
    map.insert("gate.io", Exchange::Gateio);
    map.insert("hyperliquid", Exchange::Hyperliquid);
    map.insert("hl", Exchange::Hyperliquid);

    map
});

impl Exchange {
    pub const ALL: [Exchange; 6] = [
        Exchange::Binance,
        Exchange::Bybit,
        Exchange::Okx,
        Exchange::Bitget,
        Exchange::Gateio,
        Exchange::Hyperliquid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
            Exchange::Okx => "okx",
            Exchange::Bitget => "bitget",
            Exchange::Gateio => "gateio",
            Exchange::Hyperliquid => "hyperliquid",
        }
    }

    /// Exchange-native symbol for a base token quoted in USDT (USDC on Hyperliquid).
    pub fn symbol_for(&self, base_token: &str, market: MarketKind) -> String {
        let base = base_token.trim().to_uppercase();
        match (self, market) {
            (Exchange::Binance | Exchange::Bybit | Exchange::Bitget, _) => format!("{}USDT", base),
            (Exchange::Okx, MarketKind::Perpetual) => format!("{}-USDT-SWAP", base),
            (Exchange::Okx, MarketKind::Spot) => format!("{}-USDT", base),
            (Exchange::Gateio, _) => format!("{}_USDT", base),
            (Exchange::Hyperliquid, _) => base,
        }
    }

    /// Base token of an exchange-native symbol (`BTC-USDT-SWAP` -> `BTC`).
    pub fn base_token(&self, symbol: &str) -> String {
        let upper = symbol.trim().to_uppercase();
        match self {
            Exchange::Okx => upper.split('-').next().unwrap_or(&upper).to_string(),
            Exchange::Gateio => upper.split('_').next().unwrap_or(&upper).to_string(),
            Exchange::Hyperliquid => upper,
            Exchange::Binance | Exchange::Bybit | Exchange::Bitget => {
                let mut base = upper.as_str();
                for quote in ["USDT", "USDC", "USD"] {
                    if let Some(b) = base.strip_suffix(quote) {
                        if !b.is_empty() {
                            base = b;
                            break;
                        }
                    }
                }
                base.to_string()
            }
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_lowercase();
        EXCHANGE_ALIASES
            .get(key.as_str())
            .copied()
            .ok_or_else(|| ConfigError::UnknownExchange(s.to_string()))
    }
}

/// Capability surface every exchange adapter provides.
///
/// Methods take a base token (`BTC`); the adapter maps it to its own symbol.
/// Each call may fail independently of the others.
#[async_trait::async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// Exchange-native symbol for a base token.
    fn symbol(&self, base_token: &str, market: MarketKind) -> String {
        self.exchange().symbol_for(base_token, market)
    }

    /// Current funding rate. Fails when the token is not listed.
    async fn fetch_funding_rate(&self, base_token: &str) -> Result<FundingRate, FetchError>;

    /// Settled funding history, ascending by funding time.
    async fn fetch_funding_history(&self, base_token: &str) -> Result<Vec<FundingHistoryPoint>, FetchError>;

    /// 24h traded volume in quote currency.
    async fn fetch_volume_24h(&self, base_token: &str) -> Result<f64, FetchError>;

    async fn fetch_depth(&self, base_token: &str, market: MarketKind) -> Result<OrderBookSnapshot, FetchError>;

    /// Units of the underlying per contract. Defaults to 1.
    async fn contract_size(&self, _base_token: &str, _market: MarketKind) -> Result<f64, FetchError> {
        Ok(1.0)
    }

    /// Open positions, spot balances and margin balance for the configured account.
    async fn fetch_account(&self) -> Result<AccountSnapshot, FetchError> {
        Err(FetchError::Unsupported {
            exchange: self.exchange(),
            capability: "account data",
        })
    }
}

/// Adapters keyed by exchange.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<Exchange, Arc<dyn ExchangeAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build REST adapters for every exchange selected in `config`.
    pub fn live(config: &EngineConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;

        let mut set = Self::new();
        for &exchange in &config.exchanges {
            let adapter: Arc<dyn ExchangeAdapter> = match exchange {
                Exchange::Binance => Arc::new(binance::BinanceAdapter::new(
                    client.clone(),
                    config.credentials.binance.clone(),
                )),
                Exchange::Bybit => Arc::new(bybit::BybitAdapter::new(
                    client.clone(),
                    config.credentials.bybit.clone(),
                )),
                Exchange::Okx => Arc::new(okx::OkxAdapter::new(
                    client.clone(),
                    config.credentials.okx.clone(),
                )),
                Exchange::Bitget => Arc::new(bitget::BitgetAdapter::new(client.clone())),
                Exchange::Gateio => Arc::new(gateio::GateioAdapter::new(client.clone())),
                Exchange::Hyperliquid => Arc::new(hyperliquid::HyperliquidAdapter::new(
                    client.clone(),
                    config.credentials.hyperliquid_address.clone(),
                )),
            };
            set.insert(adapter);
        }
        Ok(set)
    }

    pub fn with(mut self, adapter: Arc<dyn ExchangeAdapter>) -> Self {
        self.insert(adapter);
        self
    }

    pub fn insert(&mut self, adapter: Arc<dyn ExchangeAdapter>) {
        self.adapters.insert(adapter.exchange(), adapter);
    }

    pub fn get(&self, exchange: Exchange) -> Option<Arc<dyn ExchangeAdapter>> {
        self.adapters.get(&exchange).cloned()
    }
}

/// Send a request and decode the JSON body. Non-2xx responses become
/// [`FetchError::Api`] carrying the raw body.
pub(crate) async fn send_json<T: DeserializeOwned>(
    exchange: Exchange,
    request: reqwest::RequestBuilder,
) -> Result<T, FetchError> {
    let response = request.send().await?;
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        return Err(FetchError::Api {
            exchange,
            message: format!("HTTP {}: {}", status, text),
        });
    }

    Ok(serde_json::from_str(&text)?)
}

/// Parse `[[price, size, ...], ...]` depth arrays; unparseable levels are skipped.
pub(crate) fn parse_levels(raw: &[Vec<serde_json::Value>]) -> Vec<PriceLevel> {
    raw.iter()
        .filter_map(|level| {
            let price = crate::utils::value_f64(level.first()?)?;
            let quantity = crate::utils::value_f64(level.get(1)?)?;
            Some(PriceLevel { price, quantity })
        })
        .collect()
}

/// Sort history ascending, drop points with non-finite rates and collapse
/// settlements repeated across pages.
pub(crate) fn sorted_history(mut points: Vec<FundingHistoryPoint>) -> Vec<FundingHistoryPoint> {
    points.retain(|p| p.funding_rate.is_finite());
    points.sort_by_key(|p| p.funding_time);
    points.dedup_by_key(|p| p.funding_time);
    points
}

/// Cursor for the next page of a newest-first history feed: the oldest
/// settlement on this page. `None` once the page came back short or already
/// reaches back to `oldest_wanted`.
pub(crate) fn older_page_cursor(page: &[FundingHistoryPoint], page_size: usize, oldest_wanted: i64) -> Option<i64> {
    if page.len() < page_size {
        return None;
    }
    let oldest = page.iter().map(|p| p.funding_time).min()?;
    (oldest > oldest_wanted).then_some(oldest)
}
