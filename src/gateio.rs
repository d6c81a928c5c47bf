use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::FetchError;
use crate::exchange::{parse_levels, send_json, sorted_history, Exchange, ExchangeAdapter};
use crate::strategy::rate_limiter::RateLimiter;
use crate::strategy::types::{FundingHistoryPoint, FundingRate, MarketKind, OrderBookSnapshot, PriceLevel};
use crate::utils::{de_f64, value_f64};

const GATEIO_BASE_URL: &str = "https://api.gateio.ws/api/v4";
const SETTLE: &str = "usdt";

const REQUESTS_PER_SECOND: u32 = 10;
const BURST_CAPACITY: u32 = 20;

const HISTORY_LIMIT: u32 = 1000;
const DEPTH_LIMIT: u32 = 20;

pub struct GateioAdapter {
    client: reqwest::Client,
    limiter: RateLimiter,
}

/// Gate times are epoch seconds.
#[derive(Debug, Deserialize)]
struct Contract {
    #[serde(deserialize_with = "de_f64")]
    funding_rate: f64,
    #[serde(default)]
    funding_next_apply: f64,
    #[serde(default)]
    funding_interval: f64,
    #[serde(default, deserialize_with = "de_f64")]
    quanto_multiplier: f64,
}

#[derive(Debug, Deserialize)]
struct FundingRateRow {
    t: i64,
    #[serde(deserialize_with = "de_f64")]
    r: f64,
}

#[derive(Debug, Deserialize)]
struct Ticker {
    #[serde(deserialize_with = "de_f64")]
    volume_24h_quote: f64,
}

#[derive(Debug, Deserialize)]
struct FuturesLevel {
    #[serde(deserialize_with = "de_f64")]
    p: f64,
    s: Value,
}

#[derive(Debug, Deserialize)]
struct FuturesBook {
    /// Seconds with a millisecond fraction.
    current: f64,
    bids: Vec<FuturesLevel>,
    asks: Vec<FuturesLevel>,
}

#[derive(Debug, Deserialize)]
struct SpotBook {
    /// Milliseconds.
    current: i64,
    bids: Vec<Vec<Value>>,
    asks: Vec<Vec<Value>>,
}

impl GateioAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            limiter: RateLimiter::new("gateio", REQUESTS_PER_SECOND, BURST_CAPACITY),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T, FetchError> {
        self.limiter.acquire().await;
        let url = format!("{}{}", GATEIO_BASE_URL, path_and_query);
        send_json(Exchange::Gateio, self.client.get(url)).await
    }

    async fn contract(&self, base_token: &str) -> Result<Contract, FetchError> {
        let contract = self.symbol(base_token, MarketKind::Perpetual);
        self.get(&format!("/futures/{}/contracts/{}", SETTLE, contract)).await
    }
}

fn futures_levels(levels: Vec<FuturesLevel>) -> Vec<PriceLevel> {
    levels
        .into_iter()
        .filter_map(|l| {
            Some(PriceLevel {
                price: l.p,
                quantity: value_f64(&l.s)?,
            })
        })
        .collect()
}

#[async_trait::async_trait]
impl ExchangeAdapter for GateioAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Gateio
    }

    async fn fetch_funding_rate(&self, base_token: &str) -> Result<FundingRate, FetchError> {
        let contract = self.contract(base_token).await?;
        Ok(FundingRate {
            rate: contract.funding_rate,
            next_funding_time: (contract.funding_next_apply * 1000.0).round() as i64,
            interval: (contract.funding_interval > 0.0).then(|| contract.funding_interval / 3600.0),
        })
    }

    async fn fetch_funding_history(&self, base_token: &str) -> Result<Vec<FundingHistoryPoint>, FetchError> {
        let contract = self.symbol(base_token, MarketKind::Perpetual);
        let rows: Vec<FundingRateRow> = self
            .get(&format!(
                "/futures/{}/funding_rate?contract={}&limit={}",
                SETTLE, contract, HISTORY_LIMIT
            ))
            .await?;

        Ok(sorted_history(
            rows.into_iter()
                .map(|r| FundingHistoryPoint {
                    funding_time: r.t * 1000,
                    funding_rate: r.r,
                })
                .collect(),
        ))
    }

    async fn fetch_volume_24h(&self, base_token: &str) -> Result<f64, FetchError> {
        let contract = self.symbol(base_token, MarketKind::Perpetual);
        let tickers: Vec<Ticker> = self
            .get(&format!("/futures/{}/tickers?contract={}", SETTLE, contract))
            .await?;
        tickers
            .into_iter()
            .next()
            .map(|t| t.volume_24h_quote)
            .ok_or(FetchError::NotListed {
                exchange: Exchange::Gateio,
                symbol: contract,
            })
    }

    async fn fetch_depth(&self, base_token: &str, market: MarketKind) -> Result<OrderBookSnapshot, FetchError> {
        let symbol = self.symbol(base_token, market);
        match market {
            MarketKind::Perpetual => {
                let book: FuturesBook = self
                    .get(&format!(
                        "/futures/{}/order_book?contract={}&limit={}",
                        SETTLE, symbol, DEPTH_LIMIT
                    ))
                    .await?;
                Ok(OrderBookSnapshot::new(
                    symbol,
                    futures_levels(book.bids),
                    futures_levels(book.asks),
                    (book.current * 1000.0).round() as i64,
                ))
            }
            MarketKind::Spot => {
                let book: SpotBook = self
                    .get(&format!("/spot/order_book?currency_pair={}&limit={}", symbol, DEPTH_LIMIT))
                    .await?;
                Ok(OrderBookSnapshot::new(
                    symbol,
                    parse_levels(&book.bids),
                    parse_levels(&book.asks),
                    book.current,
                ))
            }
        }
    }

    /// Futures sizes are integer contracts of `quanto_multiplier` base units.
    async fn contract_size(&self, base_token: &str, market: MarketKind) -> Result<f64, FetchError> {
        if market == MarketKind::Spot {
            return Ok(1.0);
        }
        let contract = self.contract(base_token).await?;
        Ok(if contract.quanto_multiplier > 0.0 {
            contract.quanto_multiplier
        } else {
            1.0
        })
    }
}
