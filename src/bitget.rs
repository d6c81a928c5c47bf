use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::FetchError;
use crate::exchange::{
    older_page_cursor, parse_levels, send_json, sorted_history, Exchange, ExchangeAdapter, HISTORY_LOOKBACK_MS,
};
use crate::strategy::rate_limiter::RateLimiter;
use crate::strategy::types::{FundingHistoryPoint, FundingRate, MarketKind, OrderBookSnapshot};
use crate::utils::{self, de_f64, de_i64, de_opt_i64};

const BITGET_BASE_URL: &str = "https://api.bitget.com";
const PRODUCT_TYPE: &str = "USDT-FUTURES";
const SUCCESS_CODE: &str = "00000";

const REQUESTS_PER_SECOND: u32 = 10;
const BURST_CAPACITY: u32 = 20;

const HISTORY_PAGE_SIZE: usize = 100;
const HISTORY_MAX_PAGES: usize = 20;
const DEPTH_LIMIT: u32 = 50;

/// Public market data only; account endpoints are not wired.
pub struct BitgetAdapter {
    client: reqwest::Client,
    limiter: RateLimiter,
}

#[derive(Debug, Deserialize)]
struct BitgetResponse {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct CurrentFundRate {
    #[serde(rename = "fundingRate", deserialize_with = "de_f64")]
    funding_rate: f64,
    #[serde(rename = "fundingRateInterval", default, deserialize_with = "de_f64")]
    funding_rate_interval: f64,
    #[serde(rename = "nextUpdate", default, deserialize_with = "de_opt_i64")]
    next_update: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct HistoryFundRate {
    #[serde(rename = "fundingRate", deserialize_with = "de_f64")]
    funding_rate: f64,
    #[serde(rename = "fundingTime", deserialize_with = "de_i64")]
    funding_time: i64,
}

#[derive(Debug, Deserialize)]
struct Ticker {
    #[serde(rename = "quoteVolume", deserialize_with = "de_f64")]
    quote_volume: f64,
}

#[derive(Debug, Deserialize)]
struct Depth {
    bids: Vec<Vec<Value>>,
    asks: Vec<Vec<Value>>,
    #[serde(deserialize_with = "de_i64")]
    ts: i64,
}

impl BitgetAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            limiter: RateLimiter::new("bitget", REQUESTS_PER_SECOND, BURST_CAPACITY),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T, FetchError> {
        self.limiter.acquire().await;
        let url = format!("{}{}", BITGET_BASE_URL, path_and_query);
        let envelope: BitgetResponse = send_json(Exchange::Bitget, self.client.get(url)).await?;

        if envelope.code != SUCCESS_CODE {
            return Err(FetchError::Api {
                exchange: Exchange::Bitget,
                message: format!("code={} {}", envelope.code, envelope.msg),
            });
        }
        Ok(serde_json::from_value(envelope.data)?)
    }

    async fn first<T: DeserializeOwned>(&self, path_and_query: &str, symbol: &str) -> Result<T, FetchError> {
        let rows: Vec<T> = self.get(path_and_query).await?;
        rows.into_iter().next().ok_or_else(|| FetchError::NotListed {
            exchange: Exchange::Bitget,
            symbol: symbol.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl ExchangeAdapter for BitgetAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bitget
    }

    async fn fetch_funding_rate(&self, base_token: &str) -> Result<FundingRate, FetchError> {
        let symbol = self.symbol(base_token, MarketKind::Perpetual);
        let row: CurrentFundRate = self
            .first(
                &format!(
                    "/api/v2/mix/market/current-fund-rate?symbol={}&productType={}",
                    symbol, PRODUCT_TYPE
                ),
                &symbol,
            )
            .await?;

        Ok(FundingRate {
            rate: row.funding_rate,
            next_funding_time: row.next_update.unwrap_or_default(),
            interval: (row.funding_rate_interval > 0.0).then_some(row.funding_rate_interval),
        })
    }

    async fn fetch_funding_history(&self, base_token: &str) -> Result<Vec<FundingHistoryPoint>, FetchError> {
        let symbol = self.symbol(base_token, MarketKind::Perpetual);
        let oldest_wanted = utils::now_ms() - HISTORY_LOOKBACK_MS;
        let mut points = Vec::new();

        for page_no in 1..=HISTORY_MAX_PAGES {
            let rows: Vec<HistoryFundRate> = self.get(&history_path(&symbol, page_no)).await?;
            let page: Vec<FundingHistoryPoint> = rows
                .into_iter()
                .map(|r| FundingHistoryPoint {
                    funding_time: r.funding_time,
                    funding_rate: r.funding_rate,
                })
                .collect();

            let more = older_page_cursor(&page, HISTORY_PAGE_SIZE, oldest_wanted).is_some();
            points.extend(page);
            if !more {
                break;
            }
        }

        Ok(sorted_history(points))
    }

    async fn fetch_volume_24h(&self, base_token: &str) -> Result<f64, FetchError> {
        let symbol = self.symbol(base_token, MarketKind::Perpetual);
        let ticker: Ticker = self
            .first(
                &format!("/api/v2/mix/market/ticker?symbol={}&productType={}", symbol, PRODUCT_TYPE),
                &symbol,
            )
            .await?;
        Ok(ticker.quote_volume)
    }

    async fn fetch_depth(&self, base_token: &str, market: MarketKind) -> Result<OrderBookSnapshot, FetchError> {
        let symbol = self.symbol(base_token, market);
        let path = match market {
            MarketKind::Perpetual => format!(
                "/api/v2/mix/market/merge-depth?symbol={}&productType={}&limit={}",
                symbol, PRODUCT_TYPE, DEPTH_LIMIT
            ),
            MarketKind::Spot => format!(
                "/api/v2/spot/market/orderbook?symbol={}&type=step0&limit={}",
                symbol, DEPTH_LIMIT
            ),
        };
        let depth: Depth = self.get(&path).await?;

        Ok(OrderBookSnapshot::new(
            symbol,
            parse_levels(&depth.bids),
            parse_levels(&depth.asks),
            depth.ts,
        ))
    }
}

fn history_path(symbol: &str, page_no: usize) -> String {
    format!(
        "/api/v2/mix/market/history-fund-rate?symbol={}&productType={}&pageSize={}&pageNo={}",
        symbol, PRODUCT_TYPE, HISTORY_PAGE_SIZE, page_no
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_path_numbers_pages() {
        assert_eq!(
            history_path("SOLUSDT", 3),
            "/api/v2/mix/market/history-fund-rate?symbol=SOLUSDT&productType=USDT-FUTURES&pageSize=100&pageNo=3"
        );
    }

    #[test]
    fn test_current_fund_rate_optional_fields() {
        let row: CurrentFundRate = serde_json::from_str(r#"{"symbol":"BTCUSDT","fundingRate":"-0.000025"}"#).unwrap();
        assert_eq!(row.funding_rate, -0.000025);
        assert_eq!(row.funding_rate_interval, 0.0);
        assert_eq!(row.next_update, None);

        let row: CurrentFundRate = serde_json::from_str(
            r#"{"symbol":"BTCUSDT","fundingRate":"0.0001","fundingRateInterval":"4","nextUpdate":"1700000000000"}"#,
        )
        .unwrap();
        assert_eq!(row.funding_rate_interval, 4.0);
        assert_eq!(row.next_update, Some(1_700_000_000_000));
    }

    #[test]
    fn test_depth_decodes_string_timestamp() {
        let depth: Depth = serde_json::from_str(
            r#"{"asks":[["26347.5","0.25"]],"bids":[["26346.5","0.16"]],"ts":"1695870968804"}"#,
        )
        .unwrap();
        assert_eq!(depth.ts, 1_695_870_968_804);
        assert_eq!(parse_levels(&depth.asks)[0].quantity, 0.25);
    }
}
