use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::config::ExchangeCredentials;
use crate::error::FetchError;
use crate::exchange::{
    older_page_cursor, parse_levels, send_json, sorted_history, Exchange, ExchangeAdapter, HISTORY_LOOKBACK_MS,
};
use crate::strategy::rate_limiter::RateLimiter;
use crate::strategy::types::{
    AccountSnapshot, FundingHistoryPoint, FundingRate, MarketKind, OrderBookSnapshot, Position, Side,
    SpotBalance,
};
use crate::utils::{self, de_f64, de_i64};

const BYBIT_BASE_URL: &str = "https://api.bybit.com";

const REQUESTS_PER_SECOND: u32 = 10;
const BURST_CAPACITY: u32 = 20;

const HISTORY_LIMIT: usize = 200;
const HISTORY_MAX_PAGES: usize = 10;
const DEPTH_LIMIT: u32 = 50;
const RECV_WINDOW: &str = "5000";

pub struct BybitAdapter {
    client: reqwest::Client,
    limiter: RateLimiter,
    credentials: Option<ExchangeCredentials>,
}

/// v5 envelope. `result` is decoded only after `retCode` is checked since
/// error responses carry an empty object there.
#[derive(Debug, Deserialize)]
struct BybitResponse {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: Value,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Ticker {
    symbol: String,
    #[serde(rename = "fundingRate", deserialize_with = "de_f64")]
    funding_rate: f64,
    #[serde(rename = "nextFundingTime", deserialize_with = "de_i64")]
    next_funding_time: i64,
    #[serde(rename = "turnover24h", deserialize_with = "de_f64")]
    turnover_24h: f64,
}

#[derive(Debug, Deserialize)]
struct FundingHistoryRow {
    #[serde(rename = "fundingRate", deserialize_with = "de_f64")]
    funding_rate: f64,
    #[serde(rename = "fundingRateTimestamp", deserialize_with = "de_i64")]
    funding_rate_timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct OrderBook {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bids: Vec<Vec<Value>>,
    #[serde(rename = "a")]
    asks: Vec<Vec<Value>>,
    ts: i64,
}

#[derive(Debug, Deserialize)]
struct PositionRow {
    symbol: String,
    side: String,
    #[serde(deserialize_with = "de_f64")]
    size: f64,
    #[serde(rename = "avgPrice", deserialize_with = "de_f64")]
    avg_price: f64,
    #[serde(rename = "markPrice", deserialize_with = "de_f64")]
    mark_price: f64,
    #[serde(rename = "liqPrice", deserialize_with = "de_f64")]
    liq_price: f64,
    #[serde(rename = "unrealisedPnl", deserialize_with = "de_f64")]
    unrealised_pnl: f64,
    #[serde(rename = "stopLoss", default, deserialize_with = "de_f64")]
    stop_loss: f64,
    #[serde(rename = "takeProfit", default, deserialize_with = "de_f64")]
    take_profit: f64,
}

#[derive(Debug, Deserialize)]
struct WalletAccount {
    #[serde(rename = "totalMarginBalance", deserialize_with = "de_f64")]
    total_margin_balance: f64,
    #[serde(default)]
    coin: Vec<WalletCoin>,
}

#[derive(Debug, Deserialize)]
struct WalletCoin {
    coin: String,
    #[serde(rename = "walletBalance", deserialize_with = "de_f64")]
    wallet_balance: f64,
}

impl BybitAdapter {
    pub fn new(client: reqwest::Client, credentials: Option<ExchangeCredentials>) -> Self {
        Self {
            client,
            limiter: RateLimiter::new("bybit", REQUESTS_PER_SECOND, BURST_CAPACITY),
            credentials,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &str) -> Result<T, FetchError> {
        self.limiter.acquire().await;
        let url = format!("{}{}?{}", BYBIT_BASE_URL, path, query);
        let envelope: BybitResponse = send_json(Exchange::Bybit, self.client.get(url)).await?;
        unwrap_result(envelope)
    }

    /// Signed GET: hex HMAC-SHA256 of `timestamp + api_key + recv_window + query`.
    async fn signed_get<T: DeserializeOwned>(&self, path: &str, query: &str) -> Result<T, FetchError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or(FetchError::MissingCredentials(Exchange::Bybit))?;

        let timestamp = utils::now_ms().to_string();
        let payload = format!("{}{}{}{}", timestamp, creds.api_key, RECV_WINDOW, query);
        let signature = utils::hmac_sha256(&creds.api_secret, &payload)
            .map(hex::encode)
            .ok_or(FetchError::Signing(Exchange::Bybit))?;

        self.limiter.acquire().await;
        let request = self
            .client
            .get(format!("{}{}?{}", BYBIT_BASE_URL, path, query))
            .header("X-BAPI-API-KEY", &creds.api_key)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-TIMESTAMP", timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW);
        let envelope: BybitResponse = send_json(Exchange::Bybit, request).await?;
        unwrap_result(envelope)
    }

    async fn ticker(&self, base_token: &str) -> Result<Ticker, FetchError> {
        let symbol = self.symbol(base_token, MarketKind::Perpetual);
        let result: ListResult<Ticker> = self
            .get("/v5/market/tickers", &format!("category=linear&symbol={}", symbol))
            .await?;
        result.list.into_iter().next().ok_or(FetchError::NotListed {
            exchange: Exchange::Bybit,
            symbol,
        })
    }
}

fn unwrap_result<T: DeserializeOwned>(envelope: BybitResponse) -> Result<T, FetchError> {
    if envelope.ret_code != 0 {
        return Err(FetchError::Api {
            exchange: Exchange::Bybit,
            message: format!("retCode={} {}", envelope.ret_code, envelope.ret_msg),
        });
    }
    Ok(serde_json::from_value(envelope.result)?)
}

#[async_trait::async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    async fn fetch_funding_rate(&self, base_token: &str) -> Result<FundingRate, FetchError> {
        let ticker = self.ticker(base_token).await?;
        Ok(FundingRate {
            rate: ticker.funding_rate,
            next_funding_time: ticker.next_funding_time,
            interval: None,
        })
    }

    async fn fetch_funding_history(&self, base_token: &str) -> Result<Vec<FundingHistoryPoint>, FetchError> {
        let symbol = self.symbol(base_token, MarketKind::Perpetual);
        let oldest_wanted = utils::now_ms() - HISTORY_LOOKBACK_MS;
        let mut cursor = None;
        let mut points = Vec::new();

        // Bybit returns newest first.
        for _ in 0..HISTORY_MAX_PAGES {
            let result: ListResult<FundingHistoryRow> = self
                .get("/v5/market/funding/history", &history_query(&symbol, cursor))
                .await?;
            let page: Vec<FundingHistoryPoint> = result
                .list
                .into_iter()
                .map(|r| FundingHistoryPoint {
                    funding_time: r.funding_rate_timestamp,
                    funding_rate: r.funding_rate,
                })
                .collect();

            cursor = older_page_cursor(&page, HISTORY_LIMIT, oldest_wanted);
            points.extend(page);
            if cursor.is_none() {
                break;
            }
        }

        Ok(sorted_history(points))
    }

    async fn fetch_volume_24h(&self, base_token: &str) -> Result<f64, FetchError> {
        Ok(self.ticker(base_token).await?.turnover_24h)
    }

    async fn fetch_depth(&self, base_token: &str, market: MarketKind) -> Result<OrderBookSnapshot, FetchError> {
        let category = match market {
            MarketKind::Perpetual => "linear",
            MarketKind::Spot => "spot",
        };
        let symbol = self.symbol(base_token, market);
        let book: OrderBook = self
            .get(
                "/v5/market/orderbook",
                &format!("category={}&symbol={}&limit={}", category, symbol, DEPTH_LIMIT),
            )
            .await?;

        Ok(OrderBookSnapshot::new(
            book.symbol,
            parse_levels(&book.bids),
            parse_levels(&book.asks),
            book.ts,
        ))
    }

    async fn fetch_account(&self) -> Result<AccountSnapshot, FetchError> {
        let (positions, tickers, wallet) = tokio::join!(
            self.signed_get::<ListResult<PositionRow>>("/v5/position/list", "category=linear&settleCoin=USDT"),
            self.get::<ListResult<Ticker>>("/v5/market/tickers", "category=linear"),
            self.signed_get::<ListResult<WalletAccount>>("/v5/account/wallet-balance", "accountType=UNIFIED"),
        );

        let rates: HashMap<String, f64> = tickers?
            .list
            .into_iter()
            .map(|t| (t.symbol, t.funding_rate))
            .collect();

        let wallet = wallet?.list.into_iter().next();
        let margin_balance = wallet.as_ref().map(|w| w.total_margin_balance).unwrap_or(f64::NAN);
        let spot_balances = wallet
            .map(|w| {
                w.coin
                    .into_iter()
                    .filter(|c| c.wallet_balance > 0.0)
                    .map(|c| SpotBalance {
                        exchange: Exchange::Bybit,
                        asset: c.coin.to_uppercase(),
                        amount: c.wallet_balance,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(AccountSnapshot {
            exchange: Exchange::Bybit,
            positions: positions_from_rows(positions?.list, &rates),
            spot_balances,
            margin_balance,
        })
    }
}

fn positions_from_rows(rows: Vec<PositionRow>, rates: &HashMap<String, f64>) -> Vec<Position> {
    rows.into_iter()
        .filter_map(|r| {
            let side = match r.side.as_str() {
                "Buy" => Side::Buy,
                "Sell" => Side::Sell,
                // Empty side means a closed one-way slot.
                _ => return None,
            };
            if !(r.size > 0.0) {
                return None;
            }
            Some(Position {
                exchange: Exchange::Bybit,
                side,
                base_token: Exchange::Bybit.base_token(&r.symbol),
                size: r.size,
                mark_price: r.mark_price,
                liq_price: if r.liq_price > 0.0 { r.liq_price } else { f64::NAN },
                avg_price: r.avg_price,
                funding_rate: rates.get(&r.symbol).copied().unwrap_or(0.0),
                unrealized_pnl: r.unrealised_pnl,
                stop_loss: (r.stop_loss > 0.0).then_some(r.stop_loss),
                take_profit: (r.take_profit > 0.0).then_some(r.take_profit),
            })
        })
        .collect()
}

/// `endTime` is inclusive, so the next page ends just before the cursor.
fn history_query(symbol: &str, before_ms: Option<i64>) -> String {
    let mut query = format!("category=linear&symbol={}&limit={}", symbol, HISTORY_LIMIT);
    if let Some(ts) = before_ms {
        query.push_str(&format!("&endTime={}", ts - 1));
    }
    query
}
