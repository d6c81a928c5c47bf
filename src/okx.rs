use std::collections::{HashMap, HashSet};

use base64::Engine as _;
use futures_util::future::join_all;
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
use crate::utils::{self, de_f64, de_i64, de_opt_i64};

const OKX_BASE_URL: &str = "https://www.okx.com";

const REQUESTS_PER_SECOND: u32 = 10;
const BURST_CAPACITY: u32 = 20;

/// OKX caps a history page at 100 rows.
const HISTORY_LIMIT: usize = 100;
const HISTORY_MAX_PAGES: usize = 20;
const DEPTH_LIMIT: u32 = 20;
const HOUR_MS: f64 = 3_600_000.0;

pub struct OkxAdapter {
    client: reqwest::Client,
    limiter: RateLimiter,
    credentials: Option<ExchangeCredentials>,
}

#[derive(Debug, Deserialize)]
struct OkxResponse {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct FundingRateRow {
    #[serde(rename = "fundingRate", deserialize_with = "de_f64")]
    funding_rate: f64,
    #[serde(rename = "fundingTime", default, deserialize_with = "de_opt_i64")]
    funding_time: Option<i64>,
    #[serde(rename = "nextFundingTime", default, deserialize_with = "de_opt_i64")]
    next_funding_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FundingHistoryRow {
    #[serde(rename = "fundingRate", deserialize_with = "de_f64")]
    funding_rate: f64,
    #[serde(rename = "fundingTime", deserialize_with = "de_i64")]
    funding_time: i64,
}

#[derive(Debug, Deserialize)]
struct TickerRow {
    #[serde(deserialize_with = "de_f64")]
    last: f64,
    /// Base-currency volume for swaps.
    #[serde(rename = "volCcy24h", deserialize_with = "de_f64")]
    vol_ccy_24h: f64,
}

#[derive(Debug, Deserialize)]
struct BookRow {
    bids: Vec<Vec<Value>>,
    asks: Vec<Vec<Value>>,
    #[serde(deserialize_with = "de_i64")]
    ts: i64,
}

#[derive(Debug, Deserialize)]
struct InstrumentRow {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "ctVal", default, deserialize_with = "de_f64")]
    ct_val: f64,
}

#[derive(Debug, Deserialize)]
struct PositionRow {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(deserialize_with = "de_f64")]
    pos: f64,
    #[serde(rename = "posSide", default)]
    pos_side: String,
    #[serde(rename = "avgPx", deserialize_with = "de_f64")]
    avg_px: f64,
    #[serde(rename = "markPx", deserialize_with = "de_f64")]
    mark_px: f64,
    #[serde(rename = "liqPx", default, deserialize_with = "de_f64")]
    liq_px: f64,
    #[serde(deserialize_with = "de_f64")]
    upl: f64,
}

#[derive(Debug, Deserialize)]
struct BalanceRow {
    #[serde(rename = "totalEq", deserialize_with = "de_f64")]
    total_eq: f64,
    #[serde(default)]
    details: Vec<BalanceDetail>,
}

#[derive(Debug, Deserialize)]
struct BalanceDetail {
    ccy: String,
    #[serde(rename = "cashBal", deserialize_with = "de_f64")]
    cash_bal: f64,
}

impl OkxAdapter {
    pub fn new(client: reqwest::Client, credentials: Option<ExchangeCredentials>) -> Self {
        Self {
            client,
            limiter: RateLimiter::new("okx", REQUESTS_PER_SECOND, BURST_CAPACITY),
            credentials,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<Vec<T>, FetchError> {
        self.limiter.acquire().await;
        let url = format!("{}{}", OKX_BASE_URL, path_and_query);
        let envelope: OkxResponse = send_json(Exchange::Okx, self.client.get(url)).await?;
        unwrap_data(envelope)
    }

    /// Signed GET: base64 HMAC-SHA256 of `timestamp + "GET" + path_and_query`.
    async fn signed_get<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<Vec<T>, FetchError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or(FetchError::MissingCredentials(Exchange::Okx))?;
        let passphrase = creds
            .passphrase
            .as_deref()
            .ok_or(FetchError::MissingCredentials(Exchange::Okx))?;

        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let prehash = format!("{}GET{}", timestamp, path_and_query);
        let signature = utils::hmac_sha256(&creds.api_secret, &prehash)
            .map(|mac| base64::engine::general_purpose::STANDARD.encode(mac))
            .ok_or(FetchError::Signing(Exchange::Okx))?;

        self.limiter.acquire().await;
        let request = self
            .client
            .get(format!("{}{}", OKX_BASE_URL, path_and_query))
            .header("OK-ACCESS-KEY", &creds.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", passphrase);
        let envelope: OkxResponse = send_json(Exchange::Okx, request).await?;
        unwrap_data(envelope)
    }

    async fn first<T: DeserializeOwned>(&self, path_and_query: &str, symbol: &str) -> Result<T, FetchError> {
        self.get::<T>(path_and_query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::NotListed {
                exchange: Exchange::Okx,
                symbol: symbol.to_string(),
            })
    }

    async fn current_rate(&self, inst_id: &str) -> Result<f64, FetchError> {
        let row: FundingRateRow = self
            .first(&format!("/api/v5/public/funding-rate?instId={}", inst_id), inst_id)
            .await?;
        Ok(row.funding_rate)
    }
}

fn unwrap_data<T: DeserializeOwned>(envelope: OkxResponse) -> Result<Vec<T>, FetchError> {
    if envelope.code != "0" {
        return Err(FetchError::Api {
            exchange: Exchange::Okx,
            message: format!("code={} {}", envelope.code, envelope.msg),
        });
    }
    if envelope.data.is_null() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_value(envelope.data)?)
}

/// Settlement interval in hours from two consecutive funding timestamps.
fn interval_hours(funding_time: Option<i64>, next_funding_time: Option<i64>) -> Option<f64> {
    match (funding_time, next_funding_time) {
        (Some(current), Some(next)) if next > current => Some((next - current) as f64 / HOUR_MS),
        _ => None,
    }
}

#[async_trait::async_trait]
impl ExchangeAdapter for OkxAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    async fn fetch_funding_rate(&self, base_token: &str) -> Result<FundingRate, FetchError> {
        let inst_id = self.symbol(base_token, MarketKind::Perpetual);
        let row: FundingRateRow = self
            .first(&format!("/api/v5/public/funding-rate?instId={}", inst_id), &inst_id)
            .await?;

        Ok(FundingRate {
            rate: row.funding_rate,
            // `fundingTime` is the upcoming settlement.
            next_funding_time: row.funding_time.unwrap_or_default(),
            interval: interval_hours(row.funding_time, row.next_funding_time),
        })
    }

    async fn fetch_funding_history(&self, base_token: &str) -> Result<Vec<FundingHistoryPoint>, FetchError> {
        let inst_id = self.symbol(base_token, MarketKind::Perpetual);
        let oldest_wanted = utils::now_ms() - HISTORY_LOOKBACK_MS;
        let mut cursor = None;
        let mut points = Vec::new();

        for _ in 0..HISTORY_MAX_PAGES {
            let rows: Vec<FundingHistoryRow> = self.get(&history_path(&inst_id, cursor)).await?;
            let page: Vec<FundingHistoryPoint> = rows
                .into_iter()
                .map(|r| FundingHistoryPoint {
                    funding_time: r.funding_time,
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
        let inst_id = self.symbol(base_token, MarketKind::Perpetual);
        let ticker: TickerRow = self
            .first(&format!("/api/v5/market/ticker?instId={}", inst_id), &inst_id)
            .await?;
        Ok(ticker.vol_ccy_24h * ticker.last)
    }

    async fn fetch_depth(&self, base_token: &str, market: MarketKind) -> Result<OrderBookSnapshot, FetchError> {
        let inst_id = self.symbol(base_token, market);
        let book: BookRow = self
            .first(
                &format!("/api/v5/market/books?instId={}&sz={}", inst_id, DEPTH_LIMIT),
                &inst_id,
            )
            .await?;

        Ok(OrderBookSnapshot::new(
            inst_id,
            parse_levels(&book.bids),
            parse_levels(&book.asks),
            book.ts,
        ))
    }

    /// Swap books are quoted in contracts of `ctVal` base units each.
    async fn contract_size(&self, base_token: &str, market: MarketKind) -> Result<f64, FetchError> {
        if market == MarketKind::Spot {
            return Ok(1.0);
        }
        let inst_id = self.symbol(base_token, market);
        let instrument: InstrumentRow = self
            .first(
                &format!("/api/v5/public/instruments?instType=SWAP&instId={}", inst_id),
                &inst_id,
            )
            .await?;
        Ok(if instrument.ct_val > 0.0 { instrument.ct_val } else { 1.0 })
    }

    async fn fetch_account(&self) -> Result<AccountSnapshot, FetchError> {
        let (positions, instruments, balances) = tokio::join!(
            self.signed_get::<PositionRow>("/api/v5/account/positions?instType=SWAP"),
            self.get::<InstrumentRow>("/api/v5/public/instruments?instType=SWAP"),
            self.signed_get::<BalanceRow>("/api/v5/account/balance"),
        );
        let positions = positions?;

        let contract_sizes: HashMap<String, f64> = instruments?
            .into_iter()
            .map(|i| (i.inst_id, i.ct_val))
            .collect();

        let inst_ids: Vec<String> = positions
            .iter()
            .map(|p| p.inst_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let rates: HashMap<String, f64> = join_all(inst_ids.iter().map(|id| self.current_rate(id)))
            .await
            .into_iter()
            .zip(inst_ids.iter())
            .filter_map(|(rate, id)| match rate {
                Ok(rate) => Some((id.clone(), rate)),
                Err(e) => {
                    tracing::debug!("[OKX] funding rate for {} unavailable: {}", id, e);
                    None
                }
            })
            .collect();

        let balance = balances?.into_iter().next();
        let margin_balance = balance.as_ref().map(|b| b.total_eq).unwrap_or(f64::NAN);
        let spot_balances = balance
            .map(|b| {
                b.details
                    .into_iter()
                    .filter(|d| d.cash_bal > 0.0)
                    .map(|d| SpotBalance {
                        exchange: Exchange::Okx,
                        asset: d.ccy.to_uppercase(),
                        amount: d.cash_bal,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(AccountSnapshot {
            exchange: Exchange::Okx,
            positions: positions_from_rows(positions, &contract_sizes, &rates),
            spot_balances,
            margin_balance,
        })
    }
}

fn positions_from_rows(
    rows: Vec<PositionRow>,
    contract_sizes: &HashMap<String, f64>,
    rates: &HashMap<String, f64>,
) -> Vec<Position> {
    rows.into_iter()
        .filter_map(|r| {
            // Hedge mode reports the leg in posSide; net mode signs `pos`.
            let side = match r.pos_side.as_str() {
                "long" => Side::Buy,
                "short" => Side::Sell,
                _ if r.pos > 0.0 => Side::Buy,
                _ if r.pos < 0.0 => Side::Sell,
                _ => return None,
            };
            let ct_val = contract_sizes
                .get(&r.inst_id)
                .copied()
                .filter(|v| *v > 0.0)
                .unwrap_or(1.0);

            Some(Position {
                exchange: Exchange::Okx,
                side,
                base_token: Exchange::Okx.base_token(&r.inst_id),
                size: r.pos.abs() * ct_val,
                mark_price: r.mark_px,
                liq_price: if r.liq_px > 0.0 { r.liq_px } else { f64::NAN },
                avg_price: r.avg_px,
                funding_rate: rates.get(&r.inst_id).copied().unwrap_or(0.0),
                unrealized_pnl: r.upl,
                stop_loss: None,
                take_profit: None,
            })
        })
        .collect()
}

/// `after` pages backwards: rows settled strictly before the cursor.
fn history_path(inst_id: &str, before_ms: Option<i64>) -> String {
    let mut path = format!(
        "/api/v5/public/funding-rate-history?instId={}&limit={}",
        inst_id, HISTORY_LIMIT
    );
    if let Some(ts) = before_ms {
        path.push_str(&format!("&after={}", ts));
    }
    path
}
