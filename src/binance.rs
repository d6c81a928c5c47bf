use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::config::ExchangeCredentials;
use crate::error::FetchError;
use crate::exchange::{parse_levels, send_json, sorted_history, Exchange, ExchangeAdapter};
use crate::strategy::rate_limiter::RateLimiter;
use crate::strategy::types::{
    AccountSnapshot, FundingHistoryPoint, FundingRate, MarketKind, OrderBookSnapshot, Position, Side,
    SpotBalance,
};
use crate::utils::{self, de_f64, de_i64};

const BINANCE_USDM_BASE_URL: &str = "https://fapi.binance.com";
const BINANCE_SPOT_BASE_URL: &str = "https://api.binance.com";

// Weight-based limits are generous for the handful of calls per token we make.
const REQUESTS_PER_SECOND: u32 = 20;
const BURST_CAPACITY: u32 = 40;

const HISTORY_LIMIT: u32 = 1000;
const DEPTH_LIMIT: u32 = 20;
const RECV_WINDOW_MS: u64 = 5000;

pub struct BinanceAdapter {
    client: reqwest::Client,
    limiter: RateLimiter,
    credentials: Option<ExchangeCredentials>,
}

#[derive(Debug, Deserialize)]
struct PremiumIndex {
    symbol: String,
    #[serde(rename = "lastFundingRate", deserialize_with = "de_f64")]
    last_funding_rate: f64,
    #[serde(rename = "nextFundingTime", deserialize_with = "de_i64")]
    next_funding_time: i64,
}

#[derive(Debug, Deserialize)]
struct FundingRateRow {
    #[serde(rename = "fundingTime", deserialize_with = "de_i64")]
    funding_time: i64,
    #[serde(rename = "fundingRate", deserialize_with = "de_f64")]
    funding_rate: f64,
}

#[derive(Debug, Deserialize)]
struct Ticker24h {
    #[serde(rename = "quoteVolume", deserialize_with = "de_f64")]
    quote_volume: f64,
}

#[derive(Debug, Deserialize)]
struct DepthResponse {
    bids: Vec<Vec<Value>>,
    asks: Vec<Vec<Value>>,
    /// Futures only: transaction time.
    #[serde(rename = "T", default)]
    transaction_time: Option<i64>,
    #[serde(rename = "E", default)]
    event_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PositionRisk {
    symbol: String,
    #[serde(rename = "positionAmt", deserialize_with = "de_f64")]
    position_amt: f64,
    #[serde(rename = "entryPrice", deserialize_with = "de_f64")]
    entry_price: f64,
    #[serde(rename = "markPrice", deserialize_with = "de_f64")]
    mark_price: f64,
    #[serde(rename = "unRealizedProfit", deserialize_with = "de_f64")]
    unrealized_profit: f64,
    #[serde(rename = "liquidationPrice", deserialize_with = "de_f64")]
    liquidation_price: f64,
}

#[derive(Debug, Deserialize)]
struct FuturesAccount {
    #[serde(rename = "totalMarginBalance", deserialize_with = "de_f64")]
    total_margin_balance: f64,
}

#[derive(Debug, Deserialize)]
struct SpotAccount {
    balances: Vec<SpotAssetBalance>,
}

#[derive(Debug, Deserialize)]
struct SpotAssetBalance {
    asset: String,
    #[serde(deserialize_with = "de_f64")]
    free: f64,
    #[serde(deserialize_with = "de_f64")]
    locked: f64,
}

impl BinanceAdapter {
    pub fn new(client: reqwest::Client, credentials: Option<ExchangeCredentials>) -> Self {
        Self {
            client,
            limiter: RateLimiter::new("binance", REQUESTS_PER_SECOND, BURST_CAPACITY),
            credentials,
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T, FetchError> {
        self.limiter.acquire().await;
        send_json(Exchange::Binance, self.client.get(url)).await
    }

    /// Signed GET. The signature is the hex HMAC-SHA256 of the full query string.
    async fn signed_get<T: serde::de::DeserializeOwned>(&self, base: &str, path: &str) -> Result<T, FetchError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or(FetchError::MissingCredentials(Exchange::Binance))?;

        let query = format!("recvWindow={}&timestamp={}", RECV_WINDOW_MS, utils::now_ms());
        let signature = utils::hmac_sha256(&creds.api_secret, &query)
            .map(hex::encode)
            .ok_or(FetchError::Signing(Exchange::Binance))?;
        let url = format!("{}{}?{}&signature={}", base, path, query, signature);

        self.limiter.acquire().await;
        send_json(
            Exchange::Binance,
            self.client.get(url).header("X-MBX-APIKEY", &creds.api_key),
        )
        .await
    }
}

#[async_trait::async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn fetch_funding_rate(&self, base_token: &str) -> Result<FundingRate, FetchError> {
        let symbol = self.symbol(base_token, MarketKind::Perpetual);
        let url = format!("{}/fapi/v1/premiumIndex?symbol={}", BINANCE_USDM_BASE_URL, symbol);
        let index: PremiumIndex = self.get(url).await?;

        if !index.last_funding_rate.is_finite() {
            return Err(FetchError::NotListed {
                exchange: Exchange::Binance,
                symbol,
            });
        }

        Ok(FundingRate {
            rate: index.last_funding_rate,
            next_funding_time: index.next_funding_time,
            interval: None,
        })
    }

    async fn fetch_funding_history(&self, base_token: &str) -> Result<Vec<FundingHistoryPoint>, FetchError> {
        let symbol = self.symbol(base_token, MarketKind::Perpetual);
        let url = format!(
            "{}/fapi/v1/fundingRate?symbol={}&limit={}",
            BINANCE_USDM_BASE_URL, symbol, HISTORY_LIMIT
        );
        let rows: Vec<FundingRateRow> = self.get(url).await?;

        Ok(sorted_history(
            rows.into_iter()
                .map(|r| FundingHistoryPoint {
                    funding_time: r.funding_time,
                    funding_rate: r.funding_rate,
                })
                .collect(),
        ))
    }

    async fn fetch_volume_24h(&self, base_token: &str) -> Result<f64, FetchError> {
        let symbol = self.symbol(base_token, MarketKind::Perpetual);
        let url = format!("{}/fapi/v1/ticker/24hr?symbol={}", BINANCE_USDM_BASE_URL, symbol);
        let ticker: Ticker24h = self.get(url).await?;
        Ok(ticker.quote_volume)
    }

    async fn fetch_depth(&self, base_token: &str, market: MarketKind) -> Result<OrderBookSnapshot, FetchError> {
        let symbol = self.symbol(base_token, market);
        let url = match market {
            MarketKind::Perpetual => format!(
                "{}/fapi/v1/depth?symbol={}&limit={}",
                BINANCE_USDM_BASE_URL, symbol, DEPTH_LIMIT
            ),
            MarketKind::Spot => format!(
                "{}/api/v3/depth?symbol={}&limit={}",
                BINANCE_SPOT_BASE_URL, symbol, DEPTH_LIMIT
            ),
        };
        let depth: DepthResponse = self.get(url).await?;

        // Spot depth carries no timestamp; fall back to local receive time.
        let updated = depth
            .transaction_time
            .or(depth.event_time)
            .unwrap_or_else(utils::now_ms);

        Ok(OrderBookSnapshot::new(
            symbol,
            parse_levels(&depth.bids),
            parse_levels(&depth.asks),
            updated,
        ))
    }

    async fn fetch_account(&self) -> Result<AccountSnapshot, FetchError> {
        let index_url = format!("{}/fapi/v1/premiumIndex", BINANCE_USDM_BASE_URL);

        let (risk, indices, futures, spot) = tokio::join!(
            self.signed_get::<Vec<PositionRisk>>(BINANCE_USDM_BASE_URL, "/fapi/v2/positionRisk"),
            self.get::<Vec<PremiumIndex>>(index_url),
            self.signed_get::<FuturesAccount>(BINANCE_USDM_BASE_URL, "/fapi/v2/account"),
            self.signed_get::<SpotAccount>(BINANCE_SPOT_BASE_URL, "/api/v3/account"),
        );

        let rates: HashMap<String, f64> = indices?
            .into_iter()
            .map(|i| (i.symbol, i.last_funding_rate))
            .collect();

        // A futures-only key cannot read the spot wallet.
        let spot_balances = match spot {
            Ok(account) => spot_balances(account),
            Err(e) => {
                tracing::warn!("[BINANCE] spot balances unavailable: {}", e);
                Vec::new()
            }
        };

        Ok(AccountSnapshot {
            exchange: Exchange::Binance,
            positions: positions_from_risk(risk?, &rates),
            spot_balances,
            margin_balance: futures.map(|a| a.total_margin_balance).unwrap_or(f64::NAN),
        })
    }
}

fn positions_from_risk(rows: Vec<PositionRisk>, rates: &HashMap<String, f64>) -> Vec<Position> {
    rows.into_iter()
        .filter(|r| r.position_amt != 0.0 && r.position_amt.is_finite())
        .map(|r| Position {
            exchange: Exchange::Binance,
            side: if r.position_amt > 0.0 { Side::Buy } else { Side::Sell },
            base_token: Exchange::Binance.base_token(&r.symbol),
            size: r.position_amt.abs(),
            mark_price: r.mark_price,
            // Binance reports 0 when there is no liquidation price.
            liq_price: if r.liquidation_price > 0.0 { r.liquidation_price } else { f64::NAN },
            avg_price: r.entry_price,
            funding_rate: rates.get(&r.symbol).copied().unwrap_or(0.0),
            unrealized_pnl: r.unrealized_profit,
            stop_loss: None,
            take_profit: None,
        })
        .collect()
}

fn spot_balances(account: SpotAccount) -> Vec<SpotBalance> {
    account
        .balances
        .into_iter()
        .filter_map(|b| {
            let amount = b.free + b.locked;
            (amount > 0.0).then(|| SpotBalance {
                exchange: Exchange::Binance,
                asset: b.asset.to_uppercase(),
                amount,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_risk_maps_sign_to_side() {
        let rows: Vec<PositionRisk> = serde_json::from_str(
            r#"[
                {"symbol":"BTCUSDT","positionAmt":"-0.5","entryPrice":"60000","markPrice":"61000",
                 "unRealizedProfit":"-500","liquidationPrice":"90000"},
                {"symbol":"ETHUSDT","positionAmt":"2","entryPrice":"3000","markPrice":"3100",
                 "unRealizedProfit":"200","liquidationPrice":"0"},
                {"symbol":"SOLUSDT","positionAmt":"0","entryPrice":"0","markPrice":"150",
                 "unRealizedProfit":"0","liquidationPrice":"0"}
            ]"#,
        )
        .unwrap();
        let rates = HashMap::from([("BTCUSDT".to_string(), 0.0001)]);

        let positions = positions_from_risk(rows, &rates);
        assert_eq!(positions.len(), 2);

        assert_eq!(positions[0].side, Side::Sell);
        assert_eq!(positions[0].base_token, "BTC");
        assert_eq!(positions[0].size, 0.5);
        assert_eq!(positions[0].funding_rate, 0.0001);

        assert_eq!(positions[1].side, Side::Buy);
        assert!(positions[1].liq_price.is_nan());
        assert_eq!(positions[1].funding_rate, 0.0);
    }

    #[test]
    fn test_spot_balances_skip_empty_assets() {
        let account: SpotAccount = serde_json::from_str(
            r#"{"balances":[
                {"asset":"BTC","free":"0.1","locked":"0.05"},
                {"asset":"BNB","free":"0","locked":"0"}
            ]}"#,
        )
        .unwrap();
        let balances = spot_balances(account);
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].asset, "BTC");
        assert!((balances[0].amount - 0.15).abs() < 1e-12);
    }

    #[test]
    fn test_premium_index_decodes_string_numbers() {
        let index: PremiumIndex = serde_json::from_str(
            r#"{"symbol":"BTCUSDT","markPrice":"60000","lastFundingRate":"0.00010000",
                "nextFundingTime":1700000000000,"time":1699999999000}"#,
        )
        .unwrap();
        assert_eq!(index.last_funding_rate, 0.0001);
        assert_eq!(index.next_funding_time, 1_700_000_000_000);
    }
}
