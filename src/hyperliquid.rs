use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::error::FetchError;
use crate::exchange::{send_json, sorted_history, Exchange, ExchangeAdapter, HISTORY_LOOKBACK_MS};
use crate::strategy::rate_limiter::RateLimiter;
use crate::strategy::types::{
    AccountSnapshot, FundingHistoryPoint, FundingRate, MarketKind, OrderBookSnapshot, Position, PriceLevel,
    Side, SpotBalance,
};
use crate::utils::{self, de_f64};

const HYPERLIQUID_INFO_URL: &str = "https://api.hyperliquid.xyz/info";

const REQUESTS_PER_SECOND: u32 = 10;
const BURST_CAPACITY: u32 = 20;

/// Hourly funding; one page holds at most this many settlements.
const HISTORY_PAGE_SIZE: usize = 500;
const HISTORY_MAX_PAGES: usize = 10;
const FUNDING_INTERVAL_HOURS: f64 = 1.0;

/// Account state is public, so only a wallet address is needed.
pub struct HyperliquidAdapter {
    client: reqwest::Client,
    limiter: RateLimiter,
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    universe: Vec<UniverseItem>,
}

#[derive(Debug, Deserialize)]
struct UniverseItem {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AssetCtx {
    #[serde(deserialize_with = "de_f64")]
    funding: f64,
    #[serde(rename = "dayNtlVlm", deserialize_with = "de_f64")]
    day_ntl_vlm: f64,
}

#[derive(Debug, Deserialize)]
struct FundingHistoryRow {
    #[serde(rename = "fundingRate", deserialize_with = "de_f64")]
    funding_rate: f64,
    time: i64,
}

#[derive(Debug, Deserialize)]
struct L2Book {
    coin: String,
    time: i64,
    levels: Vec<Vec<L2Level>>,
}

#[derive(Debug, Deserialize)]
struct L2Level {
    #[serde(deserialize_with = "de_f64")]
    px: f64,
    #[serde(deserialize_with = "de_f64")]
    sz: f64,
}

#[derive(Debug, Deserialize)]
struct ClearinghouseState {
    #[serde(rename = "assetPositions", default)]
    asset_positions: Vec<AssetPosition>,
    #[serde(rename = "marginSummary")]
    margin_summary: MarginSummary,
}

#[derive(Debug, Deserialize)]
struct AssetPosition {
    position: PerpPosition,
}

#[derive(Debug, Deserialize)]
struct PerpPosition {
    coin: String,
    #[serde(deserialize_with = "de_f64")]
    szi: f64,
    #[serde(rename = "entryPx", default, deserialize_with = "de_f64")]
    entry_px: f64,
    #[serde(rename = "positionValue", deserialize_with = "de_f64")]
    position_value: f64,
    #[serde(rename = "unrealizedPnl", deserialize_with = "de_f64")]
    unrealized_pnl: f64,
    #[serde(rename = "liquidationPx", default, deserialize_with = "de_f64")]
    liquidation_px: f64,
}

#[derive(Debug, Deserialize)]
struct MarginSummary {
    #[serde(rename = "accountValue", deserialize_with = "de_f64")]
    account_value: f64,
}

#[derive(Debug, Deserialize)]
struct SpotState {
    #[serde(default)]
    balances: Vec<SpotCoinBalance>,
}

#[derive(Debug, Deserialize)]
struct SpotCoinBalance {
    coin: String,
    #[serde(deserialize_with = "de_f64")]
    total: f64,
}

impl HyperliquidAdapter {
    pub fn new(client: reqwest::Client, address: Option<String>) -> Self {
        Self {
            client,
            limiter: RateLimiter::new("hyperliquid", REQUESTS_PER_SECOND, BURST_CAPACITY),
            address,
        }
    }

    async fn info<T: DeserializeOwned>(&self, body: serde_json::Value) -> Result<T, FetchError> {
        self.limiter.acquire().await;
        send_json(Exchange::Hyperliquid, self.client.post(HYPERLIQUID_INFO_URL).json(&body)).await
    }

    /// Asset contexts keyed by coin name.
    async fn asset_contexts(&self) -> Result<HashMap<String, AssetCtx>, FetchError> {
        let (meta, ctxs): (Meta, Vec<AssetCtx>) = self.info(json!({"type": "metaAndAssetCtxs"})).await?;
        Ok(meta
            .universe
            .into_iter()
            .map(|u| u.name.to_uppercase())
            .zip(ctxs)
            .collect())
    }

    async fn asset_context(&self, base_token: &str) -> Result<AssetCtx, FetchError> {
        let coin = self.symbol(base_token, MarketKind::Perpetual);
        self.asset_contexts()
            .await?
            .remove(&coin)
            .ok_or(FetchError::NotListed {
                exchange: Exchange::Hyperliquid,
                symbol: coin,
            })
    }
}

#[async_trait::async_trait]
impl ExchangeAdapter for HyperliquidAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Hyperliquid
    }

    async fn fetch_funding_rate(&self, base_token: &str) -> Result<FundingRate, FetchError> {
        let ctx = self.asset_context(base_token).await?;
        Ok(FundingRate {
            rate: ctx.funding,
            next_funding_time: utils::next_hour_ms(utils::now_ms()),
            interval: Some(FUNDING_INTERVAL_HOURS),
        })
    }

    async fn fetch_funding_history(&self, base_token: &str) -> Result<Vec<FundingHistoryPoint>, FetchError> {
        let coin = self.symbol(base_token, MarketKind::Perpetual);
        let mut start_time = utils::now_ms() - HISTORY_LOOKBACK_MS;
        let mut points = Vec::new();

        for _ in 0..HISTORY_MAX_PAGES {
            let page: Vec<FundingHistoryRow> = self
                .info(json!({"type": "fundingHistory", "coin": coin, "startTime": start_time}))
                .await?;
            let page_len = page.len();
            let Some(last_time) = page.last().map(|r| r.time) else {
                break;
            };

            points.extend(page.into_iter().map(|r| FundingHistoryPoint {
                funding_time: r.time,
                funding_rate: r.funding_rate,
            }));

            if page_len < HISTORY_PAGE_SIZE {
                break;
            }
            start_time = last_time + 1;
        }

        Ok(sorted_history(points))
    }

    async fn fetch_volume_24h(&self, base_token: &str) -> Result<f64, FetchError> {
        Ok(self.asset_context(base_token).await?.day_ntl_vlm)
    }

    async fn fetch_depth(&self, base_token: &str, market: MarketKind) -> Result<OrderBookSnapshot, FetchError> {
        if market == MarketKind::Spot {
            return Err(FetchError::Unsupported {
                exchange: Exchange::Hyperliquid,
                capability: "spot depth",
            });
        }
        let coin = self.symbol(base_token, market);
        let book: L2Book = self.info(json!({"type": "l2Book", "coin": coin})).await?;

        let mut sides = book.levels.into_iter().map(|side| {
            side.into_iter()
                .map(|l| PriceLevel { price: l.px, quantity: l.sz })
                .collect::<Vec<_>>()
        });
        let bids = sides.next().unwrap_or_default();
        let asks = sides.next().unwrap_or_default();

        Ok(OrderBookSnapshot::new(book.coin, bids, asks, book.time))
    }

    async fn fetch_account(&self) -> Result<AccountSnapshot, FetchError> {
        let address = self
            .address
            .as_deref()
            .ok_or(FetchError::MissingCredentials(Exchange::Hyperliquid))?;

        let (state, spot, ctxs) = tokio::join!(
            self.info::<ClearinghouseState>(json!({"type": "clearinghouseState", "user": address})),
            self.info::<SpotState>(json!({"type": "spotClearinghouseState", "user": address})),
            self.asset_contexts(),
        );
        let state = state?;
        let rates: HashMap<String, f64> = ctxs?.into_iter().map(|(coin, ctx)| (coin, ctx.funding)).collect();

        let spot_balances = match spot {
            Ok(spot) => spot
                .balances
                .into_iter()
                .filter(|b| b.total > 0.0)
                .map(|b| SpotBalance {
                    exchange: Exchange::Hyperliquid,
                    asset: b.coin.to_uppercase(),
                    amount: b.total,
                })
                .collect(),
            Err(e) => {
                tracing::warn!("[HYPERLIQUID] spot balances unavailable: {}", e);
                Vec::new()
            }
        };

        Ok(AccountSnapshot {
            exchange: Exchange::Hyperliquid,
            positions: positions_from_state(state.asset_positions, &rates),
            spot_balances,
            margin_balance: state.margin_summary.account_value,
        })
    }
}

fn positions_from_state(rows: Vec<AssetPosition>, rates: &HashMap<String, f64>) -> Vec<Position> {
    rows.into_iter()
        .map(|row| row.position)
        .filter(|p| p.szi != 0.0 && p.szi.is_finite())
        .map(|p| {
            let size = p.szi.abs();
            let coin = p.coin.to_uppercase();
            Position {
                exchange: Exchange::Hyperliquid,
                side: if p.szi > 0.0 { Side::Buy } else { Side::Sell },
                // No mark price on the position; derive it from notional.
                mark_price: p.position_value / size,
                liq_price: if p.liquidation_px > 0.0 { p.liquidation_px } else { f64::NAN },
                avg_price: p.entry_px,
                funding_rate: rates.get(&coin).copied().unwrap_or(0.0),
                unrealized_pnl: p.unrealized_pnl,
                base_token: coin,
                size,
                stop_loss: None,
                take_profit: None,
            }
        })
        .collect()
}
