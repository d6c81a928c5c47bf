use serde::{Deserialize, Serialize};

use crate::exchange::Exchange;

// ============================================================================
// Positions (risk pipeline)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
    /// Spot holding, modeled as an implicit long.
    Spot,
}

/// One open position on one exchange.
///
/// `size` is always non-negative; direction lives in `side`. Spot holdings
/// carry `liq_price = NaN`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub exchange: Exchange,
    pub side: Side,
    pub base_token: String,
    pub size: f64,
    pub mark_price: f64,
    pub liq_price: f64,
    pub avg_price: f64,
    pub funding_rate: f64,
    pub unrealized_pnl: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
}

impl Position {
    /// Synthetic spot position for a wallet balance.
    pub fn spot(exchange: Exchange, base_token: &str, amount: f64) -> Self {
        Self {
            exchange,
            side: Side::Spot,
            base_token: base_token.to_string(),
            size: amount,
            mark_price: 0.0,
            liq_price: f64::NAN,
            avg_price: 0.0,
            funding_rate: 0.0,
            unrealized_pnl: 0.0,
            stop_loss: None,
            take_profit: None,
        }
    }

    #[inline(always)]
    pub fn notional(&self) -> f64 {
        self.mark_price * self.size
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotBalance {
    pub exchange: Exchange,
    pub asset: String,
    pub amount: f64,
}

/// Raw position list as reported by one exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePositions {
    pub exchange: Exchange,
    pub positions: Vec<Position>,
}

/// Everything one account call returns for an exchange.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub exchange: Exchange,
    pub positions: Vec<Position>,
    pub spot_balances: Vec<SpotBalance>,
    /// Total margin balance in quote currency; NaN when the exchange does not
    /// report one.
    pub margin_balance: f64,
}

/// Unified per-token view across exchanges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGroup {
    pub base_token: String,
    pub buys: Vec<Position>,
    pub sells: Vec<Position>,
}

// ============================================================================
// Funding (arbitrage pipeline)
// ============================================================================

/// Current funding snapshot as returned by an adapter probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingRate {
    pub rate: f64,
    pub next_funding_time: i64,
    /// Settlement interval in hours, when the exchange reports it.
    pub interval: Option<f64>,
}

/// One historical funding settlement. `funding_rate` is a ratio, not a percentage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingHistoryPoint {
    pub funding_time: i64,
    pub funding_rate: f64,
}

/// One (exchange, token) funding snapshot. `history` is ascending by
/// `funding_time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingRecord {
    pub exchange: Exchange,
    pub symbol: String,
    pub base_token: String,
    pub current_rate: f64,
    pub next_funding_time: i64,
    pub interval: Option<f64>,
    pub vol24h: f64,
    pub history: Vec<FundingHistoryPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArbitrageOpportunity {
    pub base_token: String,
    pub buy_exchange: Exchange,
    pub sell_exchange: Exchange,
    pub buy_rate: f64,
    pub sell_rate: f64,
    pub buy_vol24h: f64,
    pub sell_vol24h: f64,
    /// Windowed cumulative funding on the buy side.
    pub buy_total: f64,
    /// Windowed cumulative funding on the sell side.
    pub sell_total: f64,
    pub cumulative_diff: f64,
    /// Linear annualization of the windowed differential, as a ratio (3.65 = 365%).
    pub cumulative_apr: f64,
    pub period_weeks: f64,
    pub next_funding_time_buy: i64,
    pub next_funding_time_sell: i64,
}

/// Windowed funding series for one exchange, used by history charts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingHistoryResult {
    pub exchange: Exchange,
    pub symbol: String,
    pub current_rate: f64,
    pub interval: Option<f64>,
    pub cumulative: f64,
    pub history: Vec<FundingHistoryPoint>,
}

// ============================================================================
// Order books (spread poller)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Perpetual,
    Spot,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: f64,
}

/// Depth for one exchange/symbol. Bids descending, asks ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    /// Exchange-reported update time in epoch milliseconds.
    pub updated: i64,
}

impl OrderBookSnapshot {
    /// Build a snapshot and enforce level ordering. Levels with non-finite or
    /// non-positive prices are dropped.
    pub fn new(symbol: String, mut bids: Vec<PriceLevel>, mut asks: Vec<PriceLevel>, updated: i64) -> Self {
        bids.retain(|l| l.price.is_finite() && l.price > 0.0);
        asks.retain(|l| l.price.is_finite() && l.price > 0.0);
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        Self { symbol, bids, asks, updated }
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_book_snapshot_sorts_levels() {
        let book = OrderBookSnapshot::new(
            "BTCUSDT".to_string(),
            vec![
                PriceLevel { price: 99.0, quantity: 1.0 },
                PriceLevel { price: 100.0, quantity: 2.0 },
                PriceLevel { price: 0.0, quantity: 5.0 },
            ],
            vec![
                PriceLevel { price: 102.0, quantity: 1.0 },
                PriceLevel { price: 101.0, quantity: 3.0 },
            ],
            1_700_000_000_000,
        );

        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.best_bid().unwrap().price, 100.0);
        assert_eq!(book.best_ask().unwrap().price, 101.0);
    }

    #[test]
    fn test_spot_position_has_no_liquidation_price() {
        let p = Position::spot(Exchange::Binance, "ETH", 2.5);
        assert_eq!(p.side, Side::Spot);
        assert!(p.liq_price.is_nan());
        assert_eq!(p.mark_price, 0.0);
        assert_eq!(p.size, 2.5);
    }

    #[test]
    fn test_position_serializes_camel_case() {
        let p = Position::spot(Exchange::Okx, "SOL", 1.0);
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"baseToken\":\"SOL\""));
        assert!(json.contains("\"side\":\"spot\""));
        assert!(json.contains("\"exchange\":\"okx\""));
    }
}
