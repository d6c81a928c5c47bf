use std::collections::HashMap;

use serde::Serialize;

use crate::config::LeverageLimits;
use crate::exchange::Exchange;
use crate::strategy::types::{Position, Side, TokenGroup};
use crate::utils::{percentage_change, round_significant, signal};

/// Significant digits used before comparing hedge leg sizes.
const SIZE_PRECISION: i32 = 12;

/// Derived risk view for one position. `None` fields carry no signal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub exchange: Exchange,
    pub side: Side,
    pub size: f64,
    pub mark_price: f64,
    pub notional: f64,
    pub funding_rate: f64,
    pub unrealized_pnl: f64,
    /// Remaining margin of safety in percent, clamped at zero.
    pub distance_to_liquidation: Option<f64>,
    pub stop_loss_distance: Option<f64>,
    pub take_profit_distance: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NearestLiquidation {
    pub exchange: Exchange,
    /// `|percentage_change(mark, liq)|`.
    pub distance_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRisk {
    pub base_token: String,
    pub total_size_buy: f64,
    pub total_size_sell: f64,
    pub spread_size: f64,
    pub needs_rebalance: bool,
    pub estimated_funding_fee: f64,
    pub nearest_liquidation_buy: Option<NearestLiquidation>,
    pub nearest_liquidation_sell: Option<NearestLiquidation>,
    /// Price premium of the short leg over the long leg, in percent.
    pub premium_pct: Option<f64>,
    pub positions: Vec<PositionRisk>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeverageStatus {
    pub exchange: Exchange,
    pub notional: f64,
    pub margin_balance: f64,
    pub current_leverage: Option<f64>,
    pub threshold: f64,
    pub over_leveraged: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RiskReport {
    pub tokens: Vec<TokenRisk>,
    pub leverage: Vec<LeverageStatus>,
}

/// Pure risk math over normalized token groups.
pub struct RiskCalculator;

impl RiskCalculator {
    pub fn evaluate(group: &TokenGroup) -> TokenRisk {
        let total_size_sell: f64 = group.sells.iter().map(|p| p.size).sum();
        let total_size_buy: f64 = group.buys.iter().map(|p| p.size).sum();
        let spread_size = Self::spread_size(total_size_sell, total_size_buy);

        let all = || group.sells.iter().chain(group.buys.iter());

        let nearest_liquidation_buy = Self::nearest_liquidation(&group.buys);
        let nearest_liquidation_sell = Self::nearest_liquidation(&group.sells);

        TokenRisk {
            base_token: group.base_token.clone(),
            total_size_buy,
            total_size_sell,
            spread_size,
            needs_rebalance: spread_size != 0.0 && !spread_size.is_nan(),
            estimated_funding_fee: Self::estimated_funding_fee(all()),
            nearest_liquidation_buy,
            nearest_liquidation_sell,
            premium_pct: Self::premium(group),
            positions: all().map(Self::position_risk).collect(),
        }
    }

    /// Absolute size imbalance between legs after rounding away float drift.
    pub fn spread_size(total_sell: f64, total_buy: f64) -> f64 {
        (round_significant(total_sell, SIZE_PRECISION) - round_significant(total_buy, SIZE_PRECISION)).abs()
    }

    /// Shorts earn a positive rate, longs (spot included) pay it.
    pub fn estimated_funding_fee<'a>(positions: impl IntoIterator<Item = &'a Position>) -> f64 {
        positions
            .into_iter()
            .map(|p| {
                let sign = if p.side == Side::Sell { 1.0 } else { -1.0 };
                p.mark_price * p.size * p.funding_rate * sign
            })
            .sum()
    }

    /// `max(100 - |percentage_change(mark, liq)|, 0)`. NaN stays NaN.
    pub fn distance_to_liquidation(mark_price: f64, liq_price: f64) -> f64 {
        let distance = 100.0 - percentage_change(mark_price, liq_price).abs();
        if distance.is_nan() {
            distance
        } else {
            distance.max(0.0)
        }
    }

    /// Same-side position closest to its liquidation price. Positions without
    /// a measurable distance are skipped.
    pub fn nearest_liquidation(positions: &[Position]) -> Option<NearestLiquidation> {
        positions
            .iter()
            .filter_map(|p| {
                let distance = percentage_change(p.mark_price, p.liq_price).abs();
                (!distance.is_nan()).then_some(NearestLiquidation {
                    exchange: p.exchange,
                    distance_pct: distance,
                })
            })
            .fold(None, |best: Option<NearestLiquidation>, candidate| match best {
                Some(b) if b.distance_pct <= candidate.distance_pct => Some(b),
                _ => Some(candidate),
            })
    }

    /// Premium of the first priced short leg over the first priced long leg.
    fn premium(group: &TokenGroup) -> Option<f64> {
        let priced = |p: &&Position| p.mark_price.is_finite() && p.mark_price != 0.0;
        let buy = group.buys.iter().find(priced)?;
        let sell = group.sells.iter().find(priced)?;
        signal(percentage_change(buy.mark_price, sell.mark_price))
    }

    fn position_risk(p: &Position) -> PositionRisk {
        let distance = |target: Option<f64>| target.and_then(|t| signal(percentage_change(p.mark_price, t)));
        PositionRisk {
            exchange: p.exchange,
            side: p.side,
            size: p.size,
            mark_price: p.mark_price,
            notional: p.notional(),
            funding_rate: p.funding_rate,
            unrealized_pnl: p.unrealized_pnl,
            distance_to_liquidation: signal(Self::distance_to_liquidation(p.mark_price, p.liq_price)),
            stop_loss_distance: distance(p.stop_loss),
            take_profit_distance: distance(p.take_profit),
        }
    }

    /// Current leverage per exchange: derivative notional over margin balance.
    ///
    /// Exchanges appear in the order of `margins`' sorted keys. A zero or
    /// unknown margin balance produces no leverage signal and is never flagged.
    pub fn leverage(
        groups: &[TokenGroup],
        margins: &HashMap<Exchange, f64>,
        limits: &LeverageLimits,
    ) -> Vec<LeverageStatus> {
        let mut notionals: HashMap<Exchange, f64> = HashMap::new();
        for p in groups.iter().flat_map(|g| g.buys.iter().chain(g.sells.iter())) {
            if p.side != Side::Spot {
                *notionals.entry(p.exchange).or_default() += p.notional().abs();
            }
        }

        let mut exchanges: Vec<Exchange> = margins.keys().chain(notionals.keys()).copied().collect();
        exchanges.sort();
        exchanges.dedup();

        exchanges
            .into_iter()
            .map(|exchange| {
                let notional = notionals.get(&exchange).copied().unwrap_or(0.0);
                let margin_balance = margins.get(&exchange).copied().unwrap_or(f64::NAN);
                Self::leverage_status(exchange, notional, margin_balance, limits.threshold(exchange))
            })
            .collect()
    }

    pub fn leverage_status(exchange: Exchange, notional: f64, margin_balance: f64, threshold: f64) -> LeverageStatus {
        let current_leverage = signal(notional / margin_balance);
        LeverageStatus {
            exchange,
            notional,
            margin_balance,
            current_leverage,
            threshold,
            over_leveraged: current_leverage.is_some_and(|l| l > threshold),
        }
    }
}
