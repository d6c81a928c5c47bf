use std::cmp::Ordering;

use crate::strategy::types::{ArbitrageOpportunity, FundingHistoryPoint, FundingHistoryResult, FundingRecord};

pub const MS_PER_WEEK: f64 = 7.0 * 24.0 * 3_600_000.0;
const DAYS_PER_YEAR: f64 = 365.0;

/// Ranks cross-exchange funding differentials.
pub struct ArbitrageSelector;

/// Windowed total for one exchange of a token group.
struct WindowedTotal<'a> {
    record: &'a FundingRecord,
    total: f64,
}

impl ArbitrageSelector {
    /// Rank funding arbitrage opportunities over a trailing window.
    ///
    /// For each base token the exchange with the lowest windowed cumulative
    /// funding becomes the buy (long) side and the one with the highest becomes
    /// the sell (short) side. Only strictly positive differentials are kept.
    ///
    /// # Arguments
    /// * `records` - Funding records, any order, any mix of tokens
    /// * `window_weeks` - Lookback window; non-positive or non-finite yields nothing
    /// * `now_ms` - Reference time the window ends at
    ///
    /// # Returns
    /// Opportunities sorted by `cumulative_apr`, highest first.
    ///
    /// # Ties
    /// Among equal minimum totals the first in record order is the buy side;
    /// among equal maximum totals the first is the sell side.
    pub fn select(records: &[FundingRecord], window_weeks: f64, now_ms: i64) -> Vec<ArbitrageOpportunity> {
        if !(window_weeks.is_finite() && window_weeks > 0.0) {
            return Vec::new();
        }
        let cutoff = window_cutoff(window_weeks, now_ms);

        let mut opportunities: Vec<ArbitrageOpportunity> = group_by_token(records)
            .into_iter()
            .filter_map(|(token, group)| {
                let totals: Vec<WindowedTotal> = group
                    .into_iter()
                    .filter_map(|record| {
                        let total = windowed_total(&record.history, cutoff)?;
                        total.is_finite().then_some(WindowedTotal { record, total })
                    })
                    .collect();

                if totals.len() < 2 {
                    return None;
                }

                let buy = totals.iter().fold(&totals[0], |best, t| if t.total < best.total { t } else { best });
                let sell = totals.iter().fold(&totals[0], |best, t| if t.total > best.total { t } else { best });

                let cumulative_diff = sell.total - buy.total;
                if cumulative_diff <= 0.0 {
                    return None;
                }

                Some(ArbitrageOpportunity {
                    base_token: token.to_string(),
                    buy_exchange: buy.record.exchange,
                    sell_exchange: sell.record.exchange,
                    buy_rate: buy.record.current_rate,
                    sell_rate: sell.record.current_rate,
                    buy_vol24h: buy.record.vol24h,
                    sell_vol24h: sell.record.vol24h,
                    buy_total: buy.total,
                    sell_total: sell.total,
                    cumulative_diff,
                    cumulative_apr: cumulative_diff / (window_weeks * 7.0) * DAYS_PER_YEAR,
                    period_weeks: window_weeks,
                    next_funding_time_buy: buy.record.next_funding_time,
                    next_funding_time_sell: sell.record.next_funding_time,
                })
            })
            .collect();

        opportunities.sort_by(|a, b| b.cumulative_apr.partial_cmp(&a.cumulative_apr).unwrap_or(Ordering::Equal));

        tracing::debug!(
            "[SELECTOR] {} opportunities from {} records over {} weeks",
            opportunities.len(),
            records.len(),
            window_weeks
        );
        opportunities
    }

    /// Windowed history and cumulative funding per exchange, sorted by exchange.
    /// Records with no points inside the window are still reported with an empty
    /// series and a zero total.
    pub fn funding_history(records: &[FundingRecord], window_weeks: f64, now_ms: i64) -> Vec<FundingHistoryResult> {
        if !(window_weeks.is_finite() && window_weeks > 0.0) {
            return Vec::new();
        }
        let cutoff = window_cutoff(window_weeks, now_ms);

        let mut results: Vec<FundingHistoryResult> = records
            .iter()
            .map(|record| {
                let history: Vec<FundingHistoryPoint> = record
                    .history
                    .iter()
                    .filter(|p| p.funding_time >= cutoff)
                    .copied()
                    .collect();
                FundingHistoryResult {
                    exchange: record.exchange,
                    symbol: record.symbol.clone(),
                    current_rate: record.current_rate,
                    interval: record.interval,
                    cumulative: history.iter().map(|p| p.funding_rate).sum(),
                    history,
                }
            })
            .collect();

        results.sort_by_key(|r| r.exchange);
        results
    }
}

fn window_cutoff(window_weeks: f64, now_ms: i64) -> i64 {
    now_ms - (window_weeks * MS_PER_WEEK).round() as i64
}

/// Sum of rates at or after `cutoff`; `None` when the window is empty.
fn windowed_total(history: &[FundingHistoryPoint], cutoff: i64) -> Option<f64> {
    let mut in_window = history.iter().filter(|p| p.funding_time >= cutoff).peekable();
    in_window.peek()?;
    Some(in_window.map(|p| p.funding_rate).sum())
}

/// Records grouped by base token, tokens in first-seen order and records in
/// input order within each group.
fn group_by_token(records: &[FundingRecord]) -> Vec<(&str, Vec<&FundingRecord>)> {
    let mut groups: Vec<(&str, Vec<&FundingRecord>)> = Vec::new();
    for record in records {
        match groups.iter_mut().find(|(token, _)| *token == record.base_token) {
            Some((_, group)) => group.push(record),
            None => groups.push((record.base_token.as_str(), vec![record])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Exchange;

    const NOW: i64 = 1_700_000_000_000;
    const HOUR: i64 = 3_600_000;

    fn record(exchange: Exchange, token: &str, points: &[(i64, f64)]) -> FundingRecord {
        FundingRecord {
            exchange,
            symbol: exchange.symbol_for(token, crate::strategy::types::MarketKind::Perpetual),
            base_token: token.to_string(),
            current_rate: points.last().map(|p| p.1).unwrap_or(0.0),
            next_funding_time: NOW + HOUR,
            interval: Some(8.0),
            vol24h: 1_000_000.0,
            history: points
                .iter()
                .map(|&(t, r)| FundingHistoryPoint { funding_time: t, funding_rate: r })
                .collect(),
        }
    }

    #[test]
    fn test_points_outside_window_are_ignored() {
        let old = NOW - 2 * MS_PER_WEEK as i64;
        let records = vec![
            record(Exchange::Binance, "BTC", &[(old, 5.0), (NOW - HOUR, 0.01)]),
            record(Exchange::Bybit, "BTC", &[(NOW - HOUR, 0.02)]),
        ];
        let opps = ArbitrageSelector::select(&records, 1.0, NOW);
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].buy_exchange, Exchange::Binance);
        assert_eq!(opps[0].sell_exchange, Exchange::Bybit);
        assert!((opps[0].cumulative_diff - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_equal_totals_produce_nothing() {
        let records = vec![
            record(Exchange::Binance, "ETH", &[(NOW - HOUR, 0.01)]),
            record(Exchange::Okx, "ETH", &[(NOW - HOUR, 0.01)]),
        ];
        assert!(ArbitrageSelector::select(&records, 1.0, NOW).is_empty());
    }

    #[test]
    fn test_ties_pick_first_encountered() {
        let records = vec![
            record(Exchange::Okx, "SOL", &[(NOW - HOUR, -0.01)]),
            record(Exchange::Binance, "SOL", &[(NOW - HOUR, -0.01)]),
            record(Exchange::Gateio, "SOL", &[(NOW - HOUR, 0.03)]),
            record(Exchange::Bybit, "SOL", &[(NOW - HOUR, 0.03)]),
        ];
        let opps = ArbitrageSelector::select(&records, 1.0, NOW);
        assert_eq!(opps[0].buy_exchange, Exchange::Okx);
        assert_eq!(opps[0].sell_exchange, Exchange::Gateio);
    }

    #[test]
    fn test_single_exchange_is_skipped() {
        let records = vec![
            record(Exchange::Binance, "BTC", &[(NOW - HOUR, 0.01)]),
            record(Exchange::Bybit, "BTC", &[]),
        ];
        assert!(ArbitrageSelector::select(&records, 1.0, NOW).is_empty());
    }

    #[test]
    fn test_non_positive_window_yields_nothing() {
        let records = vec![
            record(Exchange::Binance, "BTC", &[(NOW - HOUR, 0.01)]),
            record(Exchange::Bybit, "BTC", &[(NOW - HOUR, 0.02)]),
        ];
        assert!(ArbitrageSelector::select(&records, 0.0, NOW).is_empty());
        assert!(ArbitrageSelector::select(&records, -1.0, NOW).is_empty());
        assert!(ArbitrageSelector::select(&records, f64::NAN, NOW).is_empty());
    }

    #[test]
    fn test_sorted_by_apr_descending() {
        let records = vec![
            record(Exchange::Binance, "BTC", &[(NOW - HOUR, 0.0)]),
            record(Exchange::Bybit, "BTC", &[(NOW - HOUR, 0.01)]),
            record(Exchange::Binance, "ETH", &[(NOW - HOUR, 0.0)]),
            record(Exchange::Bybit, "ETH", &[(NOW - HOUR, 0.05)]),
        ];
        let opps = ArbitrageSelector::select(&records, 1.0, NOW);
        assert_eq!(opps.len(), 2);
        assert_eq!(opps[0].base_token, "ETH");
        assert!(opps[0].cumulative_apr >= opps[1].cumulative_apr);
    }

    #[test]
    fn test_funding_history_windows_and_sorts() {
        let old = NOW - 3 * MS_PER_WEEK as i64;
        let records = vec![
            record(Exchange::Okx, "BTC", &[(old, 1.0), (NOW - HOUR, 0.02)]),
            record(Exchange::Binance, "BTC", &[(NOW - 2 * HOUR, 0.01), (NOW - HOUR, 0.01)]),
        ];
        let results = ArbitrageSelector::funding_history(&records, 1.0, NOW);
        assert_eq!(results[0].exchange, Exchange::Binance);
        assert_eq!(results[0].history.len(), 2);
        assert!((results[0].cumulative - 0.02).abs() < 1e-12);
        assert_eq!(results[1].exchange, Exchange::Okx);
        assert_eq!(results[1].history.len(), 1);
    }
}
