#[cfg(test)]
mod property_tests {
    use crate::exchange::Exchange;
    use crate::strategy::normalizer::{is_unhedged_spot, PositionNormalizer};
    use crate::strategy::risk::RiskCalculator;
    use crate::strategy::selector::{ArbitrageSelector, MS_PER_WEEK};
    use crate::strategy::types::*;
    use proptest::prelude::*;

    const NOW: i64 = 1_700_000_000_000;
    const TOKENS: [&str; 3] = ["BTC", "ETH", "SOL"];

    fn arb_exchange() -> impl Strategy<Value = Exchange> {
        prop::sample::select(Exchange::ALL.to_vec())
    }

    fn arb_history() -> impl Strategy<Value = Vec<FundingHistoryPoint>> {
        let eight_weeks = (8.0 * MS_PER_WEEK) as i64;
        prop::collection::vec((0..eight_weeks, -0.01f64..0.01), 0..12).prop_map(|points| {
            let mut history: Vec<FundingHistoryPoint> = points
                .into_iter()
                .map(|(age, rate)| FundingHistoryPoint {
                    funding_time: NOW - age,
                    funding_rate: rate,
                })
                .collect();
            history.sort_by_key(|p| p.funding_time);
            history
        })
    }

    fn arb_record() -> impl Strategy<Value = FundingRecord> {
        (arb_exchange(), prop::sample::select(TOKENS.to_vec()), arb_history()).prop_map(
            |(exchange, token, history)| FundingRecord {
                exchange,
                symbol: exchange.symbol_for(token, MarketKind::Perpetual),
                base_token: token.to_string(),
                current_rate: history.last().map(|p| p.funding_rate).unwrap_or(0.0),
                next_funding_time: NOW + 3_600_000,
                interval: None,
                vol24h: 0.0,
                history,
            },
        )
    }

    fn arb_records() -> impl Strategy<Value = Vec<FundingRecord>> {
        prop::collection::vec(arb_record(), 0..10)
    }

    fn in_window_exchanges(records: &[FundingRecord], token: &str, weeks: f64) -> usize {
        let cutoff = NOW - (weeks * MS_PER_WEEK).round() as i64;
        records
            .iter()
            .filter(|r| r.base_token == token)
            .filter(|r| r.history.iter().any(|p| p.funding_time >= cutoff))
            .count()
    }

    fn arb_position() -> impl Strategy<Value = Position> {
        (
            arb_exchange(),
            prop::sample::select(vec![Side::Buy, Side::Sell]),
            prop::sample::select(TOKENS.to_vec()),
            0.0f64..100.0,
            prop::sample::select(vec![0.0, f64::NAN, 1.0, 250.0, 60_000.0]),
        )
            .prop_map(|(exchange, side, token, size, mark)| Position {
                exchange,
                side,
                base_token: token.to_string(),
                size,
                mark_price: mark,
                liq_price: mark * 0.5,
                avg_price: mark,
                funding_rate: 0.0001,
                unrealized_pnl: 0.0,
                stop_loss: None,
                take_profit: None,
            })
    }

    // Property 1: Selector idempotence
    proptest! {
        #[test]
        fn prop_selector_idempotent(records in arb_records(), weeks in 0.5f64..8.0) {
            let first = ArbitrageSelector::select(&records, weeks, NOW);
            let second = ArbitrageSelector::select(&records, weeks, NOW);

            prop_assert_eq!(first.len(), second.len());
            for (a, b) in first.iter().zip(second.iter()) {
                prop_assert_eq!(&a.base_token, &b.base_token);
                prop_assert_eq!(a.buy_exchange, b.buy_exchange);
                prop_assert_eq!(a.sell_exchange, b.sell_exchange);
                prop_assert_eq!(a.cumulative_diff, b.cumulative_diff);
                prop_assert_eq!(a.cumulative_apr, b.cumulative_apr);
            }
        }
    }

    // Property 2: Sign rule and strict positivity hold for every window
    proptest! {
        #[test]
        fn prop_sign_rule_across_windows(records in arb_records(), short in 0.5f64..4.0, extra in 0.0f64..4.0) {
            for weeks in [short, short + extra] {
                let opportunities = ArbitrageSelector::select(&records, weeks, NOW);
                for opp in &opportunities {
                    prop_assert!(opp.sell_total >= opp.buy_total);
                    prop_assert!(opp.cumulative_diff > 0.0);
                    prop_assert!(opp.cumulative_apr > 0.0);
                }
                for pair in opportunities.windows(2) {
                    prop_assert!(pair[0].cumulative_apr >= pair[1].cumulative_apr);
                }
            }
        }
    }

    // Property 3: No signal without two exchanges in the window
    proptest! {
        #[test]
        fn prop_no_signal_below_two_exchanges(records in arb_records(), weeks in 0.5f64..8.0) {
            let opportunities = ArbitrageSelector::select(&records, weeks, NOW);
            for token in TOKENS {
                if in_window_exchanges(&records, token, weeks) < 2 {
                    prop_assert!(opportunities.iter().all(|o| o.base_token != token));
                }
            }
        }
    }

    // Property 4: Identical totals never produce an opportunity
    proptest! {
        #[test]
        fn prop_identical_totals_emit_nothing(
            rate in -0.01f64..0.01,
            exchanges in prop::sample::subsequence(Exchange::ALL.to_vec(), 2..=6),
        ) {
            let records: Vec<FundingRecord> = exchanges
                .into_iter()
                .map(|exchange| FundingRecord {
                    exchange,
                    symbol: exchange.symbol_for("BTC", MarketKind::Perpetual),
                    base_token: "BTC".to_string(),
                    current_rate: rate,
                    next_funding_time: NOW,
                    interval: None,
                    vol24h: 0.0,
                    history: vec![FundingHistoryPoint { funding_time: NOW - 1_000, funding_rate: rate }],
                })
                .collect();
            prop_assert!(ArbitrageSelector::select(&records, 1.0, NOW).is_empty());
        }
    }

    // Property 5: Normalizer never emits an unhedged spot group or a bad mark
    proptest! {
        #[test]
        fn prop_normalizer_invariant(
            positions in prop::collection::vec(arb_position(), 0..12),
            balances in prop::collection::vec(
                (arb_exchange(), prop::sample::select(TOKENS.to_vec()), 0.0f64..10.0),
                0..4,
            ),
        ) {
            let feeds = vec![ExchangePositions { exchange: Exchange::Binance, positions }];
            let balances: Vec<SpotBalance> = balances
                .into_iter()
                .map(|(exchange, asset, amount)| SpotBalance { exchange, asset: asset.to_string(), amount })
                .collect();

            for group in PositionNormalizer::normalize(&feeds, &balances, &[]) {
                prop_assert!(!is_unhedged_spot(&group));
                prop_assert!(group.sells.iter().all(|p| p.side == Side::Sell));
                for p in group.buys.iter().chain(group.sells.iter()) {
                    prop_assert_eq!(&p.base_token, &group.base_token);
                    if p.side != Side::Spot {
                        prop_assert!(p.mark_price.is_finite() && p.mark_price != 0.0);
                    }
                }
            }
        }
    }

    // Property 6: Liquidation distance is never negative
    proptest! {
        #[test]
        fn prop_liquidation_distance_clamped(mark in -1.0e6f64..1.0e6, liq in -1.0e6f64..1.0e6) {
            let distance = RiskCalculator::distance_to_liquidation(mark, liq);
            prop_assert!(distance.is_nan() || (0.0..=100.0).contains(&distance));
        }
    }

    // Property 7: Leg imbalance is symmetric and vanishes for equal legs
    proptest! {
        #[test]
        fn prop_spread_size_symmetric(sell in 0.0f64..1.0e4, buy in 0.0f64..1.0e4) {
            let spread = RiskCalculator::spread_size(sell, buy);
            prop_assert!(spread >= 0.0);
            prop_assert_eq!(spread, RiskCalculator::spread_size(buy, sell));
            prop_assert_eq!(RiskCalculator::spread_size(sell, sell), 0.0);
        }
    }
}
