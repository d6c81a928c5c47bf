use crate::exchange::Exchange;
use crate::strategy::types::{ExchangePositions, Position, Side, SpotBalance, TokenGroup};

/// Merges per-exchange position feeds and spot balances into per-token hedge
/// groups.
pub struct PositionNormalizer;

impl PositionNormalizer {
    /// Group positions by base token.
    ///
    /// Spot balances become synthetic long positions. Derivative positions
    /// without a usable mark price are dropped one by one. A group survives
    /// only if it touches an allowed exchange (empty `filter` allows all) and
    /// is not a lone spot holding. Groups come out in first-seen token order.
    pub fn normalize(
        per_exchange: &[ExchangePositions],
        spot_balances: &[SpotBalance],
        filter: &[Exchange],
    ) -> Vec<TokenGroup> {
        let positions = per_exchange
            .iter()
            .flat_map(|feed| {
                feed.positions.iter().map(move |p| Position {
                    exchange: feed.exchange,
                    ..p.clone()
                })
            })
            .chain(
                spot_balances
                    .iter()
                    .map(|b| Position::spot(b.exchange, &b.asset.to_uppercase(), b.amount)),
            )
            .filter(is_valid);

        let mut groups: Vec<TokenGroup> = Vec::new();
        for position in positions {
            let idx = match groups.iter().position(|g| g.base_token == position.base_token) {
                Some(idx) => idx,
                None => {
                    groups.push(TokenGroup {
                        base_token: position.base_token.clone(),
                        buys: Vec::new(),
                        sells: Vec::new(),
                    });
                    groups.len() - 1
                }
            };
            let group = &mut groups[idx];
            match position.side {
                Side::Sell => group.sells.push(position),
                Side::Buy | Side::Spot => group.buys.push(position),
            }
        }

        groups.retain(|g| passes_filter(g, filter) && !is_unhedged_spot(g));
        groups
    }
}

fn is_valid(position: &Position) -> bool {
    if !(position.size >= 0.0) {
        return false;
    }
    match position.side {
        Side::Spot => true,
        Side::Buy | Side::Sell => position.mark_price.is_finite() && position.mark_price != 0.0,
    }
}

fn passes_filter(group: &TokenGroup, filter: &[Exchange]) -> bool {
    filter.is_empty()
        || group
            .buys
            .iter()
            .chain(group.sells.iter())
            .any(|p| filter.contains(&p.exchange))
}

/// Spot-only holdings with nothing on the short side carry no hedge.
pub fn is_unhedged_spot(group: &TokenGroup) -> bool {
    group.sells.is_empty() && group.buys.iter().all(|p| p.side == Side::Spot)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perp(exchange: Exchange, side: Side, token: &str, size: f64, mark: f64) -> Position {
        Position {
            exchange,
            side,
            base_token: token.to_string(),
            size,
            mark_price: mark,
            liq_price: f64::NAN,
            avg_price: mark,
            funding_rate: 0.0001,
            unrealized_pnl: 0.0,
            stop_loss: None,
            take_profit: None,
        }
    }

    fn feed(exchange: Exchange, positions: Vec<Position>) -> ExchangePositions {
        ExchangePositions { exchange, positions }
    }

    #[test]
    fn test_buckets_by_side_in_first_seen_order() {
        let feeds = vec![
            feed(Exchange::Binance, vec![perp(Exchange::Binance, Side::Sell, "ETH", 1.0, 3000.0)]),
            feed(
                Exchange::Bybit,
                vec![
                    perp(Exchange::Bybit, Side::Buy, "BTC", 0.1, 60000.0),
                    perp(Exchange::Bybit, Side::Buy, "ETH", 1.0, 3001.0),
                ],
            ),
            feed(Exchange::Okx, vec![perp(Exchange::Okx, Side::Sell, "BTC", 0.1, 60010.0)]),
        ];

        let groups = PositionNormalizer::normalize(&feeds, &[], &[]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].base_token, "ETH");
        assert_eq!(groups[0].sells[0].exchange, Exchange::Binance);
        assert_eq!(groups[0].buys[0].exchange, Exchange::Bybit);
        assert_eq!(groups[1].base_token, "BTC");
    }

    #[test]
    fn test_feed_exchange_overrides_position_tag() {
        let feeds = vec![feed(
            Exchange::Okx,
            vec![
                perp(Exchange::Binance, Side::Sell, "SOL", 5.0, 150.0),
                perp(Exchange::Binance, Side::Buy, "SOL", 5.0, 150.0),
            ],
        )];
        let groups = PositionNormalizer::normalize(&feeds, &[], &[]);
        assert_eq!(groups[0].sells[0].exchange, Exchange::Okx);
    }

    #[test]
    fn test_spot_only_group_is_dropped() {
        let balances = vec![SpotBalance {
            exchange: Exchange::Binance,
            asset: "btc".to_string(),
            amount: 0.5,
        }];
        assert!(PositionNormalizer::normalize(&[], &balances, &[]).is_empty());
    }

    #[test]
    fn test_spot_hedged_by_short_is_kept() {
        let feeds = vec![feed(Exchange::Bybit, vec![perp(Exchange::Bybit, Side::Sell, "BTC", 0.5, 60000.0)])];
        let balances = vec![SpotBalance {
            exchange: Exchange::Binance,
            asset: "BTC".to_string(),
            amount: 0.5,
        }];
        let groups = PositionNormalizer::normalize(&feeds, &balances, &[]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].buys[0].side, Side::Spot);
        assert!(groups[0].buys[0].liq_price.is_nan());
    }

    #[test]
    fn test_allow_list_keeps_groups_touching_selected_exchange() {
        let feeds = vec![
            feed(Exchange::Binance, vec![perp(Exchange::Binance, Side::Sell, "BTC", 1.0, 60000.0)]),
            feed(Exchange::Bybit, vec![perp(Exchange::Bybit, Side::Buy, "BTC", 1.0, 60000.0)]),
            feed(Exchange::Gateio, vec![perp(Exchange::Gateio, Side::Buy, "DOGE", 100.0, 0.1)]),
        ];
        let groups = PositionNormalizer::normalize(&feeds, &[], &[Exchange::Bybit]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].base_token, "BTC");
        assert_eq!(groups[0].sells.len(), 1);
    }

    #[test]
    fn test_nan_mark_price_is_dropped() {
        let feeds = vec![feed(
            Exchange::Binance,
            vec![
                perp(Exchange::Binance, Side::Sell, "ETH", 1.0, f64::NAN),
                perp(Exchange::Binance, Side::Buy, "ETH", 1.0, 3000.0),
            ],
        )];
        let groups = PositionNormalizer::normalize(&feeds, &[], &[]);
        assert!(groups[0].sells.is_empty());
        assert_eq!(groups[0].buys.len(), 1);
    }
}
