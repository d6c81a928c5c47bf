//! In-memory exchange adapter for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hedgescope::error::FetchError;
use hedgescope::exchange::{Exchange, ExchangeAdapter};
use hedgescope::strategy::types::{
    AccountSnapshot, FundingHistoryPoint, FundingRate, MarketKind, OrderBookSnapshot, Position, PriceLevel, Side,
    SpotBalance,
};
use hedgescope::utils;

pub const HOUR_MS: i64 = 3_600_000;

pub struct MockAdapter {
    exchange: Exchange,
    rates: HashMap<String, f64>,
    history: HashMap<String, Vec<FundingHistoryPoint>>,
    failing_history: HashSet<String>,
    volume: HashMap<String, f64>,
    books: HashMap<String, (f64, f64)>,
    contract_size: f64,
    account: Option<AccountSnapshot>,
    latency: Option<(Duration, Arc<AtomicUsize>)>,
    pub depth_calls: AtomicUsize,
}

impl MockAdapter {
    pub fn new(exchange: Exchange) -> Self {
        Self {
            exchange,
            rates: HashMap::new(),
            history: HashMap::new(),
            failing_history: HashSet::new(),
            volume: HashMap::new(),
            books: HashMap::new(),
            contract_size: 1.0,
            account: None,
            latency: None,
            depth_calls: AtomicUsize::new(0),
        }
    }

    /// List `token` with the given settlements as `(time_ms, rate)`. The last
    /// rate doubles as the current rate.
    pub fn with_funding(mut self, token: &str, points: &[(i64, f64)]) -> Self {
        let history: Vec<FundingHistoryPoint> = points
            .iter()
            .map(|&(funding_time, funding_rate)| FundingHistoryPoint {
                funding_time,
                funding_rate,
            })
            .collect();
        self.rates
            .insert(token.to_string(), history.last().map(|p| p.funding_rate).unwrap_or(0.0));
        self.history.insert(token.to_string(), history);
        self
    }

    pub fn with_failing_history(mut self, token: &str) -> Self {
        self.failing_history.insert(token.to_string());
        self
    }

    pub fn with_volume(mut self, token: &str, volume: f64) -> Self {
        self.volume.insert(token.to_string(), volume);
        self
    }

    pub fn with_book(mut self, token: &str, bid: f64, ask: f64) -> Self {
        self.books.insert(token.to_string(), (bid, ask));
        self
    }

    pub fn with_contract_size(mut self, contract_size: f64) -> Self {
        self.contract_size = contract_size;
        self
    }

    pub fn with_account(mut self, positions: Vec<Position>, spot_balances: Vec<SpotBalance>, margin: f64) -> Self {
        self.account = Some(AccountSnapshot {
            exchange: self.exchange,
            positions,
            spot_balances,
            margin_balance: margin,
        });
        self
    }

    /// Delay every funding call by `delay`. `completed` counts the calls that
    /// made it past the delay.
    pub fn with_latency(mut self, delay: Duration, completed: Arc<AtomicUsize>) -> Self {
        self.latency = Some((delay, completed));
        self
    }

    pub fn into_arc(self) -> Arc<dyn ExchangeAdapter> {
        Arc::new(self)
    }

    async fn simulate_latency(&self) {
        if let Some((delay, completed)) = &self.latency {
            tokio::time::sleep(*delay).await;
            completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn not_listed(&self, token: &str, market: MarketKind) -> FetchError {
        FetchError::NotListed {
            exchange: self.exchange,
            symbol: self.symbol(token, market),
        }
    }
}

#[async_trait::async_trait]
impl ExchangeAdapter for MockAdapter {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    async fn fetch_funding_rate(&self, base_token: &str) -> Result<FundingRate, FetchError> {
        self.simulate_latency().await;
        let rate = self
            .rates
            .get(base_token)
            .copied()
            .ok_or_else(|| self.not_listed(base_token, MarketKind::Perpetual))?;
        Ok(FundingRate {
            rate,
            next_funding_time: utils::next_hour_ms(utils::now_ms()),
            interval: Some(8.0),
        })
    }

    async fn fetch_funding_history(&self, base_token: &str) -> Result<Vec<FundingHistoryPoint>, FetchError> {
        self.simulate_latency().await;
        if self.failing_history.contains(base_token) {
            return Err(FetchError::Api {
                exchange: self.exchange,
                message: "history unavailable".to_string(),
            });
        }
        Ok(self.history.get(base_token).cloned().unwrap_or_default())
    }

    async fn fetch_volume_24h(&self, base_token: &str) -> Result<f64, FetchError> {
        self.simulate_latency().await;
        self.volume
            .get(base_token)
            .copied()
            .ok_or(FetchError::Unsupported {
                exchange: self.exchange,
                capability: "24h volume",
            })
    }

    async fn fetch_depth(&self, base_token: &str, market: MarketKind) -> Result<OrderBookSnapshot, FetchError> {
        self.depth_calls.fetch_add(1, Ordering::Relaxed);
        let (bid, ask) = self
            .books
            .get(base_token)
            .copied()
            .ok_or_else(|| self.not_listed(base_token, market))?;
        Ok(OrderBookSnapshot::new(
            self.symbol(base_token, market),
            vec![PriceLevel { price: bid, quantity: 2.0 }],
            vec![PriceLevel { price: ask, quantity: 3.0 }],
            utils::now_ms(),
        ))
    }

    async fn contract_size(&self, _base_token: &str, _market: MarketKind) -> Result<f64, FetchError> {
        Ok(self.contract_size)
    }

    async fn fetch_account(&self) -> Result<AccountSnapshot, FetchError> {
        self.account
            .clone()
            .ok_or(FetchError::MissingCredentials(self.exchange))
    }
}

pub fn position(exchange: Exchange, side: Side, token: &str, size: f64, mark: f64, liq: f64) -> Position {
    Position {
        exchange,
        side,
        base_token: token.to_string(),
        size,
        mark_price: mark,
        liq_price: liq,
        avg_price: mark,
        funding_rate: 0.0001,
        unrealized_pnl: 0.0,
        stop_loss: None,
        take_profit: None,
    }
}

/// Settlement timestamps `hours_ago` hours before now.
pub fn hours_ago(hours_ago: i64) -> i64 {
    utils::now_ms() - hours_ago * HOUR_MS
}
