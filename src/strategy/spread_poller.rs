//! Live open/close spread for one hedge pair, polled from both order books.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::EngineConfig;
use crate::error::{EngineError, FetchError};
use crate::exchange::{AdapterSet, Exchange, ExchangeAdapter};
use crate::strategy::types::{MarketKind, OrderBookSnapshot, PriceLevel};
use crate::utils::{percentage_change, signal};

/// Levels reported per side of each book.
const DEPTH_LEVELS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpreadConfig {
    pub base_token: String,
    pub buy_exchange: Exchange,
    pub sell_exchange: Exchange,
    pub market: MarketKind,
}

/// One depth level with its notional in quote currency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: f64,
    pub notional: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSide {
    pub exchange: Exchange,
    pub contract_size: f64,
    pub updated: i64,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpreadSnapshot {
    pub base_token: String,
    pub market: MarketKind,
    /// Percent captured opening the hedge now: sell at the sell leg's bid, buy at the buy leg's ask.
    pub open_spread: Option<f64>,
    /// Percent captured closing the hedge now: sell the long at its bid, buy back the short at its ask.
    pub close_spread: Option<f64>,
    pub buy: BookSide,
    pub sell: BookSide,
    pub sync_gap_ms: i64,
    pub stale: bool,
}

fn scaled_levels(levels: &[PriceLevel], contract_size: f64) -> Vec<DepthLevel> {
    levels
        .iter()
        .take(DEPTH_LEVELS)
        .map(|l| DepthLevel {
            price: l.price,
            quantity: l.quantity,
            notional: l.price * l.quantity * contract_size,
        })
        .collect()
}

fn book_side(exchange: Exchange, book: &OrderBookSnapshot, contract_size: f64) -> BookSide {
    BookSide {
        exchange,
        contract_size,
        updated: book.updated,
        bids: scaled_levels(&book.bids, contract_size),
        asks: scaled_levels(&book.asks, contract_size),
    }
}

/// Spread math over two books. Missing top-of-book levels give `None` spreads.
pub fn compute_spread(
    config: &SpreadConfig,
    buy_book: &OrderBookSnapshot,
    sell_book: &OrderBookSnapshot,
    buy_contract_size: f64,
    sell_contract_size: f64,
    sync_gap_warn_ms: i64,
) -> SpreadSnapshot {
    let open_spread = match (sell_book.best_bid(), buy_book.best_ask()) {
        (Some(sell_bid), Some(buy_ask)) => signal(percentage_change(buy_ask.price, sell_bid.price)),
        _ => None,
    };
    let close_spread = match (buy_book.best_bid(), sell_book.best_ask()) {
        (Some(buy_bid), Some(sell_ask)) => signal(percentage_change(sell_ask.price, buy_bid.price)),
        _ => None,
    };
    let sync_gap_ms = (buy_book.updated - sell_book.updated).abs();

    SpreadSnapshot {
        base_token: config.base_token.clone(),
        market: config.market,
        open_spread,
        close_spread,
        buy: book_side(config.buy_exchange, buy_book, buy_contract_size),
        sell: book_side(config.sell_exchange, sell_book, sell_contract_size),
        sync_gap_ms,
        stale: sync_gap_ms > sync_gap_warn_ms,
    }
}

/// Periodic spread poller with an explicit stop handle.
///
/// Each [`start`](Self::start) bumps a generation counter; a running loop
/// exits as soon as it notices a newer generation, and responses for another
/// symbol are dropped, so books from different configurations never mix.
pub struct LiveSpreadPoller {
    adapters: AdapterSet,
    interval: Duration,
    sync_gap_warn_ms: i64,
    generation: Arc<AtomicU64>,
    tx: Arc<watch::Sender<Option<SpreadSnapshot>>>,
    task: Option<JoinHandle<()>>,
    active: Option<SpreadConfig>,
}

impl LiveSpreadPoller {
    pub fn new(adapters: AdapterSet, interval: Duration, sync_gap_warn_ms: i64) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            adapters,
            interval,
            sync_gap_warn_ms,
            generation: Arc::new(AtomicU64::new(0)),
            tx: Arc::new(tx),
            task: None,
            active: None,
        }
    }

    pub fn from_config(adapters: AdapterSet, config: &EngineConfig) -> Self {
        Self::new(adapters, config.spread_poll_interval, config.sync_gap_warn_ms)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SpreadSnapshot>> {
        self.tx.subscribe()
    }

    pub fn active(&self) -> Option<&SpreadConfig> {
        self.active.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start polling `config`, replacing whatever ran before. Subscribers see
    /// `None` until the first snapshot of the new configuration arrives.
    pub fn start(&mut self, config: SpreadConfig) -> Result<(), EngineError> {
        let buy = self
            .adapters
            .get(config.buy_exchange)
            .ok_or_else(|| EngineError::UnknownExchange(config.buy_exchange.to_string()))?;
        let sell = self
            .adapters
            .get(config.sell_exchange)
            .ok_or_else(|| EngineError::UnknownExchange(config.sell_exchange.to_string()))?;

        self.stop();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.tx.send_replace(None);

        tracing::info!(
            "[POLLER] Polling {} {:?}: buy {} / sell {} every {:?}",
            config.base_token,
            config.market,
            config.buy_exchange,
            config.sell_exchange,
            self.interval
        );

        let run = PollLoop {
            buy,
            sell,
            config: config.clone(),
            generation,
            current: Arc::clone(&self.generation),
            interval: self.interval,
            sync_gap_warn_ms: self.sync_gap_warn_ms,
            tx: Arc::clone(&self.tx),
        };
        self.task = Some(tokio::spawn(run.run()));
        self.active = Some(config);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.active = None;
    }
}

impl Drop for LiveSpreadPoller {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct PollLoop {
    buy: Arc<dyn ExchangeAdapter>,
    sell: Arc<dyn ExchangeAdapter>,
    config: SpreadConfig,
    generation: u64,
    current: Arc<AtomicU64>,
    interval: Duration,
    sync_gap_warn_ms: i64,
    tx: Arc<watch::Sender<Option<SpreadSnapshot>>>,
}

impl PollLoop {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::Acquire) == self.generation
    }

    async fn run(self) {
        let token = self.config.base_token.as_str();
        let market = self.config.market;

        let (buy_size, sell_size) = tokio::join!(
            self.buy.contract_size(token, market),
            self.sell.contract_size(token, market)
        );
        let buy_size = contract_size_or_unit(self.config.buy_exchange, buy_size);
        let sell_size = contract_size_or_unit(self.config.sell_exchange, sell_size);

        let buy_symbol = self.buy.symbol(token, market);
        let sell_symbol = self.sell.symbol(token, market);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_buy: Option<OrderBookSnapshot> = None;
        let mut last_sell: Option<OrderBookSnapshot> = None;
        let mut was_stale = false;

        loop {
            ticker.tick().await;
            if !self.is_current() {
                break;
            }

            let (buy_book, sell_book) = tokio::join!(
                self.buy.fetch_depth(token, market),
                self.sell.fetch_depth(token, market)
            );

            // Reconfigured while the requests were in flight.
            if !self.is_current() {
                break;
            }

            accept_book(&mut last_buy, buy_book, self.config.buy_exchange, &buy_symbol);
            accept_book(&mut last_sell, sell_book, self.config.sell_exchange, &sell_symbol);

            let (Some(buy_book), Some(sell_book)) = (&last_buy, &last_sell) else {
                continue;
            };

            let snapshot = compute_spread(
                &self.config,
                buy_book,
                sell_book,
                buy_size,
                sell_size,
                self.sync_gap_warn_ms,
            );

            if snapshot.stale && !was_stale {
                tracing::warn!(
                    "[POLLER] {} books out of sync by {}ms ({} vs {})",
                    token,
                    snapshot.sync_gap_ms,
                    self.config.buy_exchange,
                    self.config.sell_exchange
                );
            }
            was_stale = snapshot.stale;

            self.tx.send_replace(Some(snapshot));
        }

        tracing::debug!("[POLLER] Generation {} stopped", self.generation);
    }
}

fn contract_size_or_unit(exchange: Exchange, result: Result<f64, FetchError>) -> f64 {
    match result {
        Ok(size) if size.is_finite() && size > 0.0 => size,
        Ok(size) => {
            tracing::warn!("[POLLER] {} reported contract size {}, using 1", exchange, size);
            1.0
        }
        Err(e) => {
            tracing::warn!("[POLLER] {} contract size unavailable ({}), using 1", exchange, e);
            1.0
        }
    }
}

/// Keep the latest book only when it belongs to the expected symbol.
fn accept_book(
    slot: &mut Option<OrderBookSnapshot>,
    result: Result<OrderBookSnapshot, FetchError>,
    exchange: Exchange,
    expected_symbol: &str,
) {
    match result {
        Ok(book) if book.symbol.eq_ignore_ascii_case(expected_symbol) => *slot = Some(book),
        Ok(book) => tracing::debug!(
            "[POLLER] Dropping {} book for {} (expected {})",
            exchange,
            book.symbol,
            expected_symbol
        ),
        Err(e) => tracing::debug!("[POLLER] {} depth failed: {}", exchange, e),
    }
}
