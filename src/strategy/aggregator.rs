use std::sync::Arc;

use tokio::task::JoinSet;

use crate::config;
use crate::exchange::{AdapterSet, Exchange, ExchangeAdapter};
use crate::strategy::types::{FundingRecord, MarketKind};

/// Fans out funding probes across every (token, exchange) pair.
pub struct FundingAggregator {
    adapters: AdapterSet,
}

impl FundingAggregator {
    pub fn new(adapters: AdapterSet) -> Self {
        Self { adapters }
    }

    /// Collect one [`FundingRecord`] per listed, reachable pair.
    ///
    /// A pair whose current-rate probe fails is left out. History and volume
    /// failures only degrade the record. Output order is unspecified.
    ///
    /// # Arguments
    /// * `tokens` - Base tokens (`BTC`, `ETH`); case and duplicates are normalized
    /// * `exchanges` - Exchanges to query; those without an adapter are skipped
    pub async fn collect(&self, tokens: &[String], exchanges: &[Exchange]) -> Vec<FundingRecord> {
        let tokens = config::parse_tokens(&tokens.join(","));

        let mut adapters: Vec<Arc<dyn ExchangeAdapter>> = Vec::with_capacity(exchanges.len());
        for &exchange in exchanges {
            if adapters.iter().any(|a| a.exchange() == exchange) {
                continue;
            }
            match self.adapters.get(exchange) {
                Some(adapter) => adapters.push(adapter),
                None => tracing::warn!("[AGGREGATOR] No adapter configured for {}, skipping", exchange),
            }
        }

        let mut tasks = JoinSet::new();
        for token in &tokens {
            for adapter in &adapters {
                tasks.spawn(fetch_record(Arc::clone(adapter), token.clone()));
            }
        }

        let pairs = tasks.len();
        let mut records = Vec::with_capacity(pairs);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!("[AGGREGATOR] Pair task failed: {}", e),
            }
        }

        tracing::info!(
            "[AGGREGATOR] {} records from {} pairs ({} tokens x {} exchanges)",
            records.len(),
            pairs,
            tokens.len(),
            adapters.len()
        );
        records
    }
}

async fn fetch_record(adapter: Arc<dyn ExchangeAdapter>, token: String) -> Option<FundingRecord> {
    let exchange = adapter.exchange();

    let current = match adapter.fetch_funding_rate(&token).await {
        Ok(rate) => rate,
        Err(e) => {
            tracing::debug!("[AGGREGATOR] {} {} not available: {}", exchange, token, e);
            return None;
        }
    };

    let (history, volume) = tokio::join!(
        adapter.fetch_funding_history(&token),
        adapter.fetch_volume_24h(&token)
    );

    let history = match history {
        Ok(mut points) => {
            points.sort_by_key(|p| p.funding_time);
            points
        }
        Err(e) => {
            tracing::warn!("[AGGREGATOR] {} {} funding history failed: {}", exchange, token, e);
            Vec::new()
        }
    };

    let vol24h = match volume {
        Ok(v) if v.is_finite() => v,
        Ok(_) => 0.0,
        Err(e) => {
            tracing::warn!("[AGGREGATOR] {} {} 24h volume failed: {}", exchange, token, e);
            0.0
        }
    };

    Some(FundingRecord {
        exchange,
        symbol: adapter.symbol(&token, MarketKind::Perpetual),
        base_token: token,
        current_rate: current.rate,
        next_funding_time: current.next_funding_time,
        interval: current.interval,
        vol24h,
        history,
    })
}
