//! Background signal engine.
//!
//! Callers talk to the engine through one request message in and one response
//! message out. The computation on the receiving side is a pure pipeline over
//! freshly fetched data, so nothing mutable is shared across the channel.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::LeverageLimits;
use crate::error::EngineError;
use crate::exchange::{AdapterSet, Exchange};
use crate::strategy::accounts::collect_accounts;
use crate::strategy::aggregator::FundingAggregator;
use crate::strategy::normalizer::PositionNormalizer;
use crate::strategy::risk::{RiskCalculator, RiskReport};
use crate::strategy::selector::ArbitrageSelector;
use crate::strategy::types::{ArbitrageOpportunity, ExchangePositions, FundingHistoryResult};
use crate::utils;

const REQUEST_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineRequest {
    ProcessMarket {
        #[serde(default)]
        tokens: Vec<String>,
        exchanges: Vec<String>,
        weeks: f64,
    },
    FundingHistory {
        token: String,
        exchanges: Vec<String>,
        weeks: f64,
    },
    ProcessPositions {
        exchanges: Vec<String>,
    },
}

impl EngineRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineRequest::ProcessMarket { .. } => "PROCESS_MARKET",
            EngineRequest::FundingHistory { .. } => "FUNDING_HISTORY",
            EngineRequest::ProcessPositions { .. } => "PROCESS_POSITIONS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ResponseData {
    Opportunities(Vec<ArbitrageOpportunity>),
    FundingHistory(Vec<FundingHistoryResult>),
    Risk(RiskReport),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineResponse {
    pub status: ResponseStatus,
    pub data: Option<ResponseData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Wall time spent on the request, in milliseconds.
    pub execution_time: f64,
}

impl EngineResponse {
    fn success(data: ResponseData, started: Instant) -> Self {
        Self {
            status: ResponseStatus::Success,
            data: Some(data),
            error_message: None,
            execution_time: elapsed_ms(started),
        }
    }

    fn error(error: &EngineError, started: Instant) -> Self {
        Self {
            status: ResponseStatus::Error,
            data: None,
            error_message: Some(error.to_string()),
            execution_time: elapsed_ms(started),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

struct EngineInner {
    adapters: AdapterSet,
    aggregator: FundingAggregator,
    leverage: LeverageLimits,
}

/// Funding-arbitrage and position-risk engine.
#[derive(Clone)]
pub struct SignalEngine {
    inner: Arc<EngineInner>,
}

impl SignalEngine {
    pub fn new(adapters: AdapterSet, leverage: LeverageLimits) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                aggregator: FundingAggregator::new(adapters.clone()),
                adapters,
                leverage,
            }),
        }
    }

    /// Run one request to completion. Failures, panics included, come back as
    /// an error response rather than propagating. The work runs on the caller's
    /// task, so dropping the returned future abandons it.
    pub async fn handle(&self, request: EngineRequest) -> EngineResponse {
        let started = Instant::now();
        let kind = request.kind();

        let outcome = match AssertUnwindSafe(self.process(request)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(EngineError::Panicked(panic_message(panic))),
        };

        match outcome {
            Ok(data) => {
                let response = EngineResponse::success(data, started);
                tracing::info!("[ENGINE] {} completed in {:.1}ms", kind, response.execution_time);
                response
            }
            Err(e) => {
                tracing::warn!("[ENGINE] {} failed: {}", kind, e);
                EngineResponse::error(&e, started)
            }
        }
    }

    pub async fn process(&self, request: EngineRequest) -> Result<ResponseData, EngineError> {
        match request {
            EngineRequest::ProcessMarket {
                tokens,
                exchanges,
                weeks,
            } => {
                let exchanges = parse_exchanges(&exchanges)?;
                validate_weeks(weeks)?;
                let tokens = parse_tokens(&tokens)?;

                let records = self.inner.aggregator.collect(&tokens, &exchanges).await;
                let opportunities = ArbitrageSelector::select(&records, weeks, utils::now_ms());
                Ok(ResponseData::Opportunities(opportunities))
            }
            EngineRequest::FundingHistory {
                token,
                exchanges,
                weeks,
            } => {
                let exchanges = parse_exchanges(&exchanges)?;
                validate_weeks(weeks)?;
                let tokens = parse_tokens(std::slice::from_ref(&token))?;

                let records = self.inner.aggregator.collect(&tokens, &exchanges).await;
                let history = ArbitrageSelector::funding_history(&records, weeks, utils::now_ms());
                Ok(ResponseData::FundingHistory(history))
            }
            EngineRequest::ProcessPositions { exchanges } => {
                let exchanges = parse_exchanges(&exchanges)?;
                Ok(ResponseData::Risk(self.risk_report(&exchanges).await))
            }
        }
    }

    async fn risk_report(&self, exchanges: &[Exchange]) -> RiskReport {
        let snapshots = collect_accounts(&self.inner.adapters, exchanges).await;

        let mut feeds = Vec::with_capacity(snapshots.len());
        let mut balances = Vec::new();
        let mut margins = HashMap::new();
        for snapshot in snapshots {
            margins.insert(snapshot.exchange, snapshot.margin_balance);
            balances.extend(snapshot.spot_balances);
            feeds.push(ExchangePositions {
                exchange: snapshot.exchange,
                positions: snapshot.positions,
            });
        }

        let groups = PositionNormalizer::normalize(&feeds, &balances, exchanges);
        let report = RiskReport {
            tokens: groups.iter().map(RiskCalculator::evaluate).collect(),
            leverage: RiskCalculator::leverage(&groups, &margins, &self.inner.leverage),
        };

        for status in report.leverage.iter().filter(|s| s.over_leveraged) {
            tracing::warn!(
                "[ENGINE] {} over-leveraged: {:.2}x > {:.2}x",
                status.exchange,
                status.current_leverage.unwrap_or(f64::NAN),
                status.threshold
            );
        }
        report
    }

    /// Move the engine onto a background task and return its request handle.
    pub fn spawn(self) -> EngineHandle {
        let (tx, mut rx) = mpsc::channel::<(EngineRequest, oneshot::Sender<EngineResponse>)>(REQUEST_QUEUE_CAPACITY);

        let task = tokio::spawn(async move {
            while let Some((request, reply)) = rx.recv().await {
                let response = self.handle(request).await;
                // Caller may have given up on this request.
                let _ = reply.send(response);
            }
            tracing::debug!("[ENGINE] Request channel closed, stopping");
        });

        EngineHandle { tx, task }
    }
}

/// Request side of a spawned [`SignalEngine`]. Dropping it tears the engine
/// down along with any request in flight.
pub struct EngineHandle {
    tx: mpsc::Sender<(EngineRequest, oneshot::Sender<EngineResponse>)>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    pub async fn request(&self, request: EngineRequest) -> Result<EngineResponse, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((request, reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn parse_exchanges(raw: &[String]) -> Result<Vec<Exchange>, EngineError> {
    let mut exchanges = Vec::with_capacity(raw.len());
    for name in raw {
        let exchange: Exchange = name
            .parse()
            .map_err(|_| EngineError::UnknownExchange(name.clone()))?;
        if !exchanges.contains(&exchange) {
            exchanges.push(exchange);
        }
    }
    if exchanges.is_empty() {
        return Err(EngineError::InvalidRequest("no exchanges selected".into()));
    }
    Ok(exchanges)
}

fn parse_tokens(raw: &[String]) -> Result<Vec<String>, EngineError> {
    let tokens = crate::config::parse_tokens(&raw.join(","));
    if tokens.is_empty() {
        return Err(EngineError::InvalidRequest("no tokens requested".into()));
    }
    Ok(tokens)
}

fn validate_weeks(weeks: f64) -> Result<(), EngineError> {
    if weeks.is_finite() && weeks > 0.0 {
        Ok(())
    } else {
        Err(EngineError::InvalidRequest(format!("weeks must be positive, got {}", weeks)))
    }
}
