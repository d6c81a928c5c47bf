use std::time::Duration;

use anyhow::Context;

use hedgescope::config::EngineConfig;
use hedgescope::exchange::{AdapterSet, Exchange};
use hedgescope::strategy::risk::RiskReport;
use hedgescope::strategy::types::ArbitrageOpportunity;
use hedgescope::strategy::worker::{EngineHandle, EngineRequest, ResponseData, SignalEngine};
use hedgescope::utils;

/// Upper bound on one engine round trip before the scan gives up.
const REQUEST_TIMEOUT_SECS: u64 = 60;
const TOP_OPPORTUNITIES: usize = 20;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    utils::init_logging();

    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    let adapters = AdapterSet::live(&config).context("failed to build exchange adapters")?;
    let engine = SignalEngine::new(adapters, config.leverage.clone()).spawn();

    tracing::info!(
        "Scanning {} tokens on {} exchanges over {} weeks",
        config.tokens.len(),
        config.exchanges.len(),
        config.lookback_weeks
    );

    let exchanges: Vec<String> = config.exchanges.iter().map(|e| e.as_str().to_string()).collect();

    let market = EngineRequest::ProcessMarket {
        tokens: config.tokens.clone(),
        exchanges: exchanges.clone(),
        weeks: config.lookback_weeks,
    };
    match run(&engine, market).await? {
        Some(ResponseData::Opportunities(opportunities)) => log_opportunities(&opportunities),
        Some(_) => tracing::warn!("[ENGINE] Unexpected payload for PROCESS_MARKET"),
        None => {}
    }

    if config.credentials.has_any_configured() {
        let positions = EngineRequest::ProcessPositions { exchanges };
        match run(&engine, positions).await? {
            Some(ResponseData::Risk(report)) => log_risk(&report),
            Some(_) => tracing::warn!("[ENGINE] Unexpected payload for PROCESS_POSITIONS"),
            None => {}
        }
    } else {
        tracing::info!("No exchange credentials configured, skipping position risk");
    }

    Ok(())
}

/// Send one request and unwrap a successful payload. Error responses are
/// logged and yield `None`; a dead engine or a timeout is fatal.
async fn run(engine: &EngineHandle, request: EngineRequest) -> anyhow::Result<Option<ResponseData>> {
    let kind = request.kind();
    let response = tokio::time::timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS), engine.request(request))
        .await
        .with_context(|| format!("{} timed out after {}s", kind, REQUEST_TIMEOUT_SECS))??;

    if response.is_success() {
        Ok(response.data)
    } else {
        tracing::error!(
            "{} failed: {}",
            kind,
            response.error_message.as_deref().unwrap_or("unknown error")
        );
        Ok(None)
    }
}

fn log_opportunities(opportunities: &[ArbitrageOpportunity]) {
    if opportunities.is_empty() {
        tracing::info!("No positive funding differentials found");
        return;
    }

    tracing::info!("{} opportunities, top {} by APR:", opportunities.len(), TOP_OPPORTUNITIES.min(opportunities.len()));
    for opp in opportunities.iter().take(TOP_OPPORTUNITIES) {
        tracing::info!(
            token = %opp.base_token,
            buy = %opp.buy_exchange,
            sell = %opp.sell_exchange,
            "{:<8} long {:<11} short {:<11} diff {:+.4}% APR {:.2}%",
            opp.base_token,
            opp.buy_exchange,
            opp.sell_exchange,
            opp.cumulative_diff * 100.0,
            opp.cumulative_apr * 100.0
        );
    }
}

fn log_risk(report: &RiskReport) {
    if report.tokens.is_empty() {
        tracing::info!("No hedged positions open");
    }

    for token in &report.tokens {
        let nearest = token
            .nearest_liquidation_buy
            .into_iter()
            .chain(token.nearest_liquidation_sell)
            .fold(None, |best: Option<(Exchange, f64)>, n| match best {
                Some((_, d)) if d <= n.distance_pct => best,
                _ => Some((n.exchange, n.distance_pct)),
            });

        tracing::info!(
            "{:<8} long {:.4} short {:.4} spread {:.4}{} funding {:+.2} liq {}",
            token.base_token,
            token.total_size_buy,
            token.total_size_sell,
            token.spread_size,
            if token.needs_rebalance { " (rebalance)" } else { "" },
            token.estimated_funding_fee,
            match nearest {
                Some((exchange, distance)) => format!("{:.1}% on {}", distance, exchange),
                None => "n/a".to_string(),
            }
        );
    }

    for status in &report.leverage {
        match status.current_leverage {
            Some(leverage) if status.over_leveraged => tracing::warn!(
                "{} leverage {:.2}x exceeds {:.2}x",
                status.exchange,
                leverage,
                status.threshold
            ),
            Some(leverage) => tracing::info!("{} leverage {:.2}x", status.exchange, leverage),
            None => tracing::info!("{} leverage unknown (no margin balance)", status.exchange),
        }
    }
}
