mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{hours_ago, position, MockAdapter};
use hedgescope::config::LeverageLimits;
use hedgescope::exchange::{AdapterSet, Exchange};
use hedgescope::strategy::types::{Side, SpotBalance};
use hedgescope::strategy::worker::{EngineHandle, EngineRequest, ResponseStatus, SignalEngine};
use serde_json::{json, Value};

fn market_adapters() -> AdapterSet {
    AdapterSet::new()
        .with(
            MockAdapter::new(Exchange::Binance)
                .with_funding("BTC", &[(hours_ago(16), -0.01), (hours_ago(8), -0.01)])
                .with_funding("ETH", &[(hours_ago(8), 0.0001)])
                .with_volume("BTC", 1.0e9)
                .into_arc(),
        )
        .with(
            MockAdapter::new(Exchange::Okx)
                .with_funding("BTC", &[(hours_ago(16), 0.02), (hours_ago(8), 0.03)])
                .with_funding("ETH", &[(hours_ago(8), 0.0001)])
                .into_arc(),
        )
}

async fn send(handle: &EngineHandle, request: Value) -> Value {
    let request: EngineRequest = serde_json::from_value(request).expect("valid request");
    let response = handle.request(request).await.expect("engine alive");
    serde_json::to_value(&response).expect("serializable response")
}

#[tokio::test]
async fn test_process_market_round_trip() {
    let handle = SignalEngine::new(market_adapters(), LeverageLimits::default()).spawn();

    let response = send(
        &handle,
        json!({"type": "PROCESS_MARKET", "tokens": ["btc", "ETH"], "exchanges": ["binance", "okx"], "weeks": 1}),
    )
    .await;

    assert_eq!(response["status"], "success");
    assert!(response.get("errorMessage").is_none());
    assert!(response["executionTime"].as_f64().expect("execution time") >= 0.0);

    // ETH funds identically on both venues and is not an opportunity.
    let data = response["data"].as_array().expect("opportunity list");
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["baseToken"], "BTC");
    assert_eq!(data[0]["buyExchange"], "binance");
    assert_eq!(data[0]["sellExchange"], "okx");
    assert!((data[0]["cumulativeApr"].as_f64().expect("apr") - 3.65).abs() < 1e-9);
    assert_eq!(data[0]["buyVol24h"], 1.0e9);
    assert_eq!(data[0]["sellVol24h"], 0.0);
}

#[tokio::test]
async fn test_funding_history_round_trip() {
    let handle = SignalEngine::new(market_adapters(), LeverageLimits::default()).spawn();

    let response = send(
        &handle,
        json!({"type": "FUNDING_HISTORY", "token": "BTC", "exchanges": ["okx", "binance"], "weeks": 1}),
    )
    .await;

    assert_eq!(response["status"], "success");
    let data = response["data"].as_array().expect("history list");
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["exchange"], "binance");
    assert_eq!(data[0]["symbol"], "BTCUSDT");
    assert_eq!(data[1]["exchange"], "okx");
    assert_eq!(data[1]["symbol"], "BTC-USDT-SWAP");
    assert_eq!(data[1]["history"].as_array().map(Vec::len), Some(2));
    assert!((data[1]["cumulative"].as_f64().expect("cumulative") - 0.05).abs() < 1e-12);
}

#[tokio::test]
async fn test_invalid_requests_return_error_responses() {
    let handle = SignalEngine::new(market_adapters(), LeverageLimits::default()).spawn();

    let response = send(
        &handle,
        json!({"type": "PROCESS_MARKET", "tokens": ["BTC"], "exchanges": ["binance", "ftx"], "weeks": 1}),
    )
    .await;
    assert_eq!(response["status"], "error");
    assert_eq!(response["errorMessage"], "Unknown exchange: ftx");
    assert!(response["data"].is_null());

    let response = send(
        &handle,
        json!({"type": "PROCESS_MARKET", "tokens": ["BTC"], "exchanges": ["binance"], "weeks": 0}),
    )
    .await;
    assert_eq!(response["status"], "error");

    let response = send(
        &handle,
        json!({"type": "FUNDING_HISTORY", "token": "", "exchanges": ["binance"], "weeks": 1}),
    )
    .await;
    assert_eq!(response["status"], "error");

    let response = send(&handle, json!({"type": "PROCESS_MARKET", "exchanges": ["binance"], "weeks": 1})).await;
    assert_eq!(response["status"], "error");
    assert_eq!(response["errorMessage"], "Invalid request: no tokens requested");

    // The engine keeps serving after failed requests.
    let response = send(
        &handle,
        json!({"type": "PROCESS_MARKET", "tokens": ["BTC"], "exchanges": ["binance", "okx"], "weeks": 1}),
    )
    .await;
    assert_eq!(response["status"], "success");
}

#[tokio::test]
async fn test_process_positions_builds_risk_report() {
    let adapters = AdapterSet::new()
        .with(
            MockAdapter::new(Exchange::Binance)
                .with_account(
                    vec![
                        position(Exchange::Binance, Side::Buy, "BTC", 10.0, 100.0, 50.0),
                        // No usable mark price.
                        position(Exchange::Binance, Side::Buy, "ETH", 5.0, 0.0, 0.0),
                    ],
                    vec![SpotBalance {
                        exchange: Exchange::Binance,
                        asset: "sol".to_string(),
                        amount: 40.0,
                    }],
                    1_000.0,
                )
                .into_arc(),
        )
        .with(
            MockAdapter::new(Exchange::Bybit)
                .with_account(
                    vec![
                        position(Exchange::Bybit, Side::Sell, "BTC", 10.0, 100.0, 150.0),
                        position(Exchange::Bybit, Side::Sell, "ETH", 5.0, 2_000.0, 3_000.0),
                    ],
                    Vec::new(),
                    2_000.0,
                )
                .into_arc(),
        )
        // Listed but without account access.
        .with(MockAdapter::new(Exchange::Okx).into_arc());

    let engine = SignalEngine::new(adapters, LeverageLimits::new(3.0).with_limit(Exchange::Binance, 1.5));
    let response = engine
        .handle(EngineRequest::ProcessPositions {
            exchanges: vec!["binance".to_string(), "bybit".to_string(), "okx".to_string()],
        })
        .await;
    assert_eq!(response.status, ResponseStatus::Success);

    let json = serde_json::to_value(&response).expect("serializable response");
    let tokens = json["data"]["tokens"].as_array().expect("token risk list");

    // The lone SOL spot balance carries no hedge and is dropped.
    assert_eq!(tokens.len(), 2);

    let btc = tokens.iter().find(|t| t["baseToken"] == "BTC").expect("BTC risk");
    assert_eq!(btc["spreadSize"], 0.0);
    assert_eq!(btc["needsRebalance"], false);
    assert_eq!(btc["premiumPct"], 0.0);
    assert_eq!(btc["nearestLiquidationBuy"]["exchange"], "binance");
    assert!((btc["nearestLiquidationBuy"]["distancePct"].as_f64().expect("distance") - 50.0).abs() < 1e-9);
    assert_eq!(btc["positions"].as_array().map(Vec::len), Some(2));

    let eth = tokens.iter().find(|t| t["baseToken"] == "ETH").expect("ETH risk");
    assert_eq!(eth["totalSizeBuy"], 0.0);
    assert_eq!(eth["totalSizeSell"], 5.0);
    assert_eq!(eth["needsRebalance"], true);
    assert!(eth["nearestLiquidationBuy"].is_null());

    let leverage = json["data"]["leverage"].as_array().expect("leverage list");
    assert_eq!(leverage.len(), 2);

    // Binance: 1000 notional on 1000 margin against a 1.5x limit.
    assert_eq!(leverage[0]["exchange"], "binance");
    assert_eq!(leverage[0]["currentLeverage"], 1.0);
    assert_eq!(leverage[0]["overLeveraged"], false);

    // Bybit: 1000 + 10000 notional on 2000 margin against the 3x default.
    assert_eq!(leverage[1]["exchange"], "bybit");
    assert_eq!(leverage[1]["currentLeverage"], 5.5);
    assert_eq!(leverage[1]["threshold"], 3.0);
    assert_eq!(leverage[1]["overLeveraged"], true);
}

#[tokio::test]
async fn test_dropped_request_does_not_stop_engine() {
    let handle = SignalEngine::new(market_adapters(), LeverageLimits::default()).spawn();

    let abandoned = tokio::time::timeout(
        Duration::ZERO,
        handle.request(EngineRequest::ProcessMarket {
            tokens: vec!["BTC".to_string()],
            exchanges: vec!["binance".to_string(), "okx".to_string()],
            weeks: 1.0,
        }),
    )
    .await;
    assert!(abandoned.is_err());

    let response = handle
        .request(EngineRequest::ProcessPositions {
            exchanges: vec!["binance".to_string()],
        })
        .await
        .expect("engine alive");
    assert!(response.is_success());
}

#[tokio::test]
async fn test_dropping_handle_abandons_request_in_flight() {
    let completed = Arc::new(AtomicUsize::new(0));
    let adapters = AdapterSet::new()
        .with(
            MockAdapter::new(Exchange::Binance)
                .with_funding("BTC", &[(hours_ago(8), -0.01)])
                .with_latency(Duration::from_millis(200), Arc::clone(&completed))
                .into_arc(),
        )
        .with(
            MockAdapter::new(Exchange::Okx)
                .with_funding("BTC", &[(hours_ago(8), 0.03)])
                .with_latency(Duration::from_millis(200), Arc::clone(&completed))
                .into_arc(),
        );
    let handle = SignalEngine::new(adapters, LeverageLimits::default()).spawn();

    let pending = tokio::time::timeout(
        Duration::from_millis(50),
        handle.request(EngineRequest::ProcessMarket {
            tokens: vec!["BTC".to_string()],
            exchanges: vec!["binance".to_string(), "okx".to_string()],
            weeks: 1.0,
        }),
    )
    .await;
    assert!(pending.is_err());

    drop(handle);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(completed.load(Ordering::SeqCst), 0);
}
