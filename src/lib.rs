pub mod config;
pub mod error;
pub mod exchange;
pub mod strategy;
pub mod utils;

// Exchange connectors, exported for the binaries
pub mod binance;
pub mod bitget;
pub mod bybit;
pub mod gateio;
pub mod hyperliquid;
pub mod okx;
