use thiserror::Error;

use crate::exchange::Exchange;

/// Failure of a single adapter call. Callers decide whether it excludes a pair
/// or only degrades a record.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{exchange} API error: {message}")]
    Api { exchange: Exchange, message: String },

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{exchange} returned no data for {symbol}")]
    NotListed { exchange: Exchange, symbol: String },

    #[error("{exchange} does not support {capability}")]
    Unsupported {
        exchange: Exchange,
        capability: &'static str,
    },

    #[error("Missing credentials for {0}")]
    MissingCredentials(Exchange),

    #[error("Failed to sign {0} request")]
    Signing(Exchange),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("Engine channel closed")]
    ChannelClosed,

    #[error("Engine task panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),

    #[error("Unknown exchange in configuration: {0}")]
    UnknownExchange(String),
}
