use std::collections::HashMap;
use std::time::Duration;

use crate::error::ConfigError;
use crate::exchange::Exchange;

/// Over-leverage threshold used when an exchange has no explicit override.
pub const DEFAULT_MAX_LEVERAGE: f64 = 5.0;
pub const DEFAULT_LOOKBACK_WEEKS: f64 = 4.0;
pub const DEFAULT_SPREAD_POLL_MS: u64 = 150;
pub const DEFAULT_SYNC_GAP_WARN_MS: i64 = 1_000;

#[derive(Debug, Clone)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CredentialsConfig {
    pub binance: Option<ExchangeCredentials>,
    pub bybit: Option<ExchangeCredentials>,
    pub okx: Option<ExchangeCredentials>,
    /// Hyperliquid account state is public by wallet address.
    pub hyperliquid_address: Option<String>,
}

impl CredentialsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let okx = load_exchange_creds("OKX")?;
        if let Some(creds) = &okx {
            if creds.passphrase.is_none() {
                return Err(ConfigError::Invalid("OKX_PASSPHRASE is required with OKX credentials".into()));
            }
        }

        Ok(Self {
            binance: load_exchange_creds("BINANCE")?,
            bybit: load_exchange_creds("BYBIT")?,
            okx,
            hyperliquid_address: std::env::var("HYPERLIQUID_ADDRESS")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        })
    }

    pub fn has_any_configured(&self) -> bool {
        self.binance.is_some() || self.bybit.is_some() || self.okx.is_some() || self.hyperliquid_address.is_some()
    }
}

fn load_exchange_creds(prefix: &str) -> Result<Option<ExchangeCredentials>, ConfigError> {
    let api_key = std::env::var(format!("{}_API_KEY", prefix)).ok();
    let api_secret = std::env::var(format!("{}_API_SECRET", prefix)).ok();
    let passphrase = std::env::var(format!("{}_PASSPHRASE", prefix)).ok();

    match (api_key, api_secret) {
        (Some(key), Some(secret)) => Ok(Some(ExchangeCredentials {
            api_key: key,
            api_secret: secret,
            passphrase,
        })),
        (None, None) => Ok(None),
        _ => Err(ConfigError::Invalid(format!(
            "Incomplete credentials for {}: both API_KEY and API_SECRET required",
            prefix
        ))),
    }
}

/// Per-exchange over-leverage thresholds.
#[derive(Debug, Clone)]
pub struct LeverageLimits {
    default: f64,
    per_exchange: HashMap<Exchange, f64>,
}

impl LeverageLimits {
    pub fn new(default: f64) -> Self {
        Self {
            default,
            per_exchange: HashMap::new(),
        }
    }

    pub fn with_limit(mut self, exchange: Exchange, limit: f64) -> Self {
        self.per_exchange.insert(exchange, limit);
        self
    }

    pub fn threshold(&self, exchange: Exchange) -> f64 {
        self.per_exchange.get(&exchange).copied().unwrap_or(self.default)
    }

    /// `DEFAULT_MAX_LEVERAGE` plus `MAX_LEVERAGE_<EXCHANGE>` overrides.
    pub fn from_env() -> Self {
        let default = env_parse("DEFAULT_MAX_LEVERAGE", DEFAULT_MAX_LEVERAGE);
        let mut limits = Self::new(default);
        for exchange in Exchange::ALL {
            let key = format!("MAX_LEVERAGE_{}", exchange.as_str().to_uppercase());
            if let Some(limit) = std::env::var(key).ok().and_then(|s| s.parse::<f64>().ok()) {
                limits.per_exchange.insert(exchange, limit);
            }
        }
        limits
    }
}

impl Default for LeverageLimits {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LEVERAGE)
    }
}

/// Engine inputs. Selected exchanges and lookback window are owned by the
/// caller; the engine only reads them.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub exchanges: Vec<Exchange>,
    pub tokens: Vec<String>,
    pub lookback_weeks: f64,
    pub spread_poll_interval: Duration,
    pub sync_gap_warn_ms: i64,
    pub leverage: LeverageLimits,
    pub credentials: CredentialsConfig,
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let exchanges = match std::env::var("SELECTED_EXCHANGES") {
            Ok(raw) => parse_exchanges(&raw)?,
            Err(_) => Exchange::ALL.to_vec(),
        };

        let tokens = std::env::var("TOKENS")
            .ok()
            .map(|s| parse_tokens(&s))
            .unwrap_or_else(|| vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()]);

        let config = Self {
            exchanges,
            tokens,
            lookback_weeks: env_parse("LOOKBACK_WEEKS", DEFAULT_LOOKBACK_WEEKS),
            spread_poll_interval: Duration::from_millis(env_parse("SPREAD_POLL_MS", DEFAULT_SPREAD_POLL_MS)),
            sync_gap_warn_ms: env_parse("SYNC_GAP_WARN_MS", DEFAULT_SYNC_GAP_WARN_MS),
            leverage: LeverageLimits::from_env(),
            credentials: CredentialsConfig::from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exchanges.is_empty() {
            return Err(ConfigError::Invalid("at least one exchange must be selected".into()));
        }

        if self.tokens.is_empty() {
            return Err(ConfigError::Invalid("tokens cannot be empty".into()));
        }

        if !(self.lookback_weeks.is_finite() && self.lookback_weeks > 0.0) {
            return Err(ConfigError::Invalid("lookback_weeks must be greater than 0".into()));
        }

        if self.spread_poll_interval.is_zero() {
            return Err(ConfigError::Invalid("spread poll interval must be greater than 0".into()));
        }

        if self.sync_gap_warn_ms <= 0 {
            return Err(ConfigError::Invalid("sync_gap_warn_ms must be greater than 0".into()));
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            exchanges: Exchange::ALL.to_vec(),
            tokens: vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()],
            lookback_weeks: DEFAULT_LOOKBACK_WEEKS,
            spread_poll_interval: Duration::from_millis(DEFAULT_SPREAD_POLL_MS),
            sync_gap_warn_ms: DEFAULT_SYNC_GAP_WARN_MS,
            leverage: LeverageLimits::default(),
            credentials: CredentialsConfig::default(),
        }
    }
}

/// Comma-separated exchange list; duplicates collapse, order is kept.
pub fn parse_exchanges(raw: &str) -> Result<Vec<Exchange>, ConfigError> {
    let mut out = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let exchange: Exchange = part.parse()?;
        if !out.contains(&exchange) {
            out.push(exchange);
        }
    }
    Ok(out)
}

/// Comma-separated base tokens, upper-cased and de-duplicated.
pub fn parse_tokens(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for token in raw.split(',').map(|t| t.trim().to_uppercase()).filter(|t| !t.is_empty()) {
        if !out.contains(&token) {
            out.push(token);
        }
    }
    out
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}
