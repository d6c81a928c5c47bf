use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use sha2::Sha256;
use tracing_subscriber::{fmt, EnvFilter};

type HmacSha256 = Hmac<Sha256>;

pub fn ts_hm() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

/// Wall clock in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Start of the next full hour in epoch milliseconds.
pub fn next_hour_ms(now_ms: i64) -> i64 {
    const HOUR_MS: i64 = 3_600_000;
    (now_ms / HOUR_MS + 1) * HOUR_MS
}

/// Initialize `tracing` subscriber with env-based filter.
///
/// If `RUST_LOG` is not set, defaults to `info` level.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Percentage move from `a` to `b`: `(b / a) * 100 - 100`.
///
/// `a == 0` yields `Infinity` or `NaN`; callers treat non-finite values as
/// "no signal".
#[inline(always)]
pub fn percentage_change(a: f64, b: f64) -> f64 {
    (b / a) * 100.0 - 100.0
}

/// Non-finite values carry no signal.
#[inline(always)]
pub fn signal(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// Round to `digits` significant digits.
pub fn round_significant(value: f64, digits: i32) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }
    let magnitude = value.abs().log10().floor() as i32;
    let scale = 10f64.powi(digits - 1 - magnitude);
    if !scale.is_finite() || scale == 0.0 {
        return value;
    }
    (value * scale).round() / scale
}

/// Parse a JSON number or numeric string. Exchanges disagree on which one
/// they send.
pub fn value_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.is_empty() => Some(f64::NAN),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn value_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Serde helper for numeric fields sent as strings. Empty strings and nulls
/// decode as NaN.
pub fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    if raw.is_null() {
        return Ok(f64::NAN);
    }
    value_f64(&raw).ok_or_else(|| serde::de::Error::custom(format!("expected number, got {}", raw)))
}

pub fn de_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    value_i64(&raw).ok_or_else(|| serde::de::Error::custom(format!("expected integer, got {}", raw)))
}

/// Optional epoch timestamp. Empty strings and nulls decode as `None`.
pub fn de_opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    match &raw {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        _ => value_i64(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("expected integer, got {}", raw))),
    }
}

/// Raw HMAC-SHA256 of `message` keyed by `secret`.
pub fn hmac_sha256(secret: &str, message: &str) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(message.as_bytes());
    Some(mac.finalize().into_bytes().to_vec())
}
