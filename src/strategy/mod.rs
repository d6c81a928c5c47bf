pub mod types;
pub mod rate_limiter;
pub mod aggregator;
pub mod selector;
pub mod normalizer;
pub mod risk;
pub mod accounts;
pub mod spread_poller;
pub mod worker;

#[cfg(test)]
mod tests;
