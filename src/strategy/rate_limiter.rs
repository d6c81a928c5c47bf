use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Token-bucket limiter shared by every request an adapter makes.
#[derive(Clone)]
pub struct RateLimiter {
    label: &'static str,
    state: Arc<Mutex<RateLimiterState>>,
    requests_per_second: u32,
    burst_capacity: u32,
}

struct RateLimiterState {
    tokens: u32,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(label: &'static str, requests_per_second: u32, burst_capacity: u32) -> Self {
        let requests_per_second = requests_per_second.max(1);
        Self {
            label,
            state: Arc::new(Mutex::new(RateLimiterState {
                tokens: burst_capacity.max(1),
                last_refill: Instant::now(),
            })),
            requests_per_second,
            burst_capacity: burst_capacity.max(1),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_refill);
            let tokens_to_add = (elapsed.as_secs_f64() * self.requests_per_second as f64) as u32;

            if tokens_to_add > 0 {
                state.tokens = (state.tokens + tokens_to_add).min(self.burst_capacity);
                state.last_refill = now;
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let wait_time = Duration::from_secs_f64(1.0 / self.requests_per_second as f64);
            drop(state);
            tracing::debug!(
                "[RATE LIMITER] {} limit reached ({}/s), waiting {:?}",
                self.label,
                self.requests_per_second,
                wait_time
            );
            tokio::time::sleep(wait_time).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_served_then_bucket_empties() {
        let limiter = RateLimiter::new("test", 10, 3);
        tokio::time::timeout(Duration::from_millis(50), async {
            for _ in 0..3 {
                limiter.acquire().await;
            }
        })
        .await
        .expect("burst served without waiting");

        // Bucket is empty; the next token arrives after 100ms.
        assert!(tokio::time::timeout(Duration::from_millis(20), limiter.acquire())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_waits_for_refill_when_empty() {
        let limiter = RateLimiter::new("test", 1_000, 1);
        limiter.acquire().await;
        // Second call sleeps until a token is refilled.
        tokio::time::timeout(Duration::from_secs(5), limiter.acquire())
            .await
            .expect("limiter should refill");
    }
}
