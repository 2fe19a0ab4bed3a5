//! Rate Limiter Module
//!
//! Per-endpoint request throttling shared by every bot in every session, so
//! concurrent sessions stay inside the provider's account-wide quota.
//! Respects Retry-After headers from providers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;

const WINDOW: Duration = Duration::from_secs(60);
const CIRCUIT_THRESHOLD: u32 = 5;
const CIRCUIT_RESET: Duration = Duration::from_secs(60);

/// Configuration for rate limiting
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per minute per endpoint
    pub requests_per_minute: u32,
    /// Maximum estimated tokens per minute per endpoint
    pub tokens_per_minute: u32,
    /// Requests allowed in flight at once, across all endpoints
    pub burst_size: u32,
    /// Longest a caller waits for a slot before giving up
    pub max_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            tokens_per_minute: 1_000_000,
            burst_size: 8,
            max_wait: Duration::from_secs(300),
        }
    }
}

impl RateLimitConfig {
    pub fn with_rpm(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute: requests_per_minute.max(1),
            ..Self::default()
        }
    }
}

/// Circuit breaker state for one endpoint
#[derive(Debug, Default)]
struct CircuitState {
    /// Currently blocked until (from Retry-After or backoff)
    blocked_until: Option<Instant>,
    consecutive_429s: u32,
    circuit_open: bool,
    circuit_reset_at: Option<Instant>,
}

/// Sliding-window usage for one endpoint
#[derive(Debug, Default)]
struct EndpointState {
    request_times: Vec<Instant>,
    token_usage: Vec<(Instant, u32)>,
    circuit: CircuitState,
}

impl EndpointState {
    fn cleanup_old_entries(&mut self) {
        let now = Instant::now();
        self.request_times.retain(|&t| now.duration_since(t) < WINDOW);
        self.token_usage
            .retain(|(t, _)| now.duration_since(*t) < WINDOW);
    }

    fn is_circuit_open(&mut self) -> bool {
        let circuit = &mut self.circuit;
        if !circuit.circuit_open {
            return false;
        }
        if let Some(reset_at) = circuit.circuit_reset_at {
            if Instant::now() >= reset_at {
                circuit.circuit_open = false;
                circuit.consecutive_429s = 0;
                circuit.circuit_reset_at = None;
                return false;
            }
        }
        true
    }

    fn record_rate_limit(&mut self, retry_after: Option<Duration>) {
        let circuit = &mut self.circuit;
        circuit.consecutive_429s += 1;

        // 5s, 10s, 20s, ... unless the provider said otherwise
        let block = retry_after.unwrap_or_else(|| {
            Duration::from_secs(5) * 2u32.pow(circuit.consecutive_429s.saturating_sub(1).min(4))
        });
        circuit.blocked_until = Some(Instant::now() + block);

        if circuit.consecutive_429s >= CIRCUIT_THRESHOLD {
            circuit.circuit_open = true;
            circuit.circuit_reset_at = Some(Instant::now() + CIRCUIT_RESET);
        }
    }

    fn record_request(&mut self, tokens: u32) {
        let now = Instant::now();
        self.request_times.push(now);
        self.token_usage.push((now, tokens));
    }

    fn current_rpm(&mut self) -> u32 {
        self.cleanup_old_entries();
        self.request_times.len() as u32
    }

    fn current_tpm(&mut self) -> u32 {
        self.cleanup_old_entries();
        self.token_usage.iter().map(|(_, t)| t).sum()
    }

    /// Time until the oldest request leaves the window
    fn window_wait(&self) -> Duration {
        self.request_times
            .first()
            .map(|t| WINDOW.saturating_sub(t.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    fn time_until_available(&self) -> Duration {
        let now = Instant::now();
        let circuit = &self.circuit;

        if let Some(blocked_until) = circuit.blocked_until {
            if now < blocked_until {
                return blocked_until - now;
            }
        }
        if circuit.circuit_open {
            if let Some(reset_at) = circuit.circuit_reset_at {
                if now < reset_at {
                    return reset_at - now;
                }
            }
        }
        Duration::ZERO
    }
}

/// Held while a request is in flight
#[derive(Debug)]
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

/// Rate limiter managing all endpoints
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    endpoints: Arc<Mutex<HashMap<String, EndpointState>>>,
    /// Limits concurrent in-flight requests (controls burst)
    in_flight: Arc<Semaphore>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let in_flight = Arc::new(Semaphore::new(config.burst_size.max(1) as usize));
        Self {
            config,
            endpoints: Arc::new(Mutex::new(HashMap::new())),
            in_flight,
        }
    }

    /// Check the endpoint's budget and record the request if it fits.
    ///
    /// Does not wait; the error carries how long to wait before asking again.
    fn try_acquire(&self, base_url: &str, estimated_tokens: u32) -> Result<(), RateLimitError> {
        let mut endpoints = self.endpoints.lock();
        let endpoint = endpoints.entry(base_url.to_string()).or_default();

        if endpoint.is_circuit_open() {
            return Err(RateLimitError::CircuitOpen {
                retry_after: endpoint.time_until_available(),
            });
        }

        let wait = endpoint.time_until_available();
        if wait > Duration::ZERO {
            return Err(RateLimitError::Blocked { retry_after: wait });
        }

        let current_rpm = endpoint.current_rpm();
        if current_rpm >= self.config.requests_per_minute {
            return Err(RateLimitError::RateLimitExceeded {
                resource: "requests",
                current: current_rpm,
                limit: self.config.requests_per_minute,
                retry_after: endpoint.window_wait(),
            });
        }

        let current_tpm = endpoint.current_tpm();
        if current_tpm > 0 && current_tpm + estimated_tokens > self.config.tokens_per_minute {
            return Err(RateLimitError::RateLimitExceeded {
                resource: "tokens",
                current: current_tpm,
                limit: self.config.tokens_per_minute,
                retry_after: endpoint.window_wait(),
            });
        }

        endpoint.record_request(estimated_tokens);
        Ok(())
    }

    /// Wait until the endpoint has room, then take an in-flight permit.
    pub async fn acquire(
        &self,
        base_url: &str,
        estimated_tokens: u32,
    ) -> Result<RatePermit, RateLimitError> {
        let started = Instant::now();
        loop {
            match self.try_acquire(base_url, estimated_tokens) {
                Ok(()) => break,
                Err(e) => {
                    let wait = e.retry_after().max(Duration::from_millis(50));
                    if started.elapsed() + wait > self.config.max_wait {
                        return Err(e);
                    }
                    tracing::debug!("Throttling {}: {}", base_url, e);
                    sleep(wait).await;
                }
            }
        }

        let permit = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RateLimitError::Closed)?;
        Ok(RatePermit { _permit: permit })
    }

    /// Record a 429 from the provider
    pub fn record_rate_limit_error(&self, base_url: &str, retry_after: Option<Duration>) {
        let mut endpoints = self.endpoints.lock();
        endpoints
            .entry(base_url.to_string())
            .or_default()
            .record_rate_limit(retry_after);
    }

    /// Reset the 429 streak after a successful call
    pub fn record_success(&self, base_url: &str) {
        let mut endpoints = self.endpoints.lock();
        if let Some(endpoint) = endpoints.get_mut(base_url) {
            endpoint.circuit.consecutive_429s = 0;
        }
    }

    /// Record actual usage when the estimate was too low
    pub fn record_usage(&self, base_url: &str, actual_tokens: u32, estimated_tokens: u32) {
        if actual_tokens > estimated_tokens {
            let mut endpoints = self.endpoints.lock();
            if let Some(endpoint) = endpoints.get_mut(base_url) {
                endpoint
                    .token_usage
                    .push((Instant::now(), actual_tokens - estimated_tokens));
            }
        }
    }

    /// Whether repeated 429s have opened the endpoint's circuit
    pub fn is_circuit_open(&self, base_url: &str) -> bool {
        self.endpoints
            .lock()
            .get_mut(base_url)
            .is_some_and(|endpoint| endpoint.is_circuit_open())
    }
}

/// Rate limit error types
#[derive(Error, Debug, Clone)]
pub enum RateLimitError {
    /// Rate limit exceeded (RPM or TPM)
    #[error("Rate limit exceeded for {resource} ({current}/{limit}), retry after {retry_after:?}")]
    RateLimitExceeded {
        resource: &'static str,
        current: u32,
        limit: u32,
        retry_after: Duration,
    },
    /// Blocked by Retry-After header or backoff
    #[error("Blocked by provider, retry after {retry_after:?}")]
    Blocked { retry_after: Duration },
    /// Circuit breaker is open
    #[error("Circuit breaker open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },
    /// Limiter shut down
    #[error("Rate limiter closed")]
    Closed,
}

impl RateLimitError {
    pub fn retry_after(&self) -> Duration {
        match self {
            RateLimitError::RateLimitExceeded { retry_after, .. }
            | RateLimitError::Blocked { retry_after }
            | RateLimitError::CircuitOpen { retry_after } => *retry_after,
            RateLimitError::Closed => Duration::ZERO,
        }
    }
}

impl From<RateLimitError> for crate::error::LabError {
    fn from(err: RateLimitError) -> Self {
        crate::error::LabError::RateLimited {
            retry_after: Some(err.retry_after()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://api.example.com/v1";

    #[test]
    fn test_rpm_limit() {
        let limiter = RateLimiter::new(RateLimitConfig::with_rpm(2));
        assert!(limiter.try_acquire(URL, 10).is_ok());
        assert!(limiter.try_acquire(URL, 10).is_ok());

        let err = limiter.try_acquire(URL, 10).unwrap_err();
        assert!(matches!(
            err,
            RateLimitError::RateLimitExceeded {
                resource: "requests",
                current: 2,
                limit: 2,
                ..
            }
        ));
        assert!(err.retry_after() > Duration::from_secs(50));

        // Other endpoints keep their own budget
        assert!(limiter.try_acquire("https://api.other.com", 10).is_ok());
    }

    #[test]
    fn test_token_limit() {
        let limiter = RateLimiter::new(RateLimitConfig {
            tokens_per_minute: 100,
            ..RateLimitConfig::default()
        });
        // A single oversized request is still let through
        assert!(limiter.try_acquire(URL, 150).is_ok());
        assert!(matches!(
            limiter.try_acquire(URL, 10),
            Err(RateLimitError::RateLimitExceeded {
                resource: "tokens",
                ..
            })
        ));
    }

    #[test]
    fn test_retry_after_blocks_endpoint() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        limiter.record_rate_limit_error(URL, Some(Duration::from_secs(30)));

        let err = limiter.try_acquire(URL, 1).unwrap_err();
        assert!(matches!(err, RateLimitError::Blocked { .. }));
        assert!(err.retry_after() <= Duration::from_secs(30));
        assert!(err.to_string().starts_with("Blocked by provider"));

        // A success resets the streak, so four more 429s do not open the circuit
        limiter.record_success(URL);
        for _ in 0..CIRCUIT_THRESHOLD - 1 {
            limiter.record_rate_limit_error(URL, Some(Duration::ZERO));
        }
        assert!(!limiter.is_circuit_open(URL));
    }

    #[test]
    fn test_circuit_opens_after_consecutive_429s() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        for _ in 0..CIRCUIT_THRESHOLD {
            limiter.record_rate_limit_error(URL, Some(Duration::ZERO));
        }
        assert!(limiter.is_circuit_open(URL));
        assert!(matches!(
            limiter.try_acquire(URL, 1),
            Err(RateLimitError::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_acquire_gives_up_after_max_wait() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 1,
            max_wait: Duration::from_millis(10),
            ..RateLimitConfig::default()
        });
        let _first = limiter.acquire(URL, 1).await.unwrap();
        assert!(limiter.acquire(URL, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_permits_are_shared_between_clones() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 1,
            ..RateLimitConfig::default()
        });
        let other = limiter.clone();

        let permit = limiter.acquire(URL, 1).await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(50), other.acquire(URL, 1)).await;
        assert!(waiting.is_err());

        drop(permit);
        assert!(other.acquire(URL, 1).await.is_ok());
    }
}
