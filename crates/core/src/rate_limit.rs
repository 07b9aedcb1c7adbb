//! Per-host rate limiting for the SSH command executor.
//!
//! Three independent caps, all scoped per `host_id`: a 60/minute sliding
//! window, a 600/hour sliding window, and a concurrency cap of 10 in-flight
//! commands enforced with a semaphore. Hand-rolled rather than pulled from a
//! crate — this module hand-rolls its backoff/jitter logic
//! rather than reaching for a crate, and this is the same call: the shape is
//! narrow enough that a dependency would buy nothing.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use std::sync::Arc;

const PER_MINUTE_CAP: usize = 60;
const PER_HOUR_CAP: usize = 600;
const MAX_CONCURRENT_PER_HOST: usize = 10;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    Admitted,
    Rejected(String),
}

struct SlidingWindows {
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
}

impl SlidingWindows {
    fn new() -> Self {
        Self {
            minute: VecDeque::new(),
            hour: VecDeque::new(),
        }
    }

    fn admit(&mut self, now: Instant) -> RateLimitResult {
        while let Some(&front) = self.minute.front() {
            if now.duration_since(front) > MINUTE {
                self.minute.pop_front();
            } else {
                break;
            }
        }
        while let Some(&front) = self.hour.front() {
            if now.duration_since(front) > HOUR {
                self.hour.pop_front();
            } else {
                break;
            }
        }

        if self.minute.len() >= PER_MINUTE_CAP {
            return RateLimitResult::Rejected(format!(
                "{PER_MINUTE_CAP} commands/minute cap reached"
            ));
        }
        if self.hour.len() >= PER_HOUR_CAP {
            return RateLimitResult::Rejected(format!("{PER_HOUR_CAP} commands/hour cap reached"));
        }

        self.minute.push_back(now);
        self.hour.push_back(now);
        RateLimitResult::Admitted
    }
}

struct HostLimiter {
    windows: Mutex<SlidingWindows>,
    concurrency: Arc<Semaphore>,
}

impl HostLimiter {
    fn new() -> Self {
        Self {
            windows: Mutex::new(SlidingWindows::new()),
            concurrency: Arc::new(Semaphore::new(MAX_CONCURRENT_PER_HOST)),
        }
    }
}

/// Registry of per-host limiters, keyed by `host_id`. Shared by every call
/// into `SshExecutor::run` for the lifetime of the process.
pub struct RateLimitRegistry {
    hosts: Mutex<HashMap<String, Arc<HostLimiter>>>,
}

impl RateLimitRegistry {
    pub fn new() -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
        }
    }

    fn limiter_for(&self, host_id: &str) -> Arc<HostLimiter> {
        let mut hosts = self.hosts.lock().unwrap();
        hosts
            .entry(host_id.to_string())
            .or_insert_with(|| Arc::new(HostLimiter::new()))
            .clone()
    }

    /// Check (and, if admitted, consume) one slot of the minute/hour windows.
    pub fn acquire(&self, host_id: &str) -> RateLimitResult {
        let limiter = self.limiter_for(host_id);
        let mut windows = limiter.windows.lock().unwrap();
        windows.admit(Instant::now())
    }

    /// Await a concurrency slot for `host_id`. Released when the returned
    /// permit is dropped.
    pub async fn acquire_concurrency(&self, host_id: &str) -> OwnedSemaphorePermit {
        let limiter = self.limiter_for(host_id);
        limiter
            .concurrency
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed")
    }
}

impl Default for RateLimitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_per_minute_cap() {
        let mut windows = SlidingWindows::new();
        let now = Instant::now();
        for _ in 0..PER_MINUTE_CAP {
            assert_eq!(windows.admit(now), RateLimitResult::Admitted);
        }
        match windows.admit(now) {
            RateLimitResult::Rejected(reason) => assert!(reason.contains("minute")),
            RateLimitResult::Admitted => panic!("should have been rejected"),
        }
    }

    #[test]
    fn old_entries_roll_off_the_minute_window() {
        let mut windows = SlidingWindows::new();
        let now = Instant::now();
        for _ in 0..PER_MINUTE_CAP {
            windows.admit(now);
        }
        let later = now + Duration::from_secs(61);
        assert_eq!(windows.admit(later), RateLimitResult::Admitted);
    }

    #[tokio::test]
    async fn concurrency_cap_limits_in_flight_permits() {
        let registry = RateLimitRegistry::new();
        let mut permits = Vec::new();
        for _ in 0..MAX_CONCURRENT_PER_HOST {
            permits.push(registry.acquire_concurrency("host-a").await);
        }

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            registry.acquire_concurrency("host-a"),
        )
        .await;
        assert!(blocked.is_err(), "11th acquire should not be admitted yet");

        permits.pop();
        let admitted = tokio::time::timeout(
            Duration::from_millis(50),
            registry.acquire_concurrency("host-a"),
        )
        .await;
        assert!(admitted.is_ok(), "acquire should succeed once a slot frees up");
    }
}
