//! Per-credential-group rate limiting.
//!
//! Each credential group carries a request budget per window (per second by default). The
//! limiter keeps a sliding log of admission instants for every group it has seen. Groups are
//! stored in a sharded map and each log has its own lock, so admissions for different groups
//! never wait on each other.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::RateLimitConfig;
use crate::types::CredentialGroupId;

type AdmissionLog = Arc<Mutex<VecDeque<Instant>>>;

/// Sliding-window admission control keyed by credential group.
#[derive(Debug)]
pub struct CredentialGroupRateLimiter {
    window: Duration,
    sweep_interval: Duration,
    logs: DashMap<CredentialGroupId, AdmissionLog>,
    last_sweep: Mutex<Instant>,
}

impl CredentialGroupRateLimiter {
    pub fn new(window: Duration, sweep_interval: Duration) -> Self {
        Self {
            window,
            sweep_interval,
            logs: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Creates the limiter from configuration. Returns `None` when rate limiting is disabled.
    pub fn from_config(config: &RateLimitConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        Some(Self::new(config.window, config.sweep_interval))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit one request against `group_id`'s budget of `limit` requests per window.
    ///
    /// A limit of 0 always admits and records nothing. An admitted request counts against the
    /// window even if the caller ends up not using the credential.
    pub fn admit(&self, group_id: CredentialGroupId, limit: u32) -> bool {
        if limit == 0 {
            return true;
        }

        let now = Instant::now();
        self.maybe_sweep(now);

        // Clone the log handle out so the map shard is released before locking the log
        let log = self.logs.entry(group_id).or_default().value().clone();
        let mut log = log.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        self.expire(&mut log, now);
        if log.len() >= limit as usize {
            trace!(group_id, limit, "Rate limit reached for credential group");
            metrics::counter!("tenantctl_rate_limit_denied_total").increment(1);
            return false;
        }
        log.push_back(now);
        true
    }

    /// Number of admissions currently inside the window for `group_id`.
    pub fn in_flight(&self, group_id: CredentialGroupId) -> usize {
        let Some(log) = self.logs.get(&group_id).map(|entry| entry.value().clone()) else {
            return 0;
        };
        let mut log = log.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.expire(&mut log, Instant::now());
        log.len()
    }

    /// Number of groups with a tracked log.
    pub fn tracked_groups(&self) -> usize {
        self.logs.len()
    }

    /// Drop logs whose every admission has left the window.
    pub fn sweep(&self) {
        let now = Instant::now();
        let before = self.logs.len();
        self.logs.retain(|_, log| {
            let mut log = log.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            self.expire(&mut log, now);
            !log.is_empty()
        });
        let removed = before.saturating_sub(self.logs.len());
        if removed > 0 {
            debug!(removed, "Swept idle credential group rate-limit windows");
        }
    }

    fn expire(&self, log: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = log.front() {
            if now.duration_since(*oldest) >= self.window {
                log.pop_front();
            } else {
                break;
            }
        }
    }

    fn maybe_sweep(&self, now: Instant) {
        // Whoever holds the sweep lock does the work, everyone else carries on
        let Ok(mut last_sweep) = self.last_sweep.try_lock() else {
            return;
        };
        if now.duration_since(*last_sweep) < self.sweep_interval {
            return;
        }
        *last_sweep = now;
        drop(last_sweep);
        self.sweep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> CredentialGroupRateLimiter {
        CredentialGroupRateLimiter::new(Duration::from_secs(1), Duration::from_secs(300))
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_limit_within_window() {
        let limiter = limiter();
        assert!(limiter.admit(1, 3));
        assert!(limiter.admit(1, 3));
        assert!(limiter.admit(1, 3));
        assert!(!limiter.admit(1, 3));
        assert_eq!(limiter.in_flight(1), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_limit_always_admits() {
        let limiter = limiter();
        for _ in 0..100 {
            assert!(limiter.admit(1, 0));
        }
        assert_eq!(limiter.tracked_groups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = limiter();
        assert!(limiter.admit(1, 2));
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(limiter.admit(1, 2));
        assert!(!limiter.admit(1, 2));

        // First admission leaves the window, the second one is still inside it
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(limiter.admit(1, 2));
        assert!(!limiter.admit(1, 2));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.in_flight(1), 0);
        assert!(limiter.admit(1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_groups_are_independent() {
        let limiter = limiter();
        assert!(limiter.admit(1, 1));
        assert!(!limiter.admit(1, 1));
        assert!(limiter.admit(2, 1));
        assert_eq!(limiter.in_flight(2), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_idle_groups() {
        let limiter = CredentialGroupRateLimiter::new(Duration::from_secs(1), Duration::from_secs(10));
        assert!(limiter.admit(1, 5));
        assert!(limiter.admit(2, 5));
        assert_eq!(limiter.tracked_groups(), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        // The next admission triggers the periodic sweep before recording itself
        assert!(limiter.admit(3, 5));
        assert_eq!(limiter.tracked_groups(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_admissions_respect_limit() {
        let limiter = Arc::new(limiter());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.admit(7, 10) }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[test]
    fn test_disabled_config_builds_no_limiter() {
        let config = RateLimitConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(CredentialGroupRateLimiter::from_config(&config).is_none());
        assert!(CredentialGroupRateLimiter::from_config(&RateLimitConfig::default()).is_some());
    }
}
