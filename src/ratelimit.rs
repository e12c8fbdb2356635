use std::net::IpAddr;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::logger::log;

/// Limiter tuning. All fields are plain data so tests can build arbitrary
/// limiters without touching global config.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sustained allowance, tokens per second.
    pub rate_per_sec: f64,
    /// Bucket capacity.
    pub burst: f64,
    /// Violations before an automatic ban.
    pub ban_threshold: u32,
    pub ban_duration: Duration,
    /// Idle unbanned entries older than this are swept.
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            rate_per_sec: 100.0,
            burst: 200.0,
            ban_threshold: 10,
            ban_duration: Duration::from_secs(3600),
            retention: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
struct Entry {
    tokens: f64,
    last_refill: Instant,
    violations: u32,
    banned_until: Option<Instant>,
    last_seen: Instant,
}

impl Entry {
    fn fresh(burst: f64) -> Self {
        let now = Instant::now();
        Entry {
            tokens: burst,
            last_refill: now,
            violations: 0,
            banned_until: None,
            last_seen: now,
        }
    }

    /// Lazy refill from elapsed time, clamped to the bucket capacity.
    fn refill(&mut self, now: Instant, rate: f64, burst: f64) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * rate).min(burst);
            self.last_refill = now;
        }
    }
}

/// Aggregate limiter stats for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub tracked_origins: usize,
    pub banned_origins: usize,
}

/// Token-bucket admission control with violation tracking and bans.
///
/// One entry per origin IP in a DashMap; the shard lock covers the whole
/// token update so refill and spend are atomic with respect to concurrent
/// callers for the same origin.
pub struct RateLimiter {
    entries: DashMap<IpAddr, Entry>,
    config: RateLimitConfig,
    shutdown: CancellationToken,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter {
            entries: DashMap::new(),
            config,
            shutdown: CancellationToken::new(),
            sweeper: StdMutex::new(None),
        }
    }

    /// Admit a single request from `origin`.
    pub fn allow(&self, origin: IpAddr) -> bool {
        self.allow_n(origin, 1.0)
    }

    /// Admit `n` tokens worth of work, all or nothing.
    pub fn allow_n(&self, origin: IpAddr, n: f64) -> bool {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(origin)
            .or_insert_with(|| Entry::fresh(self.config.burst));
        entry.last_seen = now;

        if let Some(until) = entry.banned_until {
            if now < until {
                return false;
            }
            // Ban expired: resume normal accounting.
            entry.banned_until = None;
            entry.violations = 0;
        }

        entry.refill(now, self.config.rate_per_sec, self.config.burst);
        if entry.tokens >= n {
            entry.tokens -= n;
            entry.violations = 0;
            true
        } else {
            entry.violations += 1;
            if entry.violations >= self.config.ban_threshold {
                entry.banned_until = Some(now + self.config.ban_duration);
                log::rate_limit(&origin.to_string(), "banned");
            }
            false
        }
    }

    pub fn is_banned(&self, origin: IpAddr) -> bool {
        match self.entries.get(&origin) {
            Some(entry) => match entry.banned_until {
                Some(until) => Instant::now() < until,
                None => false,
            },
            None => false,
        }
    }

    pub fn banned_until(&self, origin: IpAddr) -> Option<Instant> {
        self.entries
            .get(&origin)
            .and_then(|e| e.banned_until)
            .filter(|until| Instant::now() < *until)
    }

    /// Administrative ban, independent of the violation counter.
    pub fn ban(&self, origin: IpAddr, duration: Duration) {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(origin)
            .or_insert_with(|| Entry::fresh(self.config.burst));
        entry.banned_until = Some(now + duration);
        entry.last_seen = now;
        log::rate_limit(&origin.to_string(), "admin ban");
    }

    pub fn unban(&self, origin: IpAddr) {
        if let Some(mut entry) = self.entries.get_mut(&origin) {
            entry.banned_until = None;
            entry.violations = 0;
        }
    }

    /// Drop all state for an origin.
    pub fn reset(&self, origin: IpAddr) {
        self.entries.remove(&origin);
    }

    pub fn violations(&self, origin: IpAddr) -> u32 {
        self.entries.get(&origin).map(|e| e.violations).unwrap_or(0)
    }

    pub fn stats(&self) -> RateLimitStats {
        let now = Instant::now();
        let banned = self
            .entries
            .iter()
            .filter(|e| matches!(e.banned_until, Some(until) if now < until))
            .count();
        RateLimitStats {
            tracked_origins: self.entries.len(),
            banned_origins: banned,
        }
    }

    /// Evict idle, unbanned entries. Banned entries survive until the ban
    /// expires so a ban cannot be shed by going quiet.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let retention = self.config.retention;
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            if let Some(until) = entry.banned_until {
                if now < until {
                    return true;
                }
            }
            now.duration_since(entry.last_seen) < retention
        });
        before - self.entries.len()
    }

    /// Spawn the periodic sweep task. Call once after construction.
    pub fn start(self: &std::sync::Arc<Self>) {
        let limiter = std::sync::Arc::clone(self);
        let token = self.shutdown.clone();
        let interval = self.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = limiter.sweep();
                        if evicted > 0 {
                            tracing::debug!(evicted, "rate limiter sweep");
                        }
                    }
                }
            }
        });
        if let Ok(mut slot) = self.sweeper.lock() {
            *slot = Some(handle);
        }
    }

    /// Stop the sweep task and wait for it to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.sweeper.lock().ok().and_then(|mut s| s.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn quick_config() -> RateLimitConfig {
        RateLimitConfig {
            rate_per_sec: 10.0,
            burst: 5.0,
            ban_threshold: 3,
            ban_duration: Duration::from_secs(60),
            retention: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_burst_then_deny() {
        let limiter = RateLimiter::new(quick_config());
        let origin = ip("203.0.113.1");
        for _ in 0..5 {
            assert!(limiter.allow(origin));
        }
        assert!(!limiter.allow(origin));
        assert_eq!(limiter.violations(origin), 1);
    }

    #[test]
    fn test_allow_n_all_or_nothing() {
        let limiter = RateLimiter::new(quick_config());
        let origin = ip("203.0.113.2");
        assert!(limiter.allow_n(origin, 4.0));
        // 1 token left; a 3-token request must not partially drain it.
        assert!(!limiter.allow_n(origin, 3.0));
        assert!(limiter.allow_n(origin, 1.0));
    }

    #[test]
    fn test_violation_reset_on_admission() {
        let limiter = RateLimiter::new(quick_config());
        let origin = ip("203.0.113.3");
        for _ in 0..5 {
            limiter.allow(origin);
        }
        assert!(!limiter.allow(origin));
        assert!(!limiter.allow(origin));
        assert_eq!(limiter.violations(origin), 2);
        std::thread::sleep(Duration::from_millis(150));
        assert!(limiter.allow(origin));
        assert_eq!(limiter.violations(origin), 0);
    }

    #[test]
    fn test_ban_after_threshold() {
        let limiter = RateLimiter::new(quick_config());
        let origin = ip("203.0.113.4");
        for _ in 0..5 {
            limiter.allow(origin);
        }
        for _ in 0..3 {
            assert!(!limiter.allow(origin));
        }
        assert!(limiter.is_banned(origin));
        // Banned origins are denied even after enough time to refill.
        std::thread::sleep(Duration::from_millis(200));
        assert!(!limiter.allow(origin));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ban_expiry_restores_accounting() {
        let limiter = RateLimiter::new(quick_config());
        let origin = ip("203.0.113.5");
        limiter.ban(origin, Duration::from_secs(60));
        assert!(limiter.is_banned(origin));
        assert!(!limiter.allow(origin));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!limiter.is_banned(origin));
        assert!(limiter.allow(origin));
        assert_eq!(limiter.violations(origin), 0);
    }

    #[test]
    fn test_unban_and_reset() {
        let limiter = RateLimiter::new(quick_config());
        let origin = ip("203.0.113.6");
        limiter.ban(origin, Duration::from_secs(600));
        assert!(limiter.is_banned(origin));
        limiter.unban(origin);
        assert!(!limiter.is_banned(origin));
        limiter.reset(origin);
        assert_eq!(limiter.stats().tracked_origins, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_banned_evicts_idle() {
        let limiter = RateLimiter::new(quick_config());
        let idle = ip("203.0.113.7");
        let banned = ip("203.0.113.8");
        limiter.allow(idle);
        limiter.ban(banned, Duration::from_secs(3600));

        tokio::time::advance(Duration::from_secs(31)).await;
        let evicted = limiter.sweep();
        assert_eq!(evicted, 1);
        assert!(limiter.is_banned(banned));
        assert_eq!(limiter.stats().tracked_origins, 1);
    }

    #[test]
    fn test_origins_are_independent() {
        let limiter = RateLimiter::new(quick_config());
        let a = ip("203.0.113.9");
        let b = ip("203.0.113.10");
        for _ in 0..6 {
            limiter.allow(a);
        }
        assert!(limiter.allow(b));
        assert_eq!(limiter.violations(b), 0);
    }

    #[tokio::test]
    async fn test_start_stop_is_bounded() {
        let limiter = Arc::new(RateLimiter::new(quick_config()));
        limiter.start();
        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_allow_never_oversubscribes() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            rate_per_sec: 0.0001,
            burst: 50.0,
            ..quick_config()
        }));
        let origin = ip("203.0.113.11");
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let mut admitted = 0u32;
                for _ in 0..20 {
                    if limiter.allow(origin) {
                        admitted += 1;
                    }
                }
                admitted
            }));
        }
        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }
        assert!(total <= 50, "admitted {} of a 50-token bucket", total);
    }
}
