//! Per-domain request pacing
//!
//! One [`DomainLimiter`] exists per `(job, domain)` pair, created lazily by
//! the job's [`LimiterMap`]. The limiter is a single-serving token bus, not a
//! pool: `acquire` admits exactly one caller at a time and releases waiters
//! strictly in arrival order, so raising dispatcher concurrency can never
//! collapse into a burst against one origin.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct LimiterState {
    delay: Duration,
    last_request_at: Option<Instant>,
    throttle_until: Option<Instant>,
}

impl LimiterState {
    /// Time until the next request may go out, or `None` if ready now.
    fn next_ready_in(&self, now: Instant) -> Option<Duration> {
        let mut ready_at = self
            .last_request_at
            .map(|last| last + self.delay)
            .unwrap_or(now);
        if let Some(until) = self.throttle_until {
            if until > ready_at {
                ready_at = until;
            }
        }
        if ready_at > now {
            Some(ready_at - now)
        } else {
            None
        }
    }
}

/// Pacing gate for a single origin
pub struct DomainLimiter {
    /// Tokio's mutex is fair: lock acquisition order is FIFO, which is what
    /// orders the waiters.
    gate: tokio::sync::Mutex<()>,
    state: Mutex<LimiterState>,
}

impl DomainLimiter {
    pub fn new(delay: Duration) -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(LimiterState {
                delay,
                last_request_at: None,
                throttle_until: None,
            }),
        }
    }

    /// Blocks until `now >= max(last_request_at + delay, throttle_until)`,
    /// then stamps `last_request_at` and releases the caller.
    ///
    /// The head waiter holds the gate while sleeping, which serializes
    /// everyone behind it in FIFO order. The wait is re-evaluated after each
    /// sleep because `throttle` may extend the window mid-wait.
    pub async fn acquire(&self) {
        let _token = self.gate.lock().await;
        loop {
            let wait = {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.next_ready_in(Instant::now())
            };
            match wait {
                Some(duration) => tokio::time::sleep(duration).await,
                None => break,
            }
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_request_at = Some(Instant::now());
    }

    /// Extends the throttle window: `throttle_until = max(current, now + d)`.
    /// Called when the origin answers 429 or 503.
    pub fn throttle(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let proposed = Instant::now() + duration;
        state.throttle_until = Some(match state.throttle_until {
            Some(current) if current > proposed => current,
            _ => proposed,
        });
    }

    /// Updates the pacing delay; applies to subsequent waits.
    pub fn set_delay(&self, delay: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.delay = delay;
    }

    #[cfg(test)]
    fn current_delay(&self) -> Duration {
        self.state.lock().unwrap().delay
    }
}

/// Lazily-populated limiter registry for one job
pub struct LimiterMap {
    base_delay: Duration,
    limiters: Mutex<HashMap<String, Arc<DomainLimiter>>>,
}

impl LimiterMap {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the limiter for `domain`, creating it with the job's base
    /// delay on first use.
    pub fn for_domain(&self, domain: &str) -> Arc<DomainLimiter> {
        let mut limiters = self.limiters.lock().unwrap_or_else(|e| e.into_inner());
        limiters
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(DomainLimiter::new(self.base_delay)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_acquire_is_immediate() {
        let limiter = DomainLimiter::new(Duration::from_millis(200));
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_acquire_spacing() {
        let limiter = DomainLimiter::new(Duration::from_millis(150));
        limiter.acquire().await;
        let start = Instant::now();
        limiter.acquire().await;
        assert!(
            start.elapsed() >= Duration::from_millis(140),
            "second acquire returned after {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn test_throttle_blocks_release() {
        let limiter = DomainLimiter::new(Duration::from_millis(10));
        limiter.acquire().await;
        limiter.throttle(Duration::from_millis(300));
        let start = Instant::now();
        limiter.acquire().await;
        assert!(
            start.elapsed() >= Duration::from_millis(290),
            "released during throttle window after {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn test_throttle_only_extends() {
        let limiter = DomainLimiter::new(Duration::from_millis(10));
        limiter.throttle(Duration::from_millis(300));
        // A shorter throttle must not shrink the window
        limiter.throttle(Duration::from_millis(10));
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(280));
    }

    #[tokio::test]
    async fn test_waiters_released_in_fifo_order() {
        let limiter = Arc::new(DomainLimiter::new(Duration::from_millis(50)));
        let order = Arc::new(Mutex::new(Vec::new()));

        limiter.acquire().await;

        let mut handles = Vec::new();
        for i in 0..4 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                order.lock().unwrap().push(i);
            }));
            // Stagger arrivals so queue order is deterministic
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_set_delay_applies_to_next_wait() {
        let limiter = DomainLimiter::new(Duration::from_millis(500));
        limiter.acquire().await;
        limiter.set_delay(Duration::from_millis(50));
        let start = Instant::now();
        limiter.acquire().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(400));
    }

    #[test]
    fn test_map_reuses_limiter_per_domain() {
        let map = LimiterMap::new(Duration::from_millis(100));
        let a1 = map.for_domain("a.test");
        let a2 = map.for_domain("a.test");
        let b = map.for_domain("b.test");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        assert_eq!(a1.current_delay(), Duration::from_millis(100));
    }
}
