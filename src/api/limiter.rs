//! Adaptive request pacing
//!
//! Calls are spaced by `current_delay`. A 429 at least doubles the spacing,
//! or follows the server's `Retry-After` when that is longer; each success
//! narrows it back toward the base delay. Slots already handed out are never
//! moved earlier.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

const SUCCESS_DECAY: f64 = 0.95;
const BACKOFF_FACTOR: u32 = 2;

#[derive(Debug)]
struct RateState {
    next_allowed: Instant,
    current_delay: Duration,
}

/// Shared pacing state for every call to one API
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    base_delay: Duration,
    max_delay: Duration,
    state: Mutex<RateState>,
}

impl AdaptiveRateLimiter {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            state: Mutex::new(RateState {
                next_allowed: Instant::now(),
                current_delay: base_delay,
            }),
        }
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub async fn current_delay(&self) -> Duration {
        self.state.lock().await.current_delay
    }

    /// Wait for this caller's slot.
    ///
    /// The slot is reserved under the lock and the wait happens outside it, so
    /// concurrent callers queue one `current_delay` apart.
    pub async fn acquire(&self) {
        let slot = self.reserve().await;
        sleep_until(slot).await;
    }

    async fn reserve(&self) -> Instant {
        let mut state = self.state.lock().await;
        let slot = state.next_allowed.max(Instant::now());
        state.next_allowed = slot + state.current_delay;
        slot
    }

    /// Relax toward the base delay after a successful call.
    pub async fn on_success(&self) -> Duration {
        let mut state = self.state.lock().await;
        state.current_delay = relaxed(state.current_delay, self.base_delay);
        let earliest = Instant::now() + state.current_delay;
        state.next_allowed = state.next_allowed.max(earliest);
        state.current_delay
    }

    /// Widen the spacing after HTTP 429 and push the next slot out accordingly.
    pub async fn on_rate_limited(&self, retry_after: Option<Duration>) -> Duration {
        let mut state = self.state.lock().await;
        state.current_delay = escalated(
            state.current_delay,
            retry_after,
            self.base_delay,
            self.max_delay,
        );
        let earliest = Instant::now() + state.current_delay;
        state.next_allowed = state.next_allowed.max(earliest);
        state.current_delay
    }
}

fn relaxed(current: Duration, base: Duration) -> Duration {
    current.mul_f64(SUCCESS_DECAY).max(base)
}

fn escalated(
    current: Duration,
    retry_after: Option<Duration>,
    base: Duration,
    max: Duration,
) -> Duration {
    let doubled = current.saturating_mul(BACKOFF_FACTOR);
    retry_after
        .map_or(doubled, |server| server.max(doubled))
        .clamp(base, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(500);
    const MAX: Duration = Duration::from_secs(30);

    /// Paused-clock timers fire on millisecond ticks
    fn assert_near(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(5),
            "expected ~{:?}, got {:?}",
            expected,
            actual
        );
    }

    #[test]
    fn test_escalation_doubles_then_caps() {
        let cap = Duration::from_millis(1500);
        let first = escalated(BASE, None, BASE, cap);
        let second = escalated(first, None, BASE, cap);
        let third = escalated(second, None, BASE, cap);
        assert_eq!(first, Duration::from_millis(1000));
        assert_eq!(second, cap);
        assert_eq!(third, cap);
    }

    #[test]
    fn test_retry_after_is_used_within_bounds() {
        assert_eq!(
            escalated(BASE, Some(Duration::from_secs(7)), BASE, MAX),
            Duration::from_secs(7)
        );
        assert_eq!(escalated(BASE, Some(Duration::from_secs(120)), BASE, MAX), MAX);
        assert_eq!(escalated(BASE, Some(Duration::ZERO), BASE, MAX), BASE * 2);
    }

    #[test]
    fn test_short_retry_after_never_lowers_delay() {
        let mut delay = Duration::from_secs(1);
        let mut history = vec![delay];
        for _ in 0..2 {
            delay = escalated(delay, None, BASE, MAX);
            history.push(delay);
        }
        delay = escalated(delay, Some(Duration::from_secs(1)), BASE, MAX);
        history.push(delay);

        assert_eq!(history[2], Duration::from_secs(4));
        assert_eq!(delay, Duration::from_secs(8));
        assert!(history.windows(2).all(|pair| pair[1] > pair[0]));
    }

    #[test]
    fn test_relax_never_below_base() {
        let once = relaxed(Duration::from_millis(1000), BASE);
        assert!(once < Duration::from_millis(1000) && once >= Duration::from_millis(949));
        assert_eq!(relaxed(Duration::from_millis(510), BASE), BASE);
        assert_eq!(relaxed(BASE, BASE), BASE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_spaces_calls() {
        let limiter = AdaptiveRateLimiter::new(BASE, MAX);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert_near(start.elapsed(), BASE * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_do_not_share_a_slot() {
        let limiter = std::sync::Arc::new(AdaptiveRateLimiter::new(BASE, MAX));
        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter.acquire().await;
                    Instant::now()
                })
            })
            .collect();

        let mut times = Vec::new();
        for handle in handles {
            times.push(handle.await.unwrap() - start);
        }
        times.sort();
        for (actual, slot) in times.into_iter().zip(0u32..) {
            assert_near(actual, BASE * slot);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_keeps_reserved_slots() {
        let limiter = AdaptiveRateLimiter::new(BASE, MAX);
        let start = Instant::now();
        let mut slots = vec![
            limiter.reserve().await,
            limiter.reserve().await,
            limiter.reserve().await,
        ];

        // First caller is answered with a 429 while two others are queued
        let delay = limiter.on_rate_limited(None).await;
        assert_eq!(delay, BASE * 2);
        slots.push(limiter.reserve().await);

        let offsets: Vec<Duration> = slots.iter().map(|slot| *slot - start).collect();
        assert_eq!(
            offsets,
            vec![Duration::ZERO, BASE, BASE * 2, BASE * 3],
            "a slot was handed out twice"
        );
        assert_eq!(limiter.reserve().await - start, BASE * 3 + delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_pushes_next_slot() {
        let limiter = AdaptiveRateLimiter::new(BASE, MAX);
        limiter.acquire().await;
        let delay = limiter.on_rate_limited(None).await;
        assert_eq!(delay, BASE * 2);

        let before = Instant::now();
        limiter.acquire().await;
        assert_near(before.elapsed(), BASE * 2);

        let relaxed = limiter.on_success().await;
        assert!(relaxed < BASE * 2);
        assert!(relaxed >= BASE);
    }
}
