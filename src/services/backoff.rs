use rand::Rng;
use std::time::Duration;

/// Exponential retry schedule for failed deliveries.
///
/// Failure `n` (1-based) waits `min(cap, base * 2^(n-1) * jitter)` with the jitter factor
/// drawn from `[0.75, 1.25)`. The `max_attempts`-th failure dead-letters the job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            cap: cap.max(base),
        }
    }

    /// True once `attempts` failures have been recorded and no retries remain.
    pub fn is_exhausted(&self, attempts: i32) -> bool {
        attempts >= self.max_attempts as i32
    }

    /// Delay before the retry following failure number `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.75..1.25);
        self.delay_with_jitter(attempt, jitter)
    }

    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let raw = self.base.as_secs_f64() * 2f64.powi(exponent as i32) * jitter;
        let capped = raw.min(self.cap.as_secs_f64());
        // never zero, so next-eligible-time strictly advances
        Duration::from_secs_f64(capped).max(Duration::from_millis(1))
    }
}

/// Bounded doubling delay used while re-establishing the push subscription.
#[derive(Debug, Clone)]
pub struct ResubscribeBackoff {
    next: Duration,
    cap: Duration,
    remaining: u32,
}

impl ResubscribeBackoff {
    pub fn new(start: Duration, cap: Duration, attempts: u32) -> Self {
        Self {
            next: start,
            cap,
            remaining: attempts,
        }
    }

    /// Delay before the next attempt, or `None` when attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self.next.min(self.cap);
        self.next = self.next.saturating_mul(2).min(self.cap);
        Some(delay)
    }
}
