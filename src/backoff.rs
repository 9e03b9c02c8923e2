use rand::Rng;
use std::cmp;
use tokio::time::Duration;

/// BackoffPolicy is the one retry schedule shared by the registry client, the subscription
/// restarts, and the proxy reconnect loop.
///
/// The delay for attempt `n` (starting at 0) is `min(initial * 2^n, max)`, with equal jitter: half
/// of the delay is fixed and the other half is uniformly random.
#[derive(Copy, Clone, Debug)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        BackoffPolicy {
            initial,
            max: cmp::max(initial, max),
        }
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Upper bound of the delay for `attempt`, before jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        // 2^20 * initial is beyond any sane max already.
        let factor = 1u32 << cmp::min(attempt, 20);
        cmp::min(self.initial.saturating_mul(factor), self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        let jitter_millis = half.as_millis() as u64;
        if jitter_millis == 0 {
            return ceiling;
        }
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_millis))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(10))
    }
}
