use std::time::Duration;

// Cap the shift so the multiplier cannot overflow; any real cap kicks in
// well before 32x the base delay.
const MAX_DOUBLINGS: u32 = 5;

/// Wait schedule between persist attempts.
///
/// The delay starts at `base`, doubles after every further failure, and
/// never exceeds `cap`. With the default 2s base and 10s cap the schedule
/// runs 2s, 4s, 8s, then holds at 10s.
#[derive(Copy, Clone, Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay to wait after the given zero-based failed attempt.
    pub fn delay(&self, failures: u32) -> Duration {
        let doubled = self.base.saturating_mul(1 << failures.min(MAX_DOUBLINGS));
        doubled.min(self.cap)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(10),
        }
    }
}
