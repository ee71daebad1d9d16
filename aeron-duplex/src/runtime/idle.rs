//! Backoff idle strategy for the polling event loops.

use std::time::Duration;

const MAX_SPINS: u32 = 10;
const MAX_YIELDS: u32 = 5;
const MIN_PARK: Duration = Duration::from_micros(1);
const MAX_PARK: Duration = Duration::from_millis(1);

/// Spin, then yield, then park for exponentially growing intervals capped at
/// 1 ms. Any tick that performed work resets the strategy, so a busy loop
/// burns no syscalls and an idle loop converges to ~1 kHz wakeups.
pub(crate) struct BackoffIdle {
    spins: u32,
    yields: u32,
    park: Duration,
}

impl BackoffIdle {
    pub(crate) fn new() -> Self {
        Self {
            spins: 0,
            yields: 0,
            park: MIN_PARK,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
        self.park = MIN_PARK;
    }

    /// Idles according to how much work the last tick performed.
    pub(crate) async fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }
        if self.spins < MAX_SPINS {
            self.spins += 1;
            std::hint::spin_loop();
            return;
        }
        if self.yields < MAX_YIELDS {
            self.yields += 1;
            tokio::task::yield_now().await;
            return;
        }
        let park = self.park;
        self.park = (self.park * 2).min(MAX_PARK);
        tokio::time::sleep(park).await;
    }
}

/// Exponential re-poll interval for connect-style waiting outside the loops,
/// 1 µs doubling to 10 ms.
pub(crate) struct ConnectBackoff {
    delay: Duration,
}

impl ConnectBackoff {
    const MIN: Duration = Duration::from_micros(1);
    const MAX: Duration = Duration::from_millis(10);

    pub(crate) fn new() -> Self {
        Self { delay: Self::MIN }
    }

    pub(crate) async fn wait(&mut self) {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(Self::MAX);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::{BackoffIdle, ConnectBackoff, MAX_PARK, MIN_PARK};

    #[tokio::test]
    async fn park_interval_doubles_up_to_the_cap() {
        tokio::time::pause();
        let mut idle = BackoffIdle::new();

        for _ in 0..super::MAX_SPINS + super::MAX_YIELDS {
            idle.idle(0).await;
        }
        assert_eq!(idle.park, MIN_PARK);

        for _ in 0..32 {
            idle.idle(0).await;
        }
        assert_eq!(idle.park, MAX_PARK);
    }

    #[tokio::test]
    async fn work_resets_the_strategy() {
        tokio::time::pause();
        let mut idle = BackoffIdle::new();

        for _ in 0..64 {
            idle.idle(0).await;
        }
        idle.idle(3).await;

        assert_eq!(idle.spins, 0);
        assert_eq!(idle.park, MIN_PARK);
    }

    #[tokio::test]
    async fn connect_backoff_saturates_at_ten_millis() {
        tokio::time::pause();
        let mut backoff = ConnectBackoff::new();

        for _ in 0..32 {
            backoff.wait().await;
        }

        assert_eq!(backoff.delay, ConnectBackoff::MAX);
    }
}
