//! Bounded exponential backoff with cancellation-aware waits.

use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Exponential backoff between a minimum and maximum delay.
///
/// One instance is scoped per retry class; the current delay is shared by
/// every task retrying that class of operation. `wait` sleeps the current
/// delay, `backoff` doubles it up to the maximum, and `recover` resets it
/// to the minimum after a success.
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Mutex<Duration>,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: Mutex::new(min),
        }
    }

    /// Sleep for the current delay, or fail if `cancel` fires first.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let delay = *self.current.lock().unwrap();
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Double the current delay, capped at the maximum.
    pub fn backoff(&self) {
        let mut current = self.current.lock().unwrap();
        *current = (*current * 2).min(self.max);
    }

    /// Reset the current delay to the minimum.
    pub fn recover(&self) {
        *self.current.lock().unwrap() = self.min;
    }

    #[cfg(test)]
    pub fn current(&self) -> Duration {
        *self.current.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(35));
        assert_eq!(backoff.current(), Duration::from_millis(10));
        backoff.backoff();
        assert_eq!(backoff.current(), Duration::from_millis(20));
        backoff.backoff();
        assert_eq!(backoff.current(), Duration::from_millis(35));
        backoff.backoff();
        assert_eq!(backoff.current(), Duration::from_millis(35));
    }

    #[test]
    fn recover_resets_to_min() {
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(5));
        backoff.backoff();
        backoff.backoff();
        backoff.recover();
        assert_eq!(backoff.current(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_current_delay() {
        let backoff = Backoff::new(Duration::from_millis(50), Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();
        backoff.wait(&cancel).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn wait_fails_when_cancelled() {
        let backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(backoff.wait(&cancel).await, Err(Error::Cancelled)));
    }
}
