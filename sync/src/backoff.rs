//! Injectable retry delay strategies.

use std::time::Duration;

/// Produces the delay before the next retry. [Backoff::reset] is called after any
/// successful operation to restore the initial delay.
pub trait Backoff: Send + 'static {
    fn next(&mut self) -> Duration;
    fn reset(&mut self);
}

/// Doubling backoff with a cap.
#[derive(Debug, Clone)]
pub struct Exponential {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Exponential {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }
}

impl Default for Exponential {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(60))
    }
}

impl Backoff for Exponential {
    fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_cap() {
        let mut backoff = Exponential::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next(), Duration::from_millis(100));
        assert_eq!(backoff.next(), Duration::from_millis(200));
        assert_eq!(backoff.next(), Duration::from_millis(350));
        assert_eq!(backoff.next(), Duration::from_millis(350));
    }

    #[test]
    fn test_reset_restores_initial() {
        let mut backoff = Exponential::new(Duration::from_millis(100), Duration::from_secs(1));
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(100));
    }
}
