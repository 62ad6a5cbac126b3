//! Sliding window of connection failures.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Failure timestamps no older than the look-back window, oldest first.
#[derive(Debug, Clone)]
pub struct AttemptWindow {
    window: Duration,
    failures: VecDeque<Instant>,
}

impl AttemptWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            failures: VecDeque::new(),
        }
    }

    /// Drop every failure `window` or more before `now`. A zero window only
    /// drops failures strictly before `now`.
    pub fn purge(&mut self, now: Instant) {
        while let Some(oldest) = self.failures.front() {
            if self.is_stale(now.saturating_duration_since(*oldest)) {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a failure at `now` and return how many remain in the window.
    pub fn record(&mut self, now: Instant) -> usize {
        self.failures.push_back(now);
        self.purge(now);
        self.failures.len()
    }

    fn is_stale(&self, age: Duration) -> bool {
        if self.window.is_zero() {
            age > self.window
        } else {
            age >= self.window
        }
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_purge_drops_only_stale_entries() {
        let start = Instant::now();
        let mut window = AttemptWindow::new(secs(60));

        window.record(start);
        window.record(start + secs(30));
        assert_eq!(window.len(), 2);

        window.purge(start + secs(61));
        assert_eq!(window.len(), 1);

        window.purge(start + secs(91));
        assert!(window.is_empty());
    }

    #[test]
    fn test_entry_exactly_at_window_edge_is_dropped() {
        let start = Instant::now();
        let mut window = AttemptWindow::new(secs(60));

        window.record(start);
        assert_eq!(window.record(start + secs(59)), 2);
        assert_eq!(window.record(start + secs(60)), 2);
        assert_eq!(window.record(start + secs(120)), 1);
    }

    #[test]
    fn test_spaced_failures_never_accumulate() {
        let start = Instant::now();
        let mut window = AttemptWindow::new(secs(60));

        for t in [0, 70, 140, 210] {
            assert_eq!(window.record(start + secs(t)), 1);
        }
    }

    #[test]
    fn test_zero_window_keeps_only_current_failure() {
        let start = Instant::now();
        let mut window = AttemptWindow::new(Duration::ZERO);

        window.record(start);
        assert_eq!(window.record(start + secs(1)), 1);
    }
}
