//! Per-model token timing
//!
//! One tracker per (model, stage) stream. The thinking window closes on the
//! first non-thinking token; all derived values are monotonic non-decreasing
//! within a stream and never negative.

use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone)]
pub struct TokenTracker {
    start: Instant,
    thinking_end: Option<Instant>,
    tokens: u64,
}

impl TokenTracker {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
            thinking_end: None,
            tokens: 0,
        }
    }

    /// Record a reasoning-channel token. Does not close the thinking window.
    pub fn record_thinking(&mut self) {
        self.tokens += 1;
    }

    /// Record a content token, closing the thinking window on the first one.
    pub fn record_token(&mut self) {
        if self.thinking_end.is_none() {
            self.thinking_end = Some(Instant::now());
        }
        self.tokens += 1;
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Seconds spent in the thinking channel. While the model is still
    /// thinking this equals the elapsed time, so it never exceeds it.
    pub fn thinking_seconds(&self) -> f64 {
        match self.thinking_end {
            Some(end) => end.duration_since(self.start).as_secs_f64(),
            None => self.elapsed_seconds(),
        }
    }

    pub fn tokens_per_sec(&self) -> f64 {
        let elapsed = self.elapsed_seconds();
        if elapsed <= 0.0 {
            0.0
        } else {
            self.tokens as f64 / elapsed
        }
    }

    /// Snapshot attached to every token and completion event.
    pub fn timing(&self) -> Timing {
        Timing {
            tokens_per_sec: round3(self.tokens_per_sec()),
            elapsed_seconds: round3(self.elapsed_seconds()),
            thinking_seconds: round3(self.thinking_seconds()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Timing {
    pub tokens_per_sec: f64,
    pub elapsed_seconds: f64,
    pub thinking_seconds: f64,
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_thinking_never_exceeds_elapsed() {
        let mut tracker = TokenTracker::start();
        tracker.record_thinking();
        std::thread::sleep(Duration::from_millis(5));
        let timing = tracker.timing();
        assert!(timing.thinking_seconds <= timing.elapsed_seconds + 1e-9);
        assert!(timing.tokens_per_sec >= 0.0);
    }

    #[test]
    fn test_first_token_latches_thinking_end() {
        let mut tracker = TokenTracker::start();
        tracker.record_thinking();
        std::thread::sleep(Duration::from_millis(5));
        tracker.record_token();
        let after_first = tracker.thinking_seconds();
        std::thread::sleep(Duration::from_millis(5));
        tracker.record_token();
        // Thinking window is closed; more tokens do not move it.
        assert!((tracker.thinking_seconds() - after_first).abs() < 1e-9);
        assert_eq!(tracker.tokens(), 3);
    }

    #[test]
    fn test_tokens_per_sec_non_negative() {
        let tracker = TokenTracker::start();
        assert!(tracker.tokens_per_sec() >= 0.0);
    }
}
