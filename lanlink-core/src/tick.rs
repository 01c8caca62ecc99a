//! Wrapping millisecond tick counter.

use std::time::Instant;

/// Milliseconds since the clock was created, truncated to u32 (wraps after ~49 days).
#[derive(Clone, Copy, Debug)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Elapsed ticks between `old` and `new`, tolerant of wraparound.
pub fn elapsed(old: u32, new: u32) -> u32 {
    new.wrapping_sub(old)
}

/// True while `new - old < timeout`.
pub fn check_delay(old: u32, new: u32, timeout: u32) -> bool {
    elapsed(old, new) < timeout
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_delay_window() {
        assert!(check_delay(100, 150, 100));
        assert!(!check_delay(100, 200, 100));
        assert!(!check_delay(100, 300, 100));
    }

    #[test]
    fn check_delay_across_wrap() {
        let old = u32::MAX - 10;
        assert_eq!(elapsed(old, 20), 31);
        assert!(check_delay(old, 20, 50));
        assert!(!check_delay(old, 20, 31));
    }

    #[test]
    fn tick_from_the_future_is_not_valid() {
        // A tick ahead of now wraps to a huge elapsed value.
        assert!(!check_delay(500, 400, 60_000));
    }
}
