//! Repeat throttling for log lines
//!
//! A card that is not inserted fails its probe every second, forever. The
//! throttle lets the first failure through, then only every `every`-th one,
//! and reports how many were swallowed once the condition clears.

/// Counter-based throttle for a single repeating condition
#[derive(Debug, Clone)]
pub struct RepeatThrottle {
    every: u32,
    count: u32,
}

impl RepeatThrottle {
    /// Log the first occurrence and then every `every`-th one
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            count: 0,
        }
    }

    /// Record one occurrence; returns `true` if it should be logged
    pub fn should_log(&mut self) -> bool {
        self.count = self.count.saturating_add(1);
        self.count == 1 || self.count % self.every == 0
    }

    /// Number of occurrences since the last reset
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Clear the condition, returning how many occurrences were recorded
    pub fn reset(&mut self) -> u32 {
        std::mem::take(&mut self.count)
    }
}

impl Default for RepeatThrottle {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Throttled warning logging
///
/// ```rust
/// use msc_gadget::utils::RepeatThrottle;
/// use msc_gadget::warn_throttled;
///
/// let mut throttle = RepeatThrottle::new(5);
/// warn_throttled!(throttle, "probe failed: {}", "timeout");
/// ```
#[macro_export]
macro_rules! warn_throttled {
    ($throttle:expr, $($arg:tt)*) => {
        if $throttle.should_log() {
            tracing::warn!($($arg)*);
        }
    };
}

/// Throttled error logging
#[macro_export]
macro_rules! error_throttled {
    ($throttle:expr, $($arg:tt)*) => {
        if $throttle.should_log() {
            tracing::error!($($arg)*);
        }
    };
}
