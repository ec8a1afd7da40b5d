//! Rate limiting for repeated warnings
//!
//! A misbehaving driver can fail every polling pass. Each `LogLimiter`
//! emits at most one warning per interval and counts the rest; the count is
//! flushed as a summary line together with the next permitted warning.

use parking_lot::Mutex;
use std::fmt::Display;
use std::time::{Duration, Instant};
use tracing::warn;

/// Default suppression interval in milliseconds
pub const DEFAULT_SUPPRESSION_INTERVAL_MS: u64 = 500;

#[derive(Debug, Default)]
struct LimiterState {
    last_emit: Option<Instant>,
    suppressed: u64,
}

/// Per-source warning limiter
#[derive(Debug)]
pub struct LogLimiter {
    interval: Duration,
    state: Mutex<LimiterState>,
}

impl Default for LogLimiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_SUPPRESSION_INTERVAL_MS))
    }
}

impl LogLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns `Some(suppressed)` when a message may be emitted now, where
    /// `suppressed` is the number of messages dropped since the last one.
    pub fn permit(&self) -> Option<u64> {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.last_emit {
            Some(last) if now.duration_since(last) < self.interval => {
                state.suppressed += 1;
                None
            },
            _ => {
                state.last_emit = Some(now);
                Some(std::mem::take(&mut state.suppressed))
            },
        }
    }

    /// Emit `message` as a warning unless the interval has not elapsed.
    pub fn warn(&self, message: impl Display) {
        if let Some(suppressed) = self.permit() {
            if suppressed > 0 {
                warn!("{} similar warnings suppressed", suppressed);
            }
            warn!("{}", message);
        }
    }

    /// Messages dropped since the last emission
    pub fn suppressed(&self) -> u64 {
        self.state.lock().suppressed
    }
}
