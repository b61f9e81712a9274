use chrono::{DateTime, Utc};

/// Source of wall-clock time for lifecycle decisions.
///
/// Timers (poll ticks, backoff) run on tokio's clock; this only answers
/// "what instant is it" so tests can pin it.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use manual::ManualClock;
