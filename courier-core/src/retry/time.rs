use chrono::Utc;

/// Source of "now" in epoch milliseconds.
pub trait TimeProvider: Send + Sync {
    fn current_time_millis(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn current_time_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}
