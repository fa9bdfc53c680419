//! Flush policies
//!
//! A policy watches events as the pipeline persists them and decides when
//! the queued batches should be uploaded. Count and startup policies answer
//! [`FlushPolicy::should_flush`]; time-based policies run their own task and
//! fire a [`FlushTrigger`] instead.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::events::Event;

/// Default event count that triggers an upload.
pub const DEFAULT_FLUSH_AT: usize = 20;

/// Handle a policy uses to request a flush on its own schedule.
#[derive(Clone)]
pub struct FlushTrigger {
    fire: Arc<dyn Fn() + Send + Sync>,
}

impl FlushTrigger {
    pub fn new(fire: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            fire: Arc::new(fire),
        }
    }

    pub fn fire(&self) {
        (self.fire)();
    }
}

impl fmt::Debug for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushTrigger").finish_non_exhaustive()
    }
}

/// Decides when queued events get uploaded.
///
/// Policies are shared between the pipeline's consumer task and whoever
/// configured them, so every method takes `&self`.
pub trait FlushPolicy: Send + Sync {
    /// Pipeline started. Policies with their own timer start it here.
    fn schedule(&self, _trigger: FlushTrigger) {}

    /// Pipeline stopped.
    fn unschedule(&self) {}

    fn should_flush(&self) -> bool;

    /// An event was persisted.
    fn update_state(&self, _event: &Event) {}

    /// A flush happened.
    fn reset(&self) {}
}

/// Flushes once `flush_at` events have been persisted.
#[derive(Debug)]
pub struct CountBasedFlushPolicy {
    flush_at: usize,
    count: AtomicUsize,
}

impl CountBasedFlushPolicy {
    /// A threshold below 1 falls back to [`DEFAULT_FLUSH_AT`].
    pub fn new(flush_at: usize) -> Self {
        let flush_at = if flush_at >= 1 {
            flush_at
        } else {
            DEFAULT_FLUSH_AT
        };
        Self {
            flush_at,
            count: AtomicUsize::new(0),
        }
    }

    pub fn flush_at(&self) -> usize {
        self.flush_at
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Default for CountBasedFlushPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_AT)
    }
}

impl FlushPolicy for CountBasedFlushPolicy {
    fn should_flush(&self) -> bool {
        self.count() >= self.flush_at
    }

    fn update_state(&self, _event: &Event) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }
}

/// Flushes every `interval` while the pipeline runs.
#[derive(Debug)]
pub struct FrequencyFlushPolicy {
    interval: Duration,
    token: Mutex<Option<CancellationToken>>,
}

impl FrequencyFlushPolicy {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            token: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_scheduled(&self) -> bool {
        self.token.lock().map(|t| t.is_some()).unwrap_or(false)
    }
}

impl FlushPolicy for FrequencyFlushPolicy {
    fn schedule(&self, trigger: FlushTrigger) {
        if self.interval.is_zero() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime, periodic flush disabled");
            return;
        };
        let Ok(mut slot) = self.token.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let period = self.interval;
        handle.spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => trigger.fire(),
                }
            }
        });
        *slot = Some(token);
    }

    fn unschedule(&self) {
        if let Ok(mut slot) = self.token.lock() {
            if let Some(token) = slot.take() {
                token.cancel();
            }
        }
    }

    fn should_flush(&self) -> bool {
        false
    }
}

/// Flushes on the first event after start, then never again.
#[derive(Debug, Default)]
pub struct StartupFlushPolicy {
    flushed: AtomicBool,
}

impl StartupFlushPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlushPolicy for StartupFlushPolicy {
    fn should_flush(&self) -> bool {
        !self.flushed.swap(true, Ordering::SeqCst)
    }
}

/// Policies used when none are configured.
pub fn default_policies(flush_at: usize, flush_interval: Duration) -> Vec<Arc<dyn FlushPolicy>> {
    vec![
        Arc::new(CountBasedFlushPolicy::new(flush_at)),
        Arc::new(FrequencyFlushPolicy::new(flush_interval)),
    ]
}
