//! Holds events until the client is running.
//!
//! Events tracked while settings are still being resolved are parked here
//! and replayed through the host, in arrival order, as soon as the client
//! flips to running. The queue is bounded; overflow evicts the oldest event.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use super::{Plugin, Stage};
use crate::analytics::{Analytics, WeakAnalytics};
use crate::error::Result;
use crate::events::Event;

/// Maximum number of parked events.
pub const STARTUP_QUEUE_MAX_SIZE: usize = 1000;

#[derive(Default)]
pub struct StartupQueue {
    running: AtomicBool,
    queued: Mutex<VecDeque<Event>>,
    analytics: RwLock<Option<WeakAnalytics>>,
}

impl StartupQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of parked events.
    pub fn len(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mirror the client's running flag. Turning it on replays everything
    /// that was parked.
    ///
    /// The flag flips under the queue lock, so an event is either parked
    /// before the drain or passed straight through after it.
    pub fn set_running(&self, running: bool) {
        let host = if running { self.host() } else { None };
        let parked: Vec<Event> = {
            let mut queue = self.lock_queue();
            self.running.store(running, Ordering::SeqCst);
            if host.is_some() {
                queue.drain(..).collect()
            } else {
                Vec::new()
            }
        };

        let Some(analytics) = host else {
            return;
        };
        if !parked.is_empty() {
            tracing::debug!(count = parked.len(), "Replaying startup queue");
        }
        for event in parked {
            analytics.process(event);
        }
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Event>> {
        match self.queued.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn host(&self) -> Option<Analytics> {
        self.analytics
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(WeakAnalytics::upgrade))
    }
}

impl Plugin for StartupQueue {
    fn name(&self) -> &str {
        "StartupQueue"
    }

    fn stage(&self) -> Stage {
        Stage::Before
    }

    fn setup(&self, analytics: &Analytics) -> Result<()> {
        if let Ok(mut slot) = self.analytics.write() {
            *slot = Some(analytics.downgrade());
        }
        Ok(())
    }

    fn execute(&self, event: Event) -> Result<Option<Event>> {
        let mut queue = self.lock_queue();
        if self.is_running() {
            return Ok(Some(event));
        }

        if queue.len() >= STARTUP_QUEUE_MAX_SIZE {
            if let Some(evicted) = queue.pop_front() {
                tracing::warn!(
                    message_id = %evicted.message_id,
                    "Startup queue full, dropping oldest event"
                );
            }
        }
        queue.push_back(event);
        Ok(None)
    }
}
