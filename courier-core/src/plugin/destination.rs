//! Destination plugins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use super::{AsAny, Plugin, Stage, Timeline, UpdateType};
use crate::analytics::{Analytics, WeakAnalytics};
use crate::error::Result;
use crate::events::{Event, EventType};
use crate::settings::Settings;

/// Something that delivers events.
///
/// Every verb passes the event through unchanged by default; implement the
/// ones the destination cares about.
pub trait Destination: AsAny {
    /// Stable identifier, matched against settings and per-event integrations.
    fn key(&self) -> &str;

    fn setup(&self, _analytics: &Analytics) -> Result<()> {
        Ok(())
    }

    fn update(&self, _settings: &Settings, _update_type: UpdateType) {}

    fn track(&self, event: Event) -> Result<Option<Event>> {
        Ok(Some(event))
    }

    fn identify(&self, event: Event) -> Result<Option<Event>> {
        Ok(Some(event))
    }

    fn screen(&self, event: Event) -> Result<Option<Event>> {
        Ok(Some(event))
    }

    fn group(&self, event: Event) -> Result<Option<Event>> {
        Ok(Some(event))
    }

    fn alias(&self, event: Event) -> Result<Option<Event>> {
        Ok(Some(event))
    }

    fn flush(&self) {}

    fn reset(&self) {}

    /// Release background resources. The destination is not used afterwards.
    fn shutdown(&self) {}
}

/// Registers a [`Destination`] in the destination stage.
///
/// Owns a private [`Timeline`] whose Before/Enrichment/After plugins only
/// apply to this destination.
pub struct DestinationPlugin {
    destination: Box<dyn Destination>,
    timeline: Timeline,
    enabled: AtomicBool,
    analytics: RwLock<Option<WeakAnalytics>>,
}

impl DestinationPlugin {
    pub fn new<D: Destination>(destination: D) -> Self {
        Self {
            destination: Box::new(destination),
            timeline: Timeline::new(),
            enabled: AtomicBool::new(true),
            analytics: RwLock::new(None),
        }
    }

    pub fn key(&self) -> &str {
        self.destination.key()
    }

    /// The wrapped destination, if it is a `T`.
    pub fn destination<T: Destination>(&self) -> Option<&T> {
        (*self.destination).as_any().downcast_ref::<T>()
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether `event` should reach this destination. An explicit boolean or
    /// settings object for this key in the event's integrations wins over the
    /// settings-driven flag.
    pub fn is_enabled_for(&self, event: &Event) -> bool {
        event
            .integration_override(self.key())
            .unwrap_or_else(|| self.is_enabled())
    }

    fn host(&self) -> Option<Analytics> {
        self.analytics
            .read()
            .ok()?
            .as_ref()
            .and_then(WeakAnalytics::upgrade)
    }

    /// Add a destination-scoped plugin. It is set up immediately when the
    /// destination is already attached to a client, otherwise on attach.
    pub fn add(&self, plugin: Arc<dyn Plugin>) {
        match self.host() {
            Some(analytics) => self.timeline.add(&analytics, plugin),
            None => self.timeline.add_without_setup(plugin),
        }
    }

    pub fn remove(&self, plugin: &Arc<dyn Plugin>) -> bool {
        self.timeline.remove(plugin)
    }

    /// Run the private timeline and the destination verb for `event`.
    pub fn process(&self, event: Event) -> Result<Option<Event>> {
        if !self.is_enabled_for(&event) {
            return Ok(None);
        }

        let before = self.timeline.apply_stage(Stage::Before, Some(event));
        let Some(enriched) = self.timeline.apply_stage(Stage::Enrichment, before) else {
            return Ok(None);
        };

        let delivered = match enriched.event_type() {
            EventType::Track => self.destination.track(enriched)?,
            EventType::Identify => self.destination.identify(enriched)?,
            EventType::Screen => self.destination.screen(enriched)?,
            EventType::Group => self.destination.group(enriched)?,
            EventType::Alias => self.destination.alias(enriched)?,
        };

        Ok(self.timeline.apply_stage(Stage::After, delivered))
    }

    pub fn flush(&self) {
        self.destination.flush();
    }

    pub fn reset(&self) {
        self.destination.reset();
    }

    pub fn shutdown(&self) {
        self.destination.shutdown();
    }
}

impl Plugin for DestinationPlugin {
    fn name(&self) -> &str {
        self.key()
    }

    fn stage(&self) -> Stage {
        Stage::Destination
    }

    fn setup(&self, analytics: &Analytics) -> Result<()> {
        if let Ok(mut slot) = self.analytics.write() {
            *slot = Some(analytics.downgrade());
        }
        self.timeline.apply_closure(&|plugin| {
            if let Err(e) = plugin.setup(analytics) {
                tracing::warn!(
                    destination = self.key(),
                    plugin = plugin.name(),
                    error = %e,
                    "Destination sub-plugin setup failed"
                );
            }
        });
        self.destination.setup(analytics)
    }

    fn execute(&self, event: Event) -> Result<Option<Event>> {
        self.process(event)
    }

    fn update(&self, settings: &Settings, update_type: UpdateType) {
        self.destination.update(settings, update_type);
        self.timeline
            .apply_closure(&|plugin| plugin.update(settings, update_type));
    }

    fn as_destination(&self) -> Option<&DestinationPlugin> {
        Some(self)
    }
}
