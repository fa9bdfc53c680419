use std::sync::Arc;

use super::{DestinationPlugin, Mediator, Plugin, Stage};
use crate::analytics::Analytics;
use crate::events::Event;

/// One mediator per [`Stage`].
#[derive(Default)]
pub struct Timeline {
    before: Mediator,
    enrichment: Mediator,
    destination: Mediator,
    after: Mediator,
    utility: Mediator,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mediator(&self, stage: Stage) -> &Mediator {
        match stage {
            Stage::Before => &self.before,
            Stage::Enrichment => &self.enrichment,
            Stage::Destination => &self.destination,
            Stage::After => &self.after,
            Stage::Utility => &self.utility,
        }
    }

    /// Run an event through Before, Enrichment, Destination and After.
    ///
    /// Destinations see the enriched event; the After stage receives the same
    /// enriched event regardless of what destinations returned.
    pub fn process(&self, event: Event) -> Option<Event> {
        let before = self.apply_stage(Stage::Before, Some(event));
        let enriched = self.apply_stage(Stage::Enrichment, before)?;

        self.destination.execute(enriched.clone());

        self.apply_stage(Stage::After, Some(enriched))
    }

    pub fn apply_stage(&self, stage: Stage, event: Option<Event>) -> Option<Event> {
        self.mediator(stage).execute(event?)
    }

    /// Set up `plugin` against `analytics` and register it. A failing setup is
    /// logged; the plugin is still registered.
    pub fn add(&self, analytics: &Analytics, plugin: Arc<dyn Plugin>) {
        if let Err(e) = plugin.setup(analytics) {
            tracing::warn!(plugin = plugin.name(), error = %e, "Plugin setup failed");
        }
        self.add_without_setup(plugin);
    }

    pub(crate) fn add_without_setup(&self, plugin: Arc<dyn Plugin>) {
        tracing::debug!(plugin = plugin.name(), stage = ?plugin.stage(), "Plugin added");
        self.mediator(plugin.stage()).add(plugin);
    }

    /// Remove `plugin` from every stage.
    pub fn remove(&self, plugin: &Arc<dyn Plugin>) -> bool {
        let mut removed = false;
        for stage in Stage::ALL {
            removed |= self.mediator(stage).remove(plugin);
        }
        removed
    }

    pub fn apply_closure(&self, closure: &dyn Fn(&Arc<dyn Plugin>)) {
        for stage in Stage::ALL {
            self.mediator(stage).apply_closure(closure);
        }
    }

    pub fn find<T: Plugin>(&self) -> Option<Arc<T>> {
        Stage::ALL
            .iter()
            .find_map(|stage| self.mediator(*stage).find::<T>())
    }

    pub fn find_all<T: Plugin>(&self) -> Vec<Arc<T>> {
        Stage::ALL
            .iter()
            .flat_map(|stage| self.mediator(*stage).find_all::<T>())
            .collect()
    }

    /// Destination registered under `key`.
    pub fn find_destination(&self, key: &str) -> Option<Arc<DestinationPlugin>> {
        self.destination
            .find_all::<DestinationPlugin>()
            .into_iter()
            .find(|d| d.key() == key)
    }
}
