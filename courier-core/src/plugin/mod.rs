//! Plugin framework
//!
//! Every event runs through a [`Timeline`] of stages:
//!
//! ```text
//!   Before ──▶ Enrichment ──▶ Destination (fan-out, results ignored) ──▶ After
//! ```
//!
//! Each stage is a [`Mediator`] holding an ordered list of plugins. A plugin
//! that returns `Ok(None)` drops the event; a plugin that errors or panics is
//! skipped for that event and the rest of the stage still runs.
//!
//! Destinations are wrapped in a [`DestinationPlugin`], which owns a private
//! timeline for destination-specific plugins and an enabled flag driven by
//! remote settings.
//!
//! ## Writing a plugin
//!
//! ```rust,ignore
//! use courier_core::plugin::{Plugin, Stage};
//! use courier_core::{Event, Result};
//!
//! struct Consent;
//!
//! impl Plugin for Consent {
//!     fn stage(&self) -> Stage { Stage::Before }
//!
//!     fn execute(&self, event: Event) -> Result<Option<Event>> {
//!         Ok(has_consent().then_some(event))
//!     }
//! }
//! ```

mod destination;
mod mediator;
mod timeline;

pub mod context;
pub mod destination_metadata;
pub mod startup_queue;

use std::any::Any;
use std::sync::Arc;

use crate::analytics::Analytics;
use crate::error::Result;
use crate::events::Event;
use crate::settings::Settings;

pub use destination::{Destination, DestinationPlugin};
pub use mediator::Mediator;
pub use timeline::Timeline;

/// Position of a plugin in the timeline. Fixed for the plugin's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Runs before any processing (consent gating, buffering)
    Before,
    /// Adds data to the event
    Enrichment,
    /// Delivers the event; results do not flow downstream
    Destination,
    /// Cleanup after delivery
    After,
    /// Only runs when invoked explicitly
    Utility,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Before,
        Stage::Enrichment,
        Stage::Destination,
        Stage::After,
        Stage::Utility,
    ];
}

/// Whether a settings update is the first one a plugin sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    Initial,
    Refresh,
}

/// Upcasting helpers for plugin lookup by concrete type.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A stage in event processing.
///
/// Plugins are shared (`Arc<dyn Plugin>`) and called from whichever thread
/// processes the event, so any state they keep needs interior mutability.
pub trait Plugin: AsAny {
    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn stage(&self) -> Stage;

    /// Called once when the plugin is added to a client.
    fn setup(&self, _analytics: &Analytics) -> Result<()> {
        Ok(())
    }

    /// Transform the event. `Ok(None)` drops it.
    fn execute(&self, event: Event) -> Result<Option<Event>> {
        Ok(Some(event))
    }

    /// Settings arrived or changed.
    fn update(&self, _settings: &Settings, _update_type: UpdateType) {}

    /// Destination plugins return themselves here.
    fn as_destination(&self) -> Option<&DestinationPlugin> {
        None
    }
}

/// Downcast a shared plugin to its concrete type.
pub(crate) fn downcast_plugin<T: Plugin>(plugin: &Arc<dyn Plugin>) -> Option<Arc<T>> {
    Arc::clone(plugin).into_any_arc().downcast::<T>().ok()
}
