//! Library context enrichment.

use serde_json::json;

use super::{Plugin, Stage};
use crate::error::Result;
use crate::events::Event;

/// Library name reported in `context.library.name`.
pub const LIBRARY_NAME: &str = "courier";

/// Stamps `context.library` on every event.
#[derive(Debug, Default)]
pub struct ContextPlugin;

impl Plugin for ContextPlugin {
    fn name(&self) -> &str {
        "ContextPlugin"
    }

    fn stage(&self) -> Stage {
        Stage::Before
    }

    fn execute(&self, mut event: Event) -> Result<Option<Event>> {
        event.put_in_context(
            "library",
            json!({"name": LIBRARY_NAME, "version": crate::LIBRARY_VERSION}),
        );
        Ok(Some(event))
    }
}
