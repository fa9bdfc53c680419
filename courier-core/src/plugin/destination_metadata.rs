//! Stamps `_metadata` so the server knows which destinations the device
//! already delivered to.

use std::sync::RwLock;

use super::{DestinationPlugin, Plugin, Stage, UpdateType};
use crate::analytics::{Analytics, WeakAnalytics};
use crate::collector::COLLECTOR_KEY;
use crate::error::Result;
use crate::events::{DestinationMetadata, Event};
use crate::settings::Settings;

#[derive(Default)]
pub struct DestinationMetadataPlugin {
    settings: RwLock<Settings>,
    analytics: RwLock<Option<WeakAnalytics>>,
}

impl DestinationMetadataPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn host(&self) -> Option<Analytics> {
        self.analytics
            .read()
            .ok()?
            .as_ref()
            .and_then(WeakAnalytics::upgrade)
    }

    /// Build metadata from the enabled device-mode destinations and the
    /// collector's list of server-side integrations.
    pub fn metadata_for(&self, destinations: &[std::sync::Arc<DestinationPlugin>]) -> DestinationMetadata {
        let bundled: Vec<String> = destinations
            .iter()
            .filter(|d| d.is_enabled() && d.key() != COLLECTOR_KEY)
            .map(|d| d.key().to_string())
            .collect();

        let unbundled = match self.settings.read() {
            Ok(settings) => settings
                .integrations
                .get(COLLECTOR_KEY)
                .and_then(|collector| collector.get("unbundledIntegrations"))
                .and_then(|list| list.as_array())
                .map(|list| {
                    list.iter()
                        .filter_map(|v| v.as_str())
                        .filter(|key| !bundled.iter().any(|b| b == key))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        DestinationMetadata {
            bundled,
            unbundled,
            bundled_ids: Vec::new(),
        }
    }
}

impl Plugin for DestinationMetadataPlugin {
    fn name(&self) -> &str {
        "DestinationMetadataPlugin"
    }

    fn stage(&self) -> Stage {
        Stage::Enrichment
    }

    fn setup(&self, analytics: &Analytics) -> Result<()> {
        if let Ok(mut slot) = self.analytics.write() {
            *slot = Some(analytics.downgrade());
        }
        Ok(())
    }

    fn execute(&self, mut event: Event) -> Result<Option<Event>> {
        let destinations = self
            .host()
            .map(|analytics| {
                analytics
                    .timeline()
                    .mediator(Stage::Destination)
                    .find_all::<DestinationPlugin>()
            })
            .unwrap_or_default();

        event.metadata = self.metadata_for(&destinations);
        Ok(Some(event))
    }

    fn update(&self, settings: &Settings, _update_type: UpdateType) {
        if let Ok(mut current) = self.settings.write() {
            *current = settings.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Destination;
    use serde_json::json;
    use std::sync::Arc;

    struct Named(&'static str);

    impl Destination for Named {
        fn key(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_bundled_and_unbundled() {
        let plugin = DestinationMetadataPlugin::new();
        let mut settings = Settings::default();
        settings.integrations.insert(
            COLLECTOR_KEY.to_string(),
            json!({"apiKey": "wk", "unbundledIntegrations": ["Amplitude", "Mixpanel"]}),
        );
        plugin.update(&settings, UpdateType::Initial);

        let amplitude = Arc::new(DestinationPlugin::new(Named("Amplitude")));
        let braze = Arc::new(DestinationPlugin::new(Named("Braze")));
        braze.set_enabled(false);
        let collector = Arc::new(DestinationPlugin::new(Named(COLLECTOR_KEY)));

        let metadata = plugin.metadata_for(&[amplitude, braze, collector]);
        assert_eq!(metadata.bundled, vec!["Amplitude".to_string()]);
        assert_eq!(metadata.unbundled, vec!["Mixpanel".to_string()]);
        assert!(metadata.bundled_ids.is_empty());
    }

    #[test]
    fn test_without_host_marks_nothing_bundled() {
        let plugin = DestinationMetadataPlugin::new();
        let event = plugin
            .execute(Event::track("a", Default::default()))
            .unwrap()
            .unwrap();
        assert!(event.metadata.bundled.is_empty());
        assert!(event.metadata.unbundled.is_empty());
    }
}
