use std::sync::Arc;

use crate::analytics::Analytics;
use crate::error::Result;
use crate::events::Event;
use crate::pipeline::EventPipeline;
use crate::plugin::destination_metadata::DestinationMetadataPlugin;
use crate::plugin::{Destination, DestinationPlugin, UpdateType};
use crate::settings::{CollectorSettings, Settings};

/// Key of the first-party destination in settings and integrations.
pub const COLLECTOR_KEY: &str = "Courier";

/// First-party destination: persists every event and uploads batches to the
/// collection endpoint through its [`EventPipeline`].
pub struct CollectorDestination {
    pipeline: EventPipeline,
}

impl CollectorDestination {
    pub fn new(pipeline: EventPipeline) -> Self {
        Self { pipeline }
    }

    /// Wrap in a [`DestinationPlugin`] with `_metadata` enrichment attached.
    pub fn into_plugin(self) -> DestinationPlugin {
        let plugin = DestinationPlugin::new(self);
        plugin.add(Arc::new(DestinationMetadataPlugin::new()));
        plugin
    }

    pub fn pipeline(&self) -> &EventPipeline {
        &self.pipeline
    }

    fn enqueue(&self, event: Event) -> Result<Option<Event>> {
        self.pipeline.put(event.clone());
        Ok(Some(event))
    }
}

impl Destination for CollectorDestination {
    fn key(&self) -> &str {
        COLLECTOR_KEY
    }

    fn setup(&self, _analytics: &Analytics) -> Result<()> {
        self.pipeline.start()
    }

    fn update(&self, settings: &Settings, update_type: UpdateType) {
        if let Some(collector) = settings.destination_settings::<CollectorSettings>(COLLECTOR_KEY) {
            tracing::debug!(api_host = %collector.api_host, ?update_type, "Collector settings applied");
            self.pipeline.set_api_host(collector.api_host);
        }
        self.pipeline.set_retry_config(settings.retry_config());
    }

    fn track(&self, event: Event) -> Result<Option<Event>> {
        self.enqueue(event)
    }

    fn identify(&self, event: Event) -> Result<Option<Event>> {
        self.enqueue(event)
    }

    fn screen(&self, event: Event) -> Result<Option<Event>> {
        self.enqueue(event)
    }

    fn group(&self, event: Event) -> Result<Option<Event>> {
        self.enqueue(event)
    }

    fn alias(&self, event: Event) -> Result<Option<Event>> {
        self.enqueue(event)
    }

    fn flush(&self) {
        self.pipeline.flush();
    }

    fn shutdown(&self) {
        self.pipeline.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{BatchUploader, UploadError};
    use crate::plugin::Stage;
    use crate::storage::StorageProvider;
    use async_trait::async_trait;
    use serde_json::json;

    struct Accepting;

    #[async_trait]
    impl BatchUploader for Accepting {
        async fn upload(&self, _host: &str, _body: Vec<u8>) -> std::result::Result<(), UploadError> {
            Ok(())
        }
    }

    fn collector() -> CollectorDestination {
        let storage = StorageProvider::InMemory.create("wk").unwrap();
        CollectorDestination::new(EventPipeline::new(
            "wk",
            storage,
            Arc::new(Accepting),
            "api.example/v1",
            Vec::new(),
        ))
    }

    #[test]
    fn test_settings_update_applies_host_and_retry_config() {
        let destination = collector();
        let mut settings = Settings::with_collector(COLLECTOR_KEY, "wk", "eu.example/v1");
        settings.http_config = Some(json!({"rateLimitConfig": {"enabled": false}}));

        destination.update(&settings, UpdateType::Refresh);

        assert_eq!(destination.pipeline().api_host(), "eu.example/v1");
        assert!(!destination.pipeline().retry_config().rate_limit_config.enabled);
        assert!(destination.pipeline().retry_config().backoff_config.enabled);
    }

    #[tokio::test]
    async fn test_enqueue_persists_events() {
        let destination = collector();
        destination.pipeline().start().unwrap();

        let out = destination
            .track(Event::track("Clicked", Default::default()))
            .unwrap();
        assert!(out.is_some());
        destination.pipeline().flush_and_wait().await.unwrap();

        assert!(destination
            .pipeline()
            .storage()
            .read_event_files()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_plugin_carries_metadata_enrichment() {
        let plugin = collector().into_plugin();
        assert_eq!(plugin.key(), COLLECTOR_KEY);
        assert_eq!(plugin.timeline().mediator(Stage::Enrichment).len(), 1);
        assert!(plugin.destination::<CollectorDestination>().is_some());
    }
}
