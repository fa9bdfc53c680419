//! Remote source settings
//!
//! Fetched from `https://<cdnHost>/projects/<writeKey>/settings` and cached
//! under [`StorageKey::Settings`](crate::storage::StorageKey::Settings).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::events::JsonMap;
use crate::retry::{RetryConfig, RetryConfigParser};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Destination key -> destination settings
    #[serde(default)]
    pub integrations: JsonMap,
    #[serde(default)]
    pub plan: JsonMap,
    #[serde(default)]
    pub edge_function: JsonMap,
    /// Raw retry policy block, parsed by [`RetryConfigParser`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_config: Option<Value>,
}

/// Settings the first-party destination reads from its integrations entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorSettings {
    pub api_key: String,
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default)]
    pub unbundled_integrations: Vec<String>,
}

fn default_api_host() -> String {
    crate::config::DEFAULT_API_HOST.to_string()
}

impl Settings {
    /// Settings used before anything has been fetched or cached: only the
    /// first-party destination is enabled.
    pub fn with_collector(collector_key: &str, write_key: &str, api_host: &str) -> Self {
        let mut integrations = JsonMap::new();
        integrations.insert(
            collector_key.to_string(),
            json!({"apiKey": write_key, "apiHost": api_host}),
        );
        Self {
            integrations,
            ..Default::default()
        }
    }

    /// Lenient parse; unknown fields are ignored.
    pub fn from_json(raw: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn has_integration_settings(&self, key: &str) -> bool {
        self.integrations.contains_key(key)
    }

    /// Typed view of one destination's settings object.
    pub fn destination_settings<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.integrations.get(key)?;
        if !value.is_object() {
            return None;
        }
        match serde_json::from_value(value.clone()) {
            Ok(settings) => Some(settings),
            Err(e) => {
                tracing::warn!(destination = key, error = %e, "Unreadable destination settings");
                None
            }
        }
    }

    /// Add an empty settings entry so the destination counts as enabled.
    pub fn add_destination(&mut self, key: &str) {
        self.integrations
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(JsonMap::new()));
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfigParser::parse(self.http_config.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cdn_payload() {
        let raw = r#"{
            "integrations": {
                "Courier": {"apiKey": "wk", "apiHost": "eu.api.example/v1",
                            "unbundledIntegrations": ["Mixpanel"]},
                "Amplitude": {}
            },
            "plan": {"track": {}},
            "httpConfig": {"backoffConfig": {"enabled": false}},
            "somethingNew": 1
        }"#;
        let settings = Settings::from_json(raw).unwrap();

        assert!(settings.has_integration_settings("Amplitude"));
        assert!(!settings.has_integration_settings("Mixpanel"));

        let collector: CollectorSettings = settings.destination_settings("Courier").unwrap();
        assert_eq!(collector.api_host, "eu.api.example/v1");
        assert_eq!(collector.unbundled_integrations, vec!["Mixpanel".to_string()]);

        assert!(!settings.retry_config().backoff_config.enabled);
        assert!(settings.retry_config().rate_limit_config.enabled);
    }

    #[test]
    fn test_default_collector_settings() {
        let settings = Settings::with_collector("Courier", "wk", "api.example/v1");
        let collector: CollectorSettings = settings.destination_settings("Courier").unwrap();
        assert_eq!(collector.api_key, "wk");
        assert_eq!(collector.api_host, "api.example/v1");
        assert_eq!(settings.retry_config(), RetryConfig::default());
    }

    #[test]
    fn test_add_destination_keeps_existing() {
        let mut settings = Settings::with_collector("Courier", "wk", "h");
        settings.add_destination("Courier");
        settings.add_destination("Custom");
        assert_eq!(settings.integrations["Courier"]["apiKey"], "wk");
        assert!(settings.has_integration_settings("Custom"));
        assert!(settings.destination_settings::<CollectorSettings>("Custom").is_none());
    }
}
