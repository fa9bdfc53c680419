//! Retry policy and its lenient parser.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What to do with a batch after a non-2xx, non-rate-limited response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RetryBehavior {
    Retry,
    Drop,
}

impl RetryBehavior {
    /// Case-insensitive parse; anything unrecognized yields `default`.
    fn parse_or(value: Option<&str>, default: RetryBehavior) -> RetryBehavior {
        match value.map(|v| v.to_ascii_uppercase()).as_deref() {
            Some("RETRY") => RetryBehavior::Retry,
            Some("DROP") => RetryBehavior::Drop,
            _ => default,
        }
    }
}

/// Global 429 handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Consecutive 429s tolerated before the uploader complains
    pub max_retry_count: u32,
    /// Upper bound on any Retry-After wait, in seconds
    pub max_retry_interval: u64,
    /// Upper bound on the total rate-limited time, in seconds
    pub max_rate_limit_duration: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retry_count: 100,
            max_retry_interval: 300,
            max_rate_limit_duration: 43_200,
        }
    }
}

/// Per-batch exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    pub enabled: bool,
    pub max_retry_count: u32,
    /// Seconds; first retry waits this long
    pub base_backoff_interval: f64,
    /// Seconds; ceiling on a single backoff delay
    pub max_backoff_interval: u64,
    /// Seconds since first failure after which the batch is dropped
    pub max_total_backoff_duration: u64,
    pub jitter_percent: u32,
    #[serde(rename = "default4xxBehavior")]
    pub default_4xx_behavior: RetryBehavior,
    #[serde(rename = "default5xxBehavior")]
    pub default_5xx_behavior: RetryBehavior,
    pub unknown_code_behavior: RetryBehavior,
    pub status_code_overrides: BTreeMap<u16, RetryBehavior>,
}

fn default_status_code_overrides() -> BTreeMap<u16, RetryBehavior> {
    BTreeMap::from([
        (408, RetryBehavior::Retry),
        (410, RetryBehavior::Retry),
        (429, RetryBehavior::Retry),
        (460, RetryBehavior::Retry),
        (501, RetryBehavior::Drop),
        (505, RetryBehavior::Drop),
    ])
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retry_count: 100,
            base_backoff_interval: 0.5,
            max_backoff_interval: 300,
            max_total_backoff_duration: 43_200,
            jitter_percent: 10,
            default_4xx_behavior: RetryBehavior::Drop,
            default_5xx_behavior: RetryBehavior::Retry,
            unknown_code_behavior: RetryBehavior::Drop,
            status_code_overrides: default_status_code_overrides(),
        }
    }
}

/// Complete retry policy for one pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub rate_limit_config: RateLimitConfig,
    pub backoff_config: BackoffConfig,
}

impl RetryConfig {
    /// Both mechanisms disabled: 429/5xx are retried every cycle, other 4xx dropped.
    pub fn legacy() -> Self {
        Self {
            rate_limit_config: RateLimitConfig {
                enabled: false,
                ..Default::default()
            },
            backoff_config: BackoffConfig {
                enabled: false,
                ..Default::default()
            },
        }
    }

    pub fn is_legacy_mode(&self) -> bool {
        !self.rate_limit_config.enabled && !self.backoff_config.enabled
    }
}

// ============================================
// Parser
// ============================================

/// Builds a [`RetryConfig`] from the settings `httpConfig` object.
///
/// Every field is optional. Wrong types fall back to the field default,
/// numbers are clamped into their allowed range, and unknown behavior strings
/// fall back to the named default.
pub struct RetryConfigParser;

impl RetryConfigParser {
    pub fn parse(http_config: Option<&Value>) -> RetryConfig {
        let Some(Value::Object(root)) = http_config else {
            return RetryConfig::default();
        };

        RetryConfig {
            rate_limit_config: Self::parse_rate_limit(root.get("rateLimitConfig")),
            backoff_config: Self::parse_backoff(root.get("backoffConfig")),
        }
    }

    fn parse_rate_limit(value: Option<&Value>) -> RateLimitConfig {
        let defaults = RateLimitConfig::default();
        let Some(Value::Object(json)) = value else {
            return defaults;
        };

        RateLimitConfig {
            enabled: bool_field(json, "enabled").unwrap_or(defaults.enabled),
            max_retry_count: int_field(json, "maxRetryCount", 0, 1000)
                .map_or(defaults.max_retry_count, |v| v as u32),
            max_retry_interval: int_field(json, "maxRetryInterval", 1, 3600)
                .map_or(defaults.max_retry_interval, |v| v as u64),
            max_rate_limit_duration: int_field(json, "maxRateLimitDuration", 0, 604_800)
                .map_or(defaults.max_rate_limit_duration, |v| v as u64),
        }
    }

    fn parse_backoff(value: Option<&Value>) -> BackoffConfig {
        let defaults = BackoffConfig::default();
        let Some(Value::Object(json)) = value else {
            return defaults;
        };

        BackoffConfig {
            enabled: bool_field(json, "enabled").unwrap_or(defaults.enabled),
            max_retry_count: int_field(json, "maxRetryCount", 0, 1000)
                .map_or(defaults.max_retry_count, |v| v as u32),
            base_backoff_interval: json
                .get("baseBackoffInterval")
                .and_then(Value::as_f64)
                .filter(|v| v.is_finite())
                .map_or(defaults.base_backoff_interval, |v| v.clamp(0.1, 60.0)),
            max_backoff_interval: int_field(json, "maxBackoffInterval", 1, 3600)
                .map_or(defaults.max_backoff_interval, |v| v as u64),
            max_total_backoff_duration: int_field(json, "maxTotalBackoffDuration", 0, 604_800)
                .map_or(defaults.max_total_backoff_duration, |v| v as u64),
            jitter_percent: int_field(json, "jitterPercent", 0, 50)
                .map_or(defaults.jitter_percent, |v| v as u32),
            default_4xx_behavior: RetryBehavior::parse_or(
                str_field(json, "default4xxBehavior"),
                defaults.default_4xx_behavior,
            ),
            default_5xx_behavior: RetryBehavior::parse_or(
                str_field(json, "default5xxBehavior"),
                defaults.default_5xx_behavior,
            ),
            unknown_code_behavior: RetryBehavior::parse_or(
                str_field(json, "unknownCodeBehavior"),
                defaults.unknown_code_behavior,
            ),
            status_code_overrides: Self::parse_overrides(json.get("statusCodeOverrides")),
        }
    }

    fn parse_overrides(value: Option<&Value>) -> BTreeMap<u16, RetryBehavior> {
        let Some(Value::Object(json)) = value else {
            return default_status_code_overrides();
        };

        json.iter()
            .filter_map(|(key, value)| {
                let code = key.trim().parse::<u16>().ok()?;
                if !(100..=599).contains(&code) {
                    return None;
                }
                Some((code, RetryBehavior::parse_or(value.as_str(), RetryBehavior::Drop)))
            })
            .collect()
    }
}

fn bool_field(json: &Map<String, Value>, key: &str) -> Option<bool> {
    json.get(key).and_then(Value::as_bool)
}

fn str_field<'a>(json: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    json.get(key).and_then(Value::as_str)
}

/// Integer field clamped into `[min, max]`. Non-integers count as absent.
fn int_field(json: &Map<String, Value>, key: &str, min: i64, max: i64) -> Option<i64> {
    let value = json.get(key)?;
    let number = value
        .as_i64()
        .or_else(|| value.as_u64().map(|v| i64::try_from(v).unwrap_or(i64::MAX)))?;
    Some(number.clamp(min, max))
}
