//! Persisted retry document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Global pipeline state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    #[default]
    Ready,
    RateLimited,
}

/// Failure bookkeeping for one batch file.
///
/// A batch only has metadata after at least one retryable failure; success or
/// a permanent drop removes the entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchMetadata {
    pub failure_count: u32,
    pub next_retry_time: Option<i64>,
    pub first_failure_time: Option<i64>,
}

impl BatchMetadata {
    /// True when the backoff deadline has passed (or none is set).
    pub fn should_retry(&self, now: i64) -> bool {
        self.next_retry_time.map_or(true, |next| now >= next)
    }

    /// True when more than `max_duration_ms` has elapsed since the first failure.
    pub fn exceeds_max_duration(&self, now: i64, max_duration_ms: i64) -> bool {
        self.first_failure_time
            .map_or(false, |first| now - first > max_duration_ms)
    }
}

/// Retry state for one pipeline, keyed by batch file name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryState {
    pub pipeline_state: PipelineState,
    /// Epoch ms until which uploads are paused
    pub wait_until_time: Option<i64>,
    pub global_retry_count: u32,
    pub batch_metadata: BTreeMap<String, BatchMetadata>,
}

impl RetryState {
    pub fn is_rate_limited(&self, now: i64) -> bool {
        self.pipeline_state == PipelineState::RateLimited
            && self.wait_until_time.map_or(false, |until| now < until)
    }

    /// Copy of this state without `batch_file`'s metadata.
    pub fn without_batch(&self, batch_file: &str) -> RetryState {
        let mut next = self.clone();
        next.batch_metadata.remove(batch_file);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_shape() {
        let mut state = RetryState {
            pipeline_state: PipelineState::RateLimited,
            wait_until_time: Some(1_000),
            global_retry_count: 2,
            ..Default::default()
        };
        state.batch_metadata.insert(
            "wk-0".to_string(),
            BatchMetadata {
                failure_count: 1,
                next_retry_time: Some(500),
                first_failure_time: Some(0),
            },
        );

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["pipelineState"], "RATE_LIMITED");
        assert_eq!(value["waitUntilTime"], 1_000);
        assert_eq!(value["globalRetryCount"], 2);
        assert_eq!(value["batchMetadata"]["wk-0"]["failureCount"], 1);
        assert_eq!(value["batchMetadata"]["wk-0"]["firstFailureTime"], 0);
    }

    #[test]
    fn test_missing_fields_default() {
        let state: RetryState = serde_json::from_str(r#"{"globalRetryCount":3}"#).unwrap();
        assert_eq!(state.pipeline_state, PipelineState::Ready);
        assert_eq!(state.global_retry_count, 3);
        assert!(state.batch_metadata.is_empty());
    }

    #[test]
    fn test_rate_limited_window() {
        let state = RetryState {
            pipeline_state: PipelineState::RateLimited,
            wait_until_time: Some(100),
            ..Default::default()
        };
        assert!(state.is_rate_limited(99));
        assert!(!state.is_rate_limited(100));
        assert!(!RetryState::default().is_rate_limited(0));
    }

    #[test]
    fn test_batch_metadata_checks() {
        let meta = BatchMetadata {
            failure_count: 1,
            next_retry_time: Some(50),
            first_failure_time: Some(10),
        };
        assert!(!meta.should_retry(49));
        assert!(meta.should_retry(50));
        assert!(!meta.exceeds_max_duration(20, 10));
        assert!(meta.exceeds_max_duration(21, 10));
        assert!(BatchMetadata::default().should_retry(0));
    }
}
