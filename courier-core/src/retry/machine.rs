//! Pure retry decisions.
//!
//! Both entry points take the current state by reference and return a new
//! one; nothing here touches storage or the network. The jitter source is the
//! only impurity and is bounded by the configured percentage.

use rand::Rng;

use super::config::{RetryBehavior, RetryConfig};
use super::state::{BatchMetadata, PipelineState, RetryState};

/// Why a batch was permanently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    MaxRetriesExceeded,
    MaxDurationExceeded,
    NonRetryableError,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            DropReason::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            DropReason::MaxDurationExceeded => "MAX_DURATION_EXCEEDED",
            DropReason::NonRetryableError => "NON_RETRYABLE_ERROR",
        };
        f.write_str(reason)
    }
}

/// Gate result for one batch file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadDecision {
    Proceed,
    SkipThisBatch,
    SkipAllBatches,
    DropBatch(DropReason),
}

/// Whether a batch file leaves the queue after a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDisposition {
    Delete,
    Keep,
}

/// Outcome of one upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInfo {
    pub status_code: u16,
    pub retry_after_seconds: Option<u64>,
    /// Batch identifier (the file name)
    pub batch_file: String,
    /// Epoch ms at which the response was observed
    pub current_time: i64,
}

/// Decision functions over [`RetryState`] for a fixed [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryStateMachine {
    config: RetryConfig,
}

impl RetryStateMachine {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Fold an upload response into the state.
    pub fn handle_response(
        &self,
        state: &RetryState,
        response: &ResponseInfo,
    ) -> (RetryState, BatchDisposition) {
        let code = response.status_code;

        if (200..300).contains(&code) {
            let mut next = state.without_batch(&response.batch_file);
            next.pipeline_state = PipelineState::Ready;
            next.wait_until_time = None;
            next.global_retry_count = 0;
            return (next, BatchDisposition::Delete);
        }

        if self.config.is_legacy_mode() {
            return if code == 429 || (500..600).contains(&code) {
                (state.clone(), BatchDisposition::Keep)
            } else {
                (state.without_batch(&response.batch_file), BatchDisposition::Delete)
            };
        }

        if code == 429 && self.config.rate_limit_config.enabled {
            let max_interval = self.config.rate_limit_config.max_retry_interval;
            let wait_secs = response
                .retry_after_seconds
                .unwrap_or(max_interval)
                .min(max_interval);

            let mut next = state.clone();
            next.pipeline_state = PipelineState::RateLimited;
            next.wait_until_time = Some(response.current_time + secs_to_ms(wait_secs));
            next.global_retry_count = next.global_retry_count.saturating_add(1);
            return (next, BatchDisposition::Keep);
        }

        match self.resolve_behavior(code) {
            RetryBehavior::Retry if self.config.backoff_config.enabled => {
                (self.schedule_retry(state, response), BatchDisposition::Keep)
            }
            _ => (state.without_batch(&response.batch_file), BatchDisposition::Delete),
        }
    }

    /// Decide whether `batch_file` may be uploaded at `now`.
    pub fn should_upload_batch(
        &self,
        state: &RetryState,
        batch_file: &str,
        now: i64,
    ) -> (UploadDecision, RetryState) {
        if self.config.is_legacy_mode() {
            return (UploadDecision::Proceed, state.clone());
        }

        if state.is_rate_limited(now) {
            return (UploadDecision::SkipAllBatches, state.clone());
        }

        let mut next = state.clone();
        if next.pipeline_state == PipelineState::RateLimited {
            next.pipeline_state = PipelineState::Ready;
            next.wait_until_time = None;
        }

        let Some(metadata) = next.batch_metadata.get(batch_file) else {
            return (UploadDecision::Proceed, next);
        };

        let backoff = &self.config.backoff_config;
        if metadata.failure_count >= backoff.max_retry_count {
            next.batch_metadata.remove(batch_file);
            return (UploadDecision::DropBatch(DropReason::MaxRetriesExceeded), next);
        }

        if metadata.exceeds_max_duration(now, secs_to_ms(backoff.max_total_backoff_duration)) {
            next.batch_metadata.remove(batch_file);
            return (UploadDecision::DropBatch(DropReason::MaxDurationExceeded), next);
        }

        if !metadata.should_retry(now) {
            return (UploadDecision::SkipThisBatch, next);
        }

        (UploadDecision::Proceed, next)
    }

    fn schedule_retry(&self, state: &RetryState, response: &ResponseInfo) -> RetryState {
        let now = response.current_time;
        let existing = state.batch_metadata.get(&response.batch_file);
        let failure_count = existing.map_or(0, |m| m.failure_count).saturating_add(1);
        let first_failure_time = existing.and_then(|m| m.first_failure_time).unwrap_or(now);

        let mut next = state.clone();
        next.batch_metadata.insert(
            response.batch_file.clone(),
            BatchMetadata {
                failure_count,
                next_retry_time: Some(now + self.backoff_ms(failure_count)),
                first_failure_time: Some(first_failure_time),
            },
        );
        next
    }

    /// `min(base * 2^(n-1), max)` seconds in ms, plus up to `jitter%` of that,
    /// never exceeding `max`.
    pub fn backoff_ms(&self, failure_count: u32) -> i64 {
        let backoff = &self.config.backoff_config;
        let max_ms = secs_to_ms(backoff.max_backoff_interval) as f64;
        let exponent = failure_count.saturating_sub(1).min(62) as i32;
        let exponential = backoff.base_backoff_interval * 1000.0 * 2f64.powi(exponent);
        let capped = exponential.min(max_ms);

        let jitter_range = capped * f64::from(backoff.jitter_percent) / 100.0;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(0.0..=jitter_range)
        } else {
            0.0
        };

        (capped + jitter).min(max_ms) as i64
    }

    fn resolve_behavior(&self, code: u16) -> RetryBehavior {
        let backoff = &self.config.backoff_config;
        if let Some(behavior) = backoff.status_code_overrides.get(&code) {
            return *behavior;
        }
        match code {
            400..=499 => backoff.default_4xx_behavior,
            500..=599 => backoff.default_5xx_behavior,
            _ => backoff.unknown_code_behavior,
        }
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::config::{BackoffConfig, RateLimitConfig};

    const NOW: i64 = 1_700_000_000_000;

    fn response(code: u16, batch: &str) -> ResponseInfo {
        ResponseInfo {
            status_code: code,
            retry_after_seconds: None,
            batch_file: batch.to_string(),
            current_time: NOW,
        }
    }

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            backoff_config: BackoffConfig {
                jitter_percent: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn failing_state(batch: &str, failure_count: u32) -> RetryState {
        let mut state = RetryState {
            pipeline_state: PipelineState::RateLimited,
            wait_until_time: Some(NOW - 1),
            global_retry_count: 4,
            ..Default::default()
        };
        state.batch_metadata.insert(
            batch.to_string(),
            BatchMetadata {
                failure_count,
                next_retry_time: Some(NOW - 1),
                first_failure_time: Some(NOW - 10),
            },
        );
        state
    }

    #[test]
    fn test_success_clears_state() {
        let machine = RetryStateMachine::new(RetryConfig::default());
        let state = failing_state("wk-1", 3);

        let (next, disposition) = machine.handle_response(&state, &response(200, "wk-1"));
        assert_eq!(disposition, BatchDisposition::Delete);
        assert!(!next.batch_metadata.contains_key("wk-1"));
        assert_eq!(next.global_retry_count, 0);
        assert_eq!(next.pipeline_state, PipelineState::Ready);
        assert_eq!(next.wait_until_time, None);
    }

    #[test]
    fn test_429_clamps_retry_after() {
        let machine = RetryStateMachine::new(RetryConfig::default());
        let mut info = response(429, "wk-1");
        info.retry_after_seconds = Some(500);

        let (next, disposition) = machine.handle_response(&RetryState::default(), &info);
        assert_eq!(disposition, BatchDisposition::Keep);
        assert_eq!(next.pipeline_state, PipelineState::RateLimited);
        assert_eq!(next.wait_until_time, Some(NOW + 300_000));
        assert_eq!(next.global_retry_count, 1);
    }

    #[test]
    fn test_429_without_header_uses_max_interval() {
        let config = RetryConfig {
            rate_limit_config: RateLimitConfig {
                max_retry_interval: 30,
                ..Default::default()
            },
            ..Default::default()
        };
        let machine = RetryStateMachine::new(config);

        let (next, _) = machine.handle_response(&RetryState::default(), &response(429, "wk-1"));
        assert_eq!(next.wait_until_time, Some(NOW + 30_000));
    }

    #[test]
    fn test_5xx_schedules_backoff() {
        let machine = RetryStateMachine::new(no_jitter());

        let (next, disposition) =
            machine.handle_response(&RetryState::default(), &response(503, "wk-1"));
        assert_eq!(disposition, BatchDisposition::Keep);
        let meta = &next.batch_metadata["wk-1"];
        assert_eq!(meta.failure_count, 1);
        assert_eq!(meta.first_failure_time, Some(NOW));
        assert_eq!(meta.next_retry_time, Some(NOW + 500));

        let mut later = response(503, "wk-1");
        later.current_time = NOW + 1_000;
        let (next, _) = machine.handle_response(&next, &later);
        let meta = &next.batch_metadata["wk-1"];
        assert_eq!(meta.failure_count, 2);
        assert_eq!(meta.first_failure_time, Some(NOW));
        assert_eq!(meta.next_retry_time, Some(NOW + 1_000 + 1_000));
    }

    #[test]
    fn test_4xx_drops_unless_overridden() {
        let machine = RetryStateMachine::new(RetryConfig::default());
        let state = failing_state("wk-1", 1);

        let (next, disposition) = machine.handle_response(&state, &response(400, "wk-1"));
        assert_eq!(disposition, BatchDisposition::Delete);
        assert!(next.batch_metadata.is_empty());

        let (next, disposition) = machine.handle_response(&state, &response(408, "wk-1"));
        assert_eq!(disposition, BatchDisposition::Keep);
        assert_eq!(next.batch_metadata["wk-1"].failure_count, 2);

        let (_, disposition) = machine.handle_response(&state, &response(501, "wk-1"));
        assert_eq!(disposition, BatchDisposition::Delete);

        let (_, disposition) = machine.handle_response(&state, &response(302, "wk-1"));
        assert_eq!(disposition, BatchDisposition::Delete);
    }

    #[test]
    fn test_retry_with_backoff_disabled_drops() {
        let config = RetryConfig {
            backoff_config: BackoffConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let machine = RetryStateMachine::new(config);

        let (next, disposition) =
            machine.handle_response(&failing_state("wk-1", 1), &response(500, "wk-1"));
        assert_eq!(disposition, BatchDisposition::Delete);
        assert!(next.batch_metadata.is_empty());
    }

    #[test]
    fn test_backoff_grows_then_plateaus() {
        let config = RetryConfig {
            backoff_config: BackoffConfig {
                base_backoff_interval: 1.0,
                max_backoff_interval: 10,
                jitter_percent: 20,
                ..Default::default()
            },
            ..Default::default()
        };
        let machine = RetryStateMachine::new(config);

        let mut previous_floor = 0;
        for n in 1..=10u32 {
            let delay = machine.backoff_ms(n);
            let floor = (1_000i64 << (n - 1)).min(10_000);
            assert!(delay >= floor, "attempt {n}: {delay} < {floor}");
            assert!(delay <= 10_000, "attempt {n}: {delay} above cap");
            assert!(delay as f64 <= floor as f64 * 1.2 + 1.0);
            assert!(floor >= previous_floor);
            previous_floor = floor;
        }
        assert_eq!(machine.backoff_ms(40), 10_000);
    }

    #[test]
    fn test_rate_limited_skips_all() {
        let machine = RetryStateMachine::new(RetryConfig::default());
        let state = RetryState {
            pipeline_state: PipelineState::RateLimited,
            wait_until_time: Some(NOW + 60_000),
            ..Default::default()
        };

        let (decision, next) = machine.should_upload_batch(&state, "wk-1", NOW);
        assert_eq!(decision, UploadDecision::SkipAllBatches);
        assert_eq!(next, state);
    }

    #[test]
    fn test_expired_rate_limit_resets_to_ready() {
        let machine = RetryStateMachine::new(RetryConfig::default());
        let state = RetryState {
            pipeline_state: PipelineState::RateLimited,
            wait_until_time: Some(NOW),
            global_retry_count: 2,
            ..Default::default()
        };

        let (decision, next) = machine.should_upload_batch(&state, "wk-1", NOW);
        assert_eq!(decision, UploadDecision::Proceed);
        assert_eq!(next.pipeline_state, PipelineState::Ready);
        assert_eq!(next.wait_until_time, None);
        assert_eq!(next.global_retry_count, 2);
    }

    #[test]
    fn test_max_retries_drops_batch() {
        let config = RetryConfig {
            backoff_config: BackoffConfig {
                max_retry_count: 3,
                jitter_percent: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let machine = RetryStateMachine::new(config);

        let mut state = RetryState::default();
        let mut now = NOW;
        for _ in 0..3 {
            let mut info = response(500, "wk-1");
            info.current_time = now;
            state = machine.handle_response(&state, &info).0;
            now += 60_000;
        }
        assert_eq!(state.batch_metadata["wk-1"].failure_count, 3);

        let (decision, next) = machine.should_upload_batch(&state, "wk-1", now);
        assert_eq!(
            decision,
            UploadDecision::DropBatch(DropReason::MaxRetriesExceeded)
        );
        assert!(!next.batch_metadata.contains_key("wk-1"));
    }

    #[test]
    fn test_max_duration_drops_batch() {
        let config = RetryConfig {
            backoff_config: BackoffConfig {
                max_total_backoff_duration: 60,
                ..Default::default()
            },
            ..Default::default()
        };
        let machine = RetryStateMachine::new(config);
        let mut state = RetryState::default();
        state.batch_metadata.insert(
            "wk-1".to_string(),
            BatchMetadata {
                failure_count: 1,
                next_retry_time: Some(NOW),
                first_failure_time: Some(NOW - 60_000),
            },
        );

        let (decision, _) = machine.should_upload_batch(&state, "wk-1", NOW);
        assert_eq!(decision, UploadDecision::Proceed);

        let (decision, next) = machine.should_upload_batch(&state, "wk-1", NOW + 1);
        assert_eq!(
            decision,
            UploadDecision::DropBatch(DropReason::MaxDurationExceeded)
        );
        assert!(next.batch_metadata.is_empty());
    }

    #[test]
    fn test_skip_until_next_retry_time() {
        let machine = RetryStateMachine::new(RetryConfig::default());
        let mut state = RetryState::default();
        state.batch_metadata.insert(
            "wk-1".to_string(),
            BatchMetadata {
                failure_count: 1,
                next_retry_time: Some(NOW + 5_000),
                first_failure_time: Some(NOW),
            },
        );

        let (decision, next) = machine.should_upload_batch(&state, "wk-1", NOW + 1_000);
        assert_eq!(decision, UploadDecision::SkipThisBatch);
        assert_eq!(next, state);

        let (decision, _) = machine.should_upload_batch(&state, "wk-2", NOW + 1_000);
        assert_eq!(decision, UploadDecision::Proceed);

        let (decision, _) = machine.should_upload_batch(&state, "wk-1", NOW + 5_000);
        assert_eq!(decision, UploadDecision::Proceed);
    }

    #[test]
    fn test_legacy_mode_pass_through() {
        let machine = RetryStateMachine::new(RetryConfig::legacy());
        let state = RetryState {
            pipeline_state: PipelineState::RateLimited,
            wait_until_time: Some(NOW + 60_000),
            ..failing_state("wk-1", 1000)
        };

        let (decision, _) = machine.should_upload_batch(&state, "wk-1", NOW);
        assert_eq!(decision, UploadDecision::Proceed);

        for code in [429u16, 500, 503] {
            let (next, disposition) = machine.handle_response(&state, &response(code, "wk-1"));
            assert_eq!(disposition, BatchDisposition::Keep);
            assert_eq!(next, state);
        }

        let (next, disposition) = machine.handle_response(&state, &response(404, "wk-1"));
        assert_eq!(disposition, BatchDisposition::Delete);
        assert!(next.batch_metadata.is_empty());

        let (next, disposition) = machine.handle_response(&state, &response(204, "wk-1"));
        assert_eq!(disposition, BatchDisposition::Delete);
        assert!(next.batch_metadata.is_empty());
    }
}
