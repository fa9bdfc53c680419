//! Retry state persistence through the storage key/value contract.
//!
//! Loading never fails: a missing key, unreadable JSON or a schema mismatch
//! all produce a fresh [`RetryState`].

use super::state::RetryState;
use crate::storage::{Storage, StorageKey};

pub fn load_retry_state(storage: &dyn Storage) -> RetryState {
    let Some(raw) = storage.read(StorageKey::RetryState) else {
        return RetryState::default();
    };
    if raw.trim().is_empty() {
        return RetryState::default();
    }

    serde_json::from_str(&raw).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Discarding unreadable retry state");
        RetryState::default()
    })
}

/// Returns false (after logging) when the state could not be written.
pub fn save_retry_state(storage: &dyn Storage, state: &RetryState) -> bool {
    let result = serde_json::to_string(state)
        .map_err(crate::error::Error::from)
        .and_then(|json| storage.write(StorageKey::RetryState, &json));

    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to persist retry state");
            false
        }
    }
}

pub fn clear_retry_state(storage: &dyn Storage) -> bool {
    storage.remove(StorageKey::RetryState)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{BatchMetadata, PipelineState};
    use crate::storage::StorageProvider;

    #[test]
    fn test_save_and_load() {
        let storage = StorageProvider::InMemory.create("wk").unwrap();
        let mut state = RetryState {
            pipeline_state: PipelineState::RateLimited,
            wait_until_time: Some(42),
            global_retry_count: 1,
            ..Default::default()
        };
        state.batch_metadata.insert(
            "wk-0".to_string(),
            BatchMetadata {
                failure_count: 2,
                next_retry_time: Some(10),
                first_failure_time: Some(1),
            },
        );

        assert!(save_retry_state(storage.as_ref(), &state));
        assert_eq!(load_retry_state(storage.as_ref()), state);

        assert!(clear_retry_state(storage.as_ref()));
        assert_eq!(load_retry_state(storage.as_ref()), RetryState::default());
    }

    #[test]
    fn test_corrupt_state_loads_default() {
        let storage = StorageProvider::InMemory.create("wk").unwrap();
        for raw in ["", "{oops", r#"{"pipelineState":"SLEEPING"}"#, "[1,2]"] {
            storage.write(StorageKey::RetryState, raw).unwrap();
            assert_eq!(load_retry_state(storage.as_ref()), RetryState::default());
        }
    }
}
