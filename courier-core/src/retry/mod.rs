//! Retry gating for batch uploads
//!
//! The pieces are deliberately separated:
//!
//! - [`RetryConfig`] / [`RetryConfigParser`]: immutable, range-clamped policy
//!   built from the remote `httpConfig` settings block. Parsing never fails.
//! - [`RetryState`]: the persisted document (global rate-limit window plus
//!   per-batch failure metadata).
//! - [`RetryStateMachine`]: pure decision functions over state and a response
//!   or a batch query. No I/O.
//! - [`persistence`]: load/save helpers that go through the storage key/value
//!   contract and fall back to a fresh state on any read problem.
//! - [`TimeProvider`]: injectable clock used by the uploader.

mod config;
mod machine;
pub mod persistence;
mod state;
mod time;

pub use config::{BackoffConfig, RateLimitConfig, RetryBehavior, RetryConfig, RetryConfigParser};
pub use machine::{BatchDisposition, DropReason, ResponseInfo, RetryStateMachine, UploadDecision};
pub use persistence::{clear_retry_state, load_retry_state, save_retry_state};
pub use state::{BatchMetadata, PipelineState, RetryState};
pub use time::{SystemTimeProvider, TimeProvider};
