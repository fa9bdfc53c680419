//! First-party collector destination
//!
//! Ships events to the collection endpoint:
//!
//! - Every event is persisted to a local batch file before anything touches
//!   the network
//! - Uploads happen in the background when a flush policy fires
//! - Network failures never block `track`; failed batches stay on disk and
//!   are retried according to the retry policy from remote settings
//!
//! The endpoint and retry policy come from the `Courier` entry and the
//! `httpConfig` block of the source settings:
//!
//! ```json
//! {
//!   "integrations": {
//!     "Courier": {"apiKey": "wk_live_xxx", "apiHost": "api.courier.dev/v1"}
//!   },
//!   "httpConfig": {"backoffConfig": {"maxRetryCount": 50}}
//! }
//! ```

mod client;
mod destination;

pub use client::{parse_retry_after, settings_url, upload_url, HttpClient};
pub use destination::{CollectorDestination, COLLECTOR_KEY};
