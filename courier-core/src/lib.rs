//! # courier-core
//!
//! Core library for courier - a durable analytics event client.
//!
//! This library provides:
//! - The event model and a staged plugin timeline
//! - Size-bounded batch files on disk, plus a small key/value store
//! - A background pipeline that persists events and uploads batches
//! - Retry handling for rate limits and server errors, driven by remote settings
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Events flow through three layers:
//! - **Timeline:** Before, Enrichment, Destination and After plugins
//! - **Pipeline:** the first-party destination appends each event to the open
//!   batch file and, when a flush policy fires, uploads closed batches
//! - **Retry gate:** a pure state machine decides per batch whether to upload,
//!   wait, or drop; its state survives restarts
//!
//! ## Example
//!
//! ```rust,no_run
//! use courier_core::{Analytics, Config, Configuration};
//!
//! # async fn run() -> courier_core::Result<()> {
//! let config = Config::load()?;
//! let analytics = Analytics::new(Configuration::from_config(&config))?;
//!
//! analytics.track("Checkout Started", Default::default());
//! analytics.flush_and_wait().await?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use analytics::{Analytics, Configuration, UserInfo, WeakAnalytics};
pub use config::Config;
pub use error::{Error, Result};
pub use events::{Event, EventKind, EventType, JsonMap};
pub use settings::Settings;

// Public modules
pub mod analytics;
pub mod collector;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod pipeline;
pub mod plugin;
pub mod retry;
pub mod settings;
pub mod storage;

/// Version reported in `context.library` and the `User-Agent` header.
pub const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");
