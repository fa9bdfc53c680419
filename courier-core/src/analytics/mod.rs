//! Analytics client
//!
//! [`Analytics`] is the host every plugin is attached to. It owns:
//! - The top-level [`Timeline`] all events run through
//! - Storage for identity, cached settings and the batch queue
//! - The current user identity, applied to each event before the timeline
//! - The current [`Settings`], broadcast to plugins on every change
//!
//! ## Startup
//!
//! 1. Open storage and restore (or mint) the anonymous id
//! 2. Register the startup queue, the library context plugin and, unless
//!    disabled, the first-party [`CollectorDestination`]
//! 3. Apply cached settings, else the configured defaults
//! 4. Fetch fresh settings in the background; events tracked meanwhile are
//!    parked in the startup queue and replayed once the fetch settles
//!
//! Plugins keep a [`WeakAnalytics`] if they need to call back into the host,
//! so dropping the last `Analytics` handle tears everything down.

mod configuration;
mod user_info;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::collector::{CollectorDestination, HttpClient, COLLECTOR_KEY};
use crate::error::Result;
use crate::events::{Event, JsonMap};
use crate::pipeline::{BatchUploader, EventPipeline};
use crate::plugin::context::ContextPlugin;
use crate::plugin::startup_queue::StartupQueue;
use crate::plugin::{DestinationPlugin, Plugin, Timeline, UpdateType};
use crate::settings::Settings;
use crate::storage::{Storage, StorageKey};

pub use configuration::Configuration;
pub use user_info::UserInfo;

struct Inner {
    configuration: Configuration,
    storage: Arc<dyn Storage>,
    http: Arc<HttpClient>,
    timeline: Timeline,
    startup_queue: Arc<StartupQueue>,
    user_info: RwLock<UserInfo>,
    settings: RwLock<Option<Settings>>,
    running: AtomicBool,
}

/// Cheap to clone; all clones share one client.
#[derive(Clone)]
pub struct Analytics {
    inner: Arc<Inner>,
}

/// Non-owning handle to an [`Analytics`] client.
#[derive(Clone, Default)]
pub struct WeakAnalytics {
    inner: Weak<Inner>,
}

impl WeakAnalytics {
    pub fn upgrade(&self) -> Option<Analytics> {
        self.inner.upgrade().map(|inner| Analytics { inner })
    }
}

impl Analytics {
    /// Build and start a client.
    ///
    /// The collector's pipeline and the settings fetch need a tokio runtime;
    /// without one the client still processes events but nothing is
    /// uploaded.
    pub fn new(configuration: Configuration) -> Result<Self> {
        configuration.validate()?;

        let storage = configuration
            .storage_provider
            .create(&configuration.write_key)?;
        let user_info = UserInfo::load(storage.as_ref());
        user_info.save(storage.as_ref());

        let http = Arc::new(HttpClient::new(
            configuration.write_key.clone(),
            &configuration.http,
        )?);

        let analytics = Self {
            inner: Arc::new(Inner {
                configuration,
                storage,
                http,
                timeline: Timeline::new(),
                startup_queue: Arc::new(StartupQueue::new()),
                user_info: RwLock::new(user_info),
                settings: RwLock::new(None),
                running: AtomicBool::new(false),
            }),
        };

        analytics.add(analytics.inner.startup_queue.clone());
        analytics.add(Arc::new(ContextPlugin));
        if analytics.configuration().auto_add_collector {
            analytics.add(Arc::new(analytics.collector_plugin()));
        }

        let initial = analytics.initial_settings();
        analytics.update_settings(initial, UpdateType::Initial);

        tracing::info!(
            write_key = %analytics.configuration().write_key,
            anonymous_id = %analytics.anonymous_id(),
            "Analytics client started"
        );

        if !analytics.configuration().fetch_settings {
            analytics.set_running(true);
            return Ok(analytics);
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let background = analytics.clone();
                handle.spawn(async move {
                    if let Err(e) = background.check_settings().await {
                        tracing::warn!(error = %e, "Settings fetch failed, keeping current settings");
                    }
                });
            }
            Err(_) => {
                tracing::warn!("No async runtime, skipping settings fetch");
                analytics.set_running(true);
            }
        }

        Ok(analytics)
    }

    fn collector_plugin(&self) -> DestinationPlugin {
        let configuration = self.configuration();
        let uploader: Arc<dyn BatchUploader> = match &configuration.uploader {
            Some(uploader) => Arc::clone(uploader),
            None => self.inner.http.clone(),
        };

        let mut pipeline = EventPipeline::new(
            configuration.write_key.clone(),
            Arc::clone(&self.inner.storage),
            uploader,
            configuration.api_host.clone(),
            configuration.policies(),
        );
        if let Some(time) = &configuration.time_provider {
            pipeline = pipeline.with_time_provider(Arc::clone(time));
        }
        CollectorDestination::new(pipeline).into_plugin()
    }

    /// Cached settings, then configured defaults, then collector-only.
    fn initial_settings(&self) -> Settings {
        if let Some(cached) = self.cached_settings() {
            return cached;
        }
        let configuration = self.configuration();
        configuration.default_settings.clone().unwrap_or_else(|| {
            Settings::with_collector(
                COLLECTOR_KEY,
                &configuration.write_key,
                &configuration.api_host,
            )
        })
    }

    fn cached_settings(&self) -> Option<Settings> {
        let raw = self.inner.storage.read(StorageKey::Settings)?;
        match Settings::from_json(&raw) {
            Ok(settings) => Some(settings),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable cached settings");
                None
            }
        }
    }

    pub fn downgrade(&self) -> WeakAnalytics {
        WeakAnalytics {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn configuration(&self) -> &Configuration {
        &self.inner.configuration
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    pub fn timeline(&self) -> &Timeline {
        &self.inner.timeline
    }

    /// False while settings are being fetched; events are parked meanwhile.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn set_running(&self, running: bool) {
        self.inner.running.store(running, Ordering::SeqCst);
        self.inner.startup_queue.set_running(running);
    }

    // ============================================
    // Events
    // ============================================

    pub fn track(&self, name: impl Into<String>, properties: JsonMap) {
        self.process(Event::track(name, properties));
    }

    /// Remember `user_id`, merge `traits` into the stored traits and send an
    /// identify event.
    pub fn identify(&self, user_id: impl Into<String>, traits: JsonMap) {
        let user_id = user_id.into();
        self.update_user_info(|info| {
            info.user_id = Some(user_id.clone());
            info.merge_traits(&traits);
        });
        self.process(Event::identify(user_id, traits));
    }

    pub fn screen(&self, title: impl Into<String>, category: impl Into<String>, properties: JsonMap) {
        self.process(Event::screen(title, category, properties));
    }

    pub fn group(&self, group_id: impl Into<String>, traits: JsonMap) {
        self.process(Event::group(group_id, traits));
    }

    /// Link the current identity to `new_id` and adopt it as the user id.
    pub fn alias(&self, new_id: impl Into<String>) {
        let new_id = new_id.into();
        let previous_id = {
            let info = self.user_info();
            info.user_id.unwrap_or(info.anonymous_id)
        };
        self.update_user_info(|info| info.user_id = Some(new_id.clone()));
        self.process(Event::alias(new_id, previous_id));
    }

    /// Apply identity and run `event` through the timeline.
    pub fn process(&self, mut event: Event) -> Option<Event> {
        {
            let info = self.user_info();
            event.anonymous_id = info.anonymous_id;
            if event.user_id.trim().is_empty() {
                if let Some(user_id) = info.user_id {
                    event.user_id = user_id;
                }
            }
        }
        self.inner.timeline.process(event)
    }

    // ============================================
    // Identity
    // ============================================

    fn user_info(&self) -> UserInfo {
        match self.inner.user_info.read() {
            Ok(info) => info.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update_user_info(&self, update: impl FnOnce(&mut UserInfo)) {
        let mut info = match self.inner.user_info.write() {
            Ok(info) => info,
            Err(poisoned) => poisoned.into_inner(),
        };
        update(&mut info);
        info.save(self.inner.storage.as_ref());
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_info().user_id
    }

    pub fn anonymous_id(&self) -> String {
        self.user_info().anonymous_id
    }

    pub fn traits(&self) -> Option<JsonMap> {
        self.user_info().traits
    }

    /// Forget the user: new anonymous id, no user id or traits. Destinations
    /// are reset too.
    pub fn reset(&self) {
        self.update_user_info(|info| *info = UserInfo::fresh());
        self.apply_closure(&|plugin| {
            if let Some(destination) = plugin.as_destination() {
                destination.reset();
            }
        });
    }

    // ============================================
    // Plugins
    // ============================================

    /// Set up and register `plugin`, then hand it the current settings.
    pub fn add(&self, plugin: Arc<dyn Plugin>) {
        self.inner.timeline.add(self, Arc::clone(&plugin));

        if let Some(settings) = self.settings() {
            if let Some(destination) = plugin.as_destination() {
                destination.set_enabled(settings.has_integration_settings(destination.key()));
            }
            plugin.update(&settings, UpdateType::Initial);
        }
    }

    pub fn remove(&self, plugin: &Arc<dyn Plugin>) -> bool {
        self.inner.timeline.remove(plugin)
    }

    pub fn find<T: Plugin>(&self) -> Option<Arc<T>> {
        self.inner.timeline.find::<T>()
    }

    pub fn find_all<T: Plugin>(&self) -> Vec<Arc<T>> {
        self.inner.timeline.find_all::<T>()
    }

    pub fn find_destination(&self, key: &str) -> Option<Arc<DestinationPlugin>> {
        self.inner.timeline.find_destination(key)
    }

    pub fn apply_closure(&self, closure: &dyn Fn(&Arc<dyn Plugin>)) {
        self.inner.timeline.apply_closure(closure);
    }

    /// Ask every destination to upload what it has queued. Returns at once.
    pub fn flush(&self) {
        self.apply_closure(&|plugin| {
            if let Some(destination) = plugin.as_destination() {
                destination.flush();
            }
        });
    }

    /// Flush the collector and wait for its upload cycle to finish.
    pub async fn flush_and_wait(&self) -> Result<()> {
        let Some(plugin) = self.find_destination(COLLECTOR_KEY) else {
            return Ok(());
        };
        let Some(collector) = plugin.destination::<CollectorDestination>() else {
            return Ok(());
        };
        collector.pipeline().flush_and_wait().await
    }

    /// Stop background work. The client should not be used afterwards.
    pub fn shutdown(&self) {
        self.set_running(false);
        self.apply_closure(&|plugin| {
            if let Some(destination) = plugin.as_destination() {
                destination.shutdown();
            }
        });
        tracing::info!(write_key = %self.configuration().write_key, "Analytics client shut down");
    }

    // ============================================
    // Settings
    // ============================================

    pub fn settings(&self) -> Option<Settings> {
        self.inner
            .settings
            .read()
            .ok()
            .and_then(|settings| settings.clone())
    }

    /// Store `settings` and broadcast them. Each destination is enabled iff
    /// the settings carry an entry for its key.
    pub fn update_settings(&self, settings: Settings, update_type: UpdateType) {
        if let Ok(mut current) = self.inner.settings.write() {
            *current = Some(settings.clone());
        }

        self.apply_closure(&|plugin| {
            if let Some(destination) = plugin.as_destination() {
                destination.set_enabled(settings.has_integration_settings(destination.key()));
            }
            plugin.update(&settings, update_type);
        });
    }

    /// Fetch settings from the CDN, cache and apply them. Events are parked
    /// while the fetch is in flight; the client is running again afterwards
    /// whatever the outcome.
    pub async fn check_settings(&self) -> Result<()> {
        self.set_running(false);

        let cdn_host = self.configuration().cdn_host.clone();
        let fetched = self.inner.http.fetch_settings(&cdn_host).await;
        let outcome = fetched.and_then(|settings| {
            let raw = serde_json::to_string(&settings)?;
            self.inner.storage.write(StorageKey::Settings, &raw)?;
            tracing::debug!(cdn_host = %cdn_host, "Settings refreshed");
            self.update_settings(settings, UpdateType::Refresh);
            Ok(())
        });

        self.set_running(true);
        outcome
    }

    /// Enable a destination that has no entry in remote settings.
    pub fn manually_enable_destination(&self, key: &str) {
        let settings = {
            let mut current = match self.inner.settings.write() {
                Ok(current) => current,
                Err(poisoned) => poisoned.into_inner(),
            };
            let settings = current.get_or_insert_with(Settings::default);
            settings.add_destination(key);
            settings.clone()
        };

        self.apply_closure(&|plugin| {
            if let Some(destination) = plugin.as_destination() {
                destination.set_enabled(settings.has_integration_settings(destination.key()));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Destination, Stage};
    use crate::storage::StorageProvider;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture {
        events: Mutex<Vec<Event>>,
        resets: Mutex<usize>,
    }

    impl Capture {
        fn take(&self) -> Vec<Event> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        fn record(&self, event: Event) -> Result<Option<Event>> {
            self.events.lock().unwrap().push(event.clone());
            Ok(Some(event))
        }
    }

    impl Destination for Capture {
        fn key(&self) -> &str {
            "Capture"
        }

        fn track(&self, event: Event) -> Result<Option<Event>> {
            self.record(event)
        }

        fn identify(&self, event: Event) -> Result<Option<Event>> {
            self.record(event)
        }

        fn alias(&self, event: Event) -> Result<Option<Event>> {
            self.record(event)
        }

        fn reset(&self) {
            *self.resets.lock().unwrap() += 1;
        }
    }

    #[derive(Default)]
    struct UpdateLog(Mutex<Vec<UpdateType>>);

    impl Plugin for UpdateLog {
        fn stage(&self) -> Stage {
            Stage::Utility
        }

        fn update(&self, _settings: &Settings, update_type: UpdateType) {
            self.0.lock().unwrap().push(update_type);
        }
    }

    fn offline_client() -> Analytics {
        let mut configuration = Configuration::new("wk");
        configuration.storage_provider = StorageProvider::InMemory;
        configuration.auto_add_collector = false;
        configuration.fetch_settings = false;
        Analytics::new(configuration).unwrap()
    }

    fn with_capture(analytics: &Analytics) -> Arc<DestinationPlugin> {
        let plugin = Arc::new(DestinationPlugin::new(Capture::default()));
        analytics.add(plugin.clone());
        analytics.manually_enable_destination("Capture");
        plugin
    }

    fn capture(plugin: &DestinationPlugin) -> &Capture {
        plugin.destination::<Capture>().unwrap()
    }

    #[test]
    fn test_rejects_missing_write_key() {
        let mut configuration = Configuration::new("");
        configuration.storage_provider = StorageProvider::InMemory;
        assert!(Analytics::new(configuration).is_err());
    }

    #[test]
    fn test_identity_applied_to_events() {
        let analytics = offline_client();
        let plugin = with_capture(&analytics);
        let anonymous_id = analytics.anonymous_id();
        assert_eq!(
            analytics.storage().read(StorageKey::AnonymousId),
            Some(anonymous_id.clone())
        );

        analytics.track("Anonymous", JsonMap::new());
        analytics.identify("u-1", json!({"plan": "pro"}).as_object().unwrap().clone());
        analytics.track("Known", JsonMap::new());

        let events = capture(&plugin).take();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.anonymous_id == anonymous_id));
        assert!(events[0].user_id.is_empty());
        assert_eq!(events[1].user_id, "u-1");
        assert_eq!(events[2].user_id, "u-1");
        assert_eq!(events[2].context["library"]["name"], "courier");
        assert_eq!(analytics.traits().unwrap()["plan"], "pro");
    }

    #[test]
    fn test_alias_and_reset() {
        let analytics = offline_client();
        let plugin = with_capture(&analytics);
        let anonymous_id = analytics.anonymous_id();

        analytics.alias("u-2");
        let events = capture(&plugin).take();
        match &events[0].kind {
            crate::events::EventKind::Alias { previous_id } => {
                assert_eq!(previous_id, &anonymous_id)
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert_eq!(analytics.user_id().as_deref(), Some("u-2"));

        analytics.reset();
        assert!(analytics.user_id().is_none());
        assert!(analytics.traits().is_none());
        assert_ne!(analytics.anonymous_id(), anonymous_id);
        assert_eq!(*capture(&plugin).resets.lock().unwrap(), 1);
    }

    #[test]
    fn test_destination_enabled_by_settings() {
        let analytics = offline_client();
        let plugin = Arc::new(DestinationPlugin::new(Capture::default()));
        analytics.add(plugin.clone());
        assert!(!plugin.is_enabled());

        analytics.track("Ignored", JsonMap::new());
        assert!(capture(&plugin).take().is_empty());

        let mut settings = analytics.settings().unwrap();
        settings.add_destination("Capture");
        analytics.update_settings(settings, UpdateType::Refresh);
        assert!(plugin.is_enabled());

        analytics.track("Delivered", JsonMap::new());
        assert_eq!(capture(&plugin).take().len(), 1);
        assert!(analytics.find_destination("Capture").is_some());
    }

    #[test]
    fn test_settings_broadcast() {
        let analytics = offline_client();
        let log = Arc::new(UpdateLog::default());
        analytics.add(log.clone());
        analytics.update_settings(Settings::default(), UpdateType::Refresh);

        assert_eq!(
            *log.0.lock().unwrap(),
            vec![UpdateType::Initial, UpdateType::Refresh]
        );
        assert!(analytics.find::<UpdateLog>().is_some());

        let log: Arc<dyn Plugin> = log;
        assert!(analytics.remove(&log));
        assert!(analytics.find::<UpdateLog>().is_none());
    }

    #[test]
    fn test_startup_queue_replays_in_order() {
        let analytics = offline_client();
        let plugin = with_capture(&analytics);

        analytics.set_running(false);
        analytics.track("first", JsonMap::new());
        analytics.track("second", JsonMap::new());
        assert!(capture(&plugin).take().is_empty());

        analytics.set_running(true);
        let names: Vec<String> = capture(&plugin)
            .take()
            .into_iter()
            .filter_map(|e| match e.kind {
                crate::events::EventKind::Track { event, .. } => Some(event),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_cached_settings_preferred() {
        let mut configuration = Configuration::new("wk");
        configuration.storage_provider = StorageProvider::InMemory;
        configuration.auto_add_collector = false;
        configuration.fetch_settings = false;
        configuration.default_settings = Some(Settings::default());
        let analytics = Analytics::new(configuration).unwrap();
        assert!(!analytics.settings().unwrap().has_integration_settings(COLLECTOR_KEY));

        let mut cached = Settings::default();
        cached.add_destination("Cached");
        analytics
            .storage()
            .write(StorageKey::Settings, &serde_json::to_string(&cached).unwrap())
            .unwrap();
        assert_eq!(analytics.initial_settings(), cached);
    }

    #[test]
    fn test_weak_handle_does_not_keep_client_alive() {
        let analytics = offline_client();
        let weak = analytics.downgrade();
        assert!(weak.upgrade().is_some());
        drop(analytics);
        assert!(weak.upgrade().is_none());
    }
}
