use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use super::{downcast_plugin, Plugin, Stage};
use crate::events::Event;

/// Ordered plugin list for one stage.
///
/// `execute` iterates a snapshot taken under the lock, so plugins may be
/// added or removed concurrently (even by a plugin that is running).
#[derive(Default)]
pub struct Mediator {
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
}

impl Mediator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, plugin: Arc<dyn Plugin>) {
        match self.plugins.write() {
            Ok(mut plugins) => plugins.push(plugin),
            Err(poisoned) => poisoned.into_inner().push(plugin),
        }
    }

    /// Remove by identity. Returns true if the plugin was registered.
    pub fn remove(&self, plugin: &Arc<dyn Plugin>) -> bool {
        let mut plugins = match self.plugins.write() {
            Ok(plugins) => plugins,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = plugins.len();
        plugins.retain(|p| !Arc::ptr_eq(p, plugin));
        plugins.len() != before
    }

    /// Current plugins, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<dyn Plugin>> {
        match self.plugins.read() {
            Ok(plugins) => plugins.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every plugin in order.
    ///
    /// Destination-stage plugins receive the event but cannot change or drop
    /// it for the plugins after them.
    pub fn execute(&self, event: Event) -> Option<Event> {
        let mut result = event;

        for plugin in self.snapshot() {
            let input = result.clone();
            let outcome = catch_unwind(AssertUnwindSafe(|| plugin.execute(input)));

            let output = match outcome {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    tracing::warn!(plugin = plugin.name(), error = %e, "Plugin failed, skipping");
                    continue;
                }
                Err(_) => {
                    tracing::error!(plugin = plugin.name(), "Plugin panicked, skipping");
                    continue;
                }
            };

            if plugin.stage() == Stage::Destination {
                continue;
            }
            match output {
                Some(event) => result = event,
                None => {
                    tracing::debug!(plugin = plugin.name(), "Event dropped by plugin");
                    return None;
                }
            }
        }

        Some(result)
    }

    pub fn apply_closure(&self, closure: &dyn Fn(&Arc<dyn Plugin>)) {
        for plugin in self.snapshot() {
            closure(&plugin);
        }
    }

    pub fn find<T: Plugin>(&self) -> Option<Arc<T>> {
        self.snapshot().iter().find_map(downcast_plugin::<T>)
    }

    pub fn find_all<T: Plugin>(&self) -> Vec<Arc<T>> {
        self.snapshot()
            .iter()
            .filter_map(downcast_plugin::<T>)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::test_support::{Broken, Dropper, Recorder};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn event() -> Event {
        Event::track("Tested", Default::default())
    }

    #[test]
    fn test_plugins_run_in_order() {
        let mediator = Mediator::new();
        let first = Recorder::new("first", Stage::Enrichment);
        let second = Recorder::new("second", Stage::Enrichment);
        mediator.add(first.clone());
        mediator.add(second.clone());

        let result = mediator.execute(event()).unwrap();
        assert_eq!(result.context["first"], json!(true));
        assert_eq!(result.context["second"], json!(true));
        assert_eq!(second.seen.lock().unwrap()[0].context["first"], json!(true));
    }

    #[test]
    fn test_failing_plugin_is_isolated() {
        for panics in [false, true] {
            let mediator = Mediator::new();
            mediator.add(Arc::new(Broken { panics }));
            let after = Recorder::new("after", Stage::Enrichment);
            mediator.add(after.clone());

            let result = mediator.execute(event()).unwrap();
            assert_eq!(after.count(), 1);
            assert!(result.context.get("broken").is_none());
            assert_eq!(result.context["after"], json!(true));
        }
    }

    #[test]
    fn test_drop_short_circuits() {
        let mediator = Mediator::new();
        mediator.add(Arc::new(Dropper));
        let after = Recorder::new("after", Stage::Before);
        mediator.add(after.clone());

        assert!(mediator.execute(event()).is_none());
        assert_eq!(after.count(), 0);
    }

    #[test]
    fn test_remove_by_identity() {
        let mediator = Mediator::new();
        let a: Arc<dyn Plugin> = Recorder::new("same", Stage::Before);
        let b: Arc<dyn Plugin> = Recorder::new("same", Stage::Before);
        mediator.add(a.clone());
        mediator.add(b.clone());

        assert!(mediator.remove(&a));
        assert!(!mediator.remove(&a));
        assert_eq!(mediator.len(), 1);
        assert!(Arc::ptr_eq(&mediator.snapshot()[0], &b));
    }

    #[test]
    fn test_find_by_type() {
        let mediator = Mediator::new();
        mediator.add(Recorder::new("a", Stage::Before));
        mediator.add(Arc::new(Dropper));
        mediator.add(Recorder::new("b", Stage::Before));

        assert_eq!(mediator.find::<Recorder>().unwrap().label, "a");
        assert_eq!(mediator.find_all::<Recorder>().len(), 2);
        assert!(mediator.find::<Broken>().is_none());
    }

    /// Removes itself from its mediator the first time it runs.
    struct RemovesItself {
        mediator: Arc<Mediator>,
        handle: Mutex<Option<Arc<dyn Plugin>>>,
    }

    impl Plugin for RemovesItself {
        fn stage(&self) -> Stage {
            Stage::Enrichment
        }

        fn execute(&self, event: Event) -> crate::Result<Option<Event>> {
            if let Some(me) = self.handle.lock().unwrap().take() {
                assert!(self.mediator.remove(&me));
            }
            Ok(Some(event))
        }
    }

    #[test]
    fn test_concurrent_add_remove_during_execute() {
        let mediator = Arc::new(Mediator::new());
        let remover = Arc::new(RemovesItself {
            mediator: Arc::clone(&mediator),
            handle: Mutex::new(None),
        });
        let remover_handle: Arc<dyn Plugin> = remover.clone();
        *remover.handle.lock().unwrap() = Some(Arc::clone(&remover_handle));
        mediator.add(remover_handle);

        let done = AtomicBool::new(false);
        let runs = AtomicUsize::new(0);
        let mut kept: Vec<Arc<dyn Plugin>> = Vec::new();

        std::thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    while !done.load(Ordering::SeqCst) {
                        assert!(mediator.execute(event()).is_some());
                        runs.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }

            for i in 0..200 {
                let plugin: Arc<dyn Plugin> = Recorder::new(&format!("p{i}"), Stage::Enrichment);
                mediator.add(Arc::clone(&plugin));
                if i % 2 == 0 {
                    assert!(mediator.remove(&plugin));
                } else {
                    kept.push(plugin);
                }
            }
            while runs.load(Ordering::SeqCst) == 0 {
                std::thread::yield_now();
            }
            done.store(true, Ordering::SeqCst);
        });

        // The self-removal ran exactly once and every other mutation stuck.
        assert!(remover.handle.lock().unwrap().is_none());
        assert!(mediator.find::<RemovesItself>().is_none());
        let snapshot = mediator.snapshot();
        assert_eq!(snapshot.len(), kept.len());
        for (registered, expected) in snapshot.iter().zip(&kept) {
            assert!(Arc::ptr_eq(registered, expected));
        }

        let result = mediator.execute(event()).unwrap();
        assert_eq!(result.context.len(), kept.len());
    }
}
