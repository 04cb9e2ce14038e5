//! Integration registry and lifecycle event dispatch.
//!
//! Integrations observe mission lifecycle events; they never sit on the
//! control path. Dispatch is synchronous and sequential in ascending
//! priority order, and a failing handler is logged and skipped, never
//! allowed to affect mission state or the other handlers.
//!
//! Handlers are registered through factories, so "reload" means re-invoking
//! the factory and atomically swapping the instance. No dynamic code
//! loading is involved.

mod event_log;

pub use event_log::EventLogIntegration;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::events::{Event, EventKind};

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("integration {0} is already registered")]
    Duplicate(String),

    #[error("integration {0} is not registered")]
    NotRegistered(String),

    #[error("failed to construct integration: {0}")]
    Construction(String),
}

/// The only coupling contract between the core and a plugin.
#[async_trait]
pub trait Integration: Send + Sync {
    fn name(&self) -> &str;

    /// Lower priority runs first.
    fn priority(&self) -> i32;

    fn subscriptions(&self) -> HashSet<EventKind>;

    /// Availability probe, run once at registration (and again on reload).
    async fn probe(&self) -> bool;

    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Constructs an integration instance; invoked at registration and on
/// every reload.
pub type IntegrationFactory =
    Arc<dyn Fn() -> anyhow::Result<Arc<dyn Integration>> + Send + Sync>;

struct Registered {
    instance: Arc<dyn Integration>,
    factory: IntegrationFactory,
    available: bool,
}

/// Introspection view of a registered handler.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationDescriptor {
    pub name: String,
    pub priority: i32,
    pub available: bool,
    pub subscriptions: Vec<EventKind>,
}

/// Owns the handler registry and fans lifecycle events out to it.
#[derive(Default)]
pub struct IntegrationManager {
    // Kept sorted by priority; same-priority handlers stay in
    // registration order (stable sort).
    handlers: RwLock<Vec<Registered>>,
}

impl IntegrationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. The factory is invoked once now and kept for
    /// reloads. Rejects duplicate names.
    pub async fn register(&self, factory: IntegrationFactory) -> Result<String, IntegrationError> {
        let instance =
            factory().map_err(|err| IntegrationError::Construction(format!("{err:#}")))?;
        let name = instance.name().to_string();

        let mut handlers = self.handlers.write().await;
        if handlers.iter().any(|h| h.instance.name() == name) {
            return Err(IntegrationError::Duplicate(name));
        }

        let available = instance.probe().await;
        if available {
            info!(integration = %name, priority = instance.priority(), "registered integration");
        } else {
            warn!(integration = %name, "integration registered but unavailable; it will be skipped at dispatch");
        }

        handlers.push(Registered {
            instance,
            factory,
            available,
        });
        handlers.sort_by_key(|h| h.instance.priority());
        Ok(name)
    }

    /// Remove a handler. Returns false if the name is unknown.
    pub async fn unregister(&self, name: &str) -> bool {
        let mut handlers = self.handlers.write().await;
        let before = handlers.len();
        handlers.retain(|h| h.instance.name() != name);
        let removed = handlers.len() < before;
        if removed {
            info!(integration = %name, "unregistered integration");
        }
        removed
    }

    /// Re-invoke the handler's factory and swap in the new instance.
    ///
    /// On any failure the previous instance stays registered and active;
    /// there is no partial swap. Returns whether the reload succeeded.
    pub async fn reload(&self, name: &str) -> bool {
        let mut handlers = self.handlers.write().await;
        let Some(index) = handlers.iter().position(|h| h.instance.name() == name) else {
            warn!(integration = %name, "reload requested for unknown integration");
            return false;
        };

        let fresh = match (handlers[index].factory)() {
            Ok(instance) => instance,
            Err(err) => {
                warn!(integration = %name, "reload failed, keeping previous instance: {err:#}");
                return false;
            }
        };
        if fresh.name() != name {
            warn!(
                integration = %name,
                rebuilt = fresh.name(),
                "reload produced a different name, keeping previous instance"
            );
            return false;
        }

        let available = fresh.probe().await;
        handlers[index].instance = fresh;
        handlers[index].available = available;
        handlers.sort_by_key(|h| h.instance.priority());
        info!(integration = %name, available, "reloaded integration");
        true
    }

    /// Deliver an event to every available, subscribed handler, in
    /// ascending priority order. Handler failures are contained here.
    ///
    /// The registry read lock is held for the duration, so registration
    /// changes exclude in-flight dispatch.
    pub async fn dispatch(&self, event: &Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            if !handler.available {
                continue;
            }
            if !handler.instance.subscriptions().contains(&event.kind) {
                continue;
            }
            if let Err(err) = handler.instance.handle(event).await {
                warn!(
                    integration = handler.instance.name(),
                    event = %event.kind,
                    mission = %event.mission_id,
                    "integration handler failed: {err:#}"
                );
            } else {
                debug!(
                    integration = handler.instance.name(),
                    event = %event.kind,
                    "dispatched event"
                );
            }
        }
    }

    pub async fn descriptors(&self) -> Vec<IntegrationDescriptor> {
        self.handlers
            .read()
            .await
            .iter()
            .map(|h| {
                let mut subscriptions: Vec<EventKind> =
                    h.instance.subscriptions().into_iter().collect();
                subscriptions.sort_by_key(|k| k.to_string());
                IntegrationDescriptor {
                    name: h.instance.name().to_string(),
                    priority: h.instance.priority(),
                    available: h.available,
                    subscriptions,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventData;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    struct RecordingIntegration {
        name: String,
        priority: i32,
        subscriptions: HashSet<EventKind>,
        probe_ok: bool,
        fail: bool,
        log: Arc<StdMutex<Vec<String>>>,
        generation: usize,
    }

    #[async_trait]
    impl Integration for RecordingIntegration {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn subscriptions(&self) -> HashSet<EventKind> {
            self.subscriptions.clone()
        }

        async fn probe(&self) -> bool {
            self.probe_ok
        }

        async fn handle(&self, event: &Event) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("synthetic handler failure");
            }
            self.log
                .lock()
                .expect("log lock")
                .push(format!("{}:{}:{}", self.name, self.generation, event.kind));
            Ok(())
        }
    }

    fn factory(
        name: &str,
        priority: i32,
        kinds: &[EventKind],
        probe_ok: bool,
        fail: bool,
        log: Arc<StdMutex<Vec<String>>>,
    ) -> IntegrationFactory {
        let name = name.to_string();
        let kinds: HashSet<EventKind> = kinds.iter().copied().collect();
        let generation = Arc::new(AtomicUsize::new(0));
        Arc::new(move || {
            let integration: Arc<dyn Integration> = Arc::new(RecordingIntegration {
                name: name.clone(),
                priority,
                subscriptions: kinds.clone(),
                probe_ok,
                fail,
                log: Arc::clone(&log),
                generation: generation.fetch_add(1, Ordering::SeqCst),
            });
            Ok(integration)
        })
    }

    fn event(kind: EventKind) -> Event {
        let data = match kind {
            EventKind::Error => EventData::Error {
                message: "boom".into(),
                context: serde_json::Map::new(),
            },
            _ => EventData::CycleCompleted {
                cycle: 1,
                exhausted: false,
            },
        };
        // The envelope kind follows the payload; for test purposes only
        // CycleCompleted and Error are exercised.
        Event::new(Uuid::new_v4(), None, Utc::now(), data)
    }

    #[tokio::test]
    async fn rejects_duplicate_names() {
        let manager = IntegrationManager::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        manager
            .register(factory("a", 0, &EventKind::ALL, true, false, log.clone()))
            .await
            .expect("first registration");
        assert!(matches!(
            manager
                .register(factory("a", 5, &EventKind::ALL, true, false, log))
                .await,
            Err(IntegrationError::Duplicate(name)) if name == "a"
        ));
    }

    #[tokio::test]
    async fn dispatch_runs_in_priority_order_and_isolates_failures() {
        let manager = IntegrationManager::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        manager
            .register(factory("late", 10, &EventKind::ALL, true, false, log.clone()))
            .await
            .expect("register late");
        manager
            .register(factory(
                "broken",
                5,
                &EventKind::ALL,
                true,
                true,
                log.clone(),
            ))
            .await
            .expect("register broken");
        manager
            .register(factory("early", 0, &EventKind::ALL, true, false, log.clone()))
            .await
            .expect("register early");

        manager.dispatch(&event(EventKind::CycleCompleted)).await;
        manager.dispatch(&event(EventKind::CycleCompleted)).await;

        let entries = log.lock().expect("log lock").clone();
        // The broken handler never logs, but both healthy handlers receive
        // every event in priority order.
        assert_eq!(
            entries,
            vec![
                "early:0:cycle_completed",
                "late:0:cycle_completed",
                "early:0:cycle_completed",
                "late:0:cycle_completed",
            ]
        );
    }

    #[tokio::test]
    async fn unavailable_handlers_are_registered_but_skipped() {
        let manager = IntegrationManager::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        manager
            .register(factory("offline", 0, &EventKind::ALL, false, false, log.clone()))
            .await
            .expect("register");

        manager.dispatch(&event(EventKind::Error)).await;
        assert!(log.lock().expect("log lock").is_empty());

        let descriptors = manager.descriptors().await;
        assert_eq!(descriptors.len(), 1);
        assert!(!descriptors[0].available);
    }

    #[tokio::test]
    async fn unsubscribed_events_are_not_delivered() {
        let manager = IntegrationManager::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        manager
            .register(factory(
                "errors_only",
                0,
                &[EventKind::Error],
                true,
                false,
                log.clone(),
            ))
            .await
            .expect("register");

        manager.dispatch(&event(EventKind::CycleCompleted)).await;
        assert!(log.lock().expect("log lock").is_empty());
        manager.dispatch(&event(EventKind::Error)).await;
        assert_eq!(log.lock().expect("log lock").len(), 1);
    }

    #[tokio::test]
    async fn reload_swaps_the_instance() {
        let manager = IntegrationManager::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        manager
            .register(factory("a", 0, &EventKind::ALL, true, false, log.clone()))
            .await
            .expect("register");

        assert!(manager.reload("a").await);
        manager.dispatch(&event(EventKind::CycleCompleted)).await;
        // Generation 1 proves the factory was re-invoked.
        assert_eq!(
            log.lock().expect("log lock").clone(),
            vec!["a:1:cycle_completed"]
        );
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_instance() {
        let manager = IntegrationManager::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let should_fail = Arc::new(AtomicBool::new(false));

        let name = "flaky".to_string();
        let log_for_factory = log.clone();
        let fail_flag = Arc::clone(&should_fail);
        let factory: IntegrationFactory = Arc::new(move || {
            if fail_flag.load(Ordering::SeqCst) {
                anyhow::bail!("plugin build broke");
            }
            let integration: Arc<dyn Integration> = Arc::new(RecordingIntegration {
                name: name.clone(),
                priority: 0,
                subscriptions: EventKind::ALL.iter().copied().collect(),
                probe_ok: true,
                fail: false,
                log: log_for_factory.clone(),
                generation: 0,
            });
            Ok(integration)
        });

        manager.register(factory).await.expect("register");
        should_fail.store(true, Ordering::SeqCst);
        assert!(!manager.reload("flaky").await);

        // The original instance still receives events.
        manager.dispatch(&event(EventKind::CycleCompleted)).await;
        assert_eq!(log.lock().expect("log lock").len(), 1);
    }

    #[tokio::test]
    async fn reload_of_unknown_name_is_false() {
        let manager = IntegrationManager::new();
        assert!(!manager.reload("ghost").await);
    }
}
