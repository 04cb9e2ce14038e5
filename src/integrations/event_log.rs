//! Built-in integration that appends lifecycle events to a JSONL file.
//!
//! Event persistence is an integration concern, not the core's; this is the
//! default observer wired up at startup so a deployment always has a durable
//! event trail under the state directory.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Integration, IntegrationFactory};
use crate::events::{Event, EventKind};

pub struct EventLogIntegration {
    path: PathBuf,
}

impl EventLogIntegration {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Factory for registration with the integration manager.
    pub fn factory(path: PathBuf) -> IntegrationFactory {
        Arc::new(move || {
            let integration: Arc<dyn Integration> =
                Arc::new(EventLogIntegration::new(path.clone()));
            Ok(integration)
        })
    }
}

#[async_trait]
impl Integration for EventLogIntegration {
    fn name(&self) -> &str {
        "event_log"
    }

    fn priority(&self) -> i32 {
        // Runs after anything that reacts to events; the log is passive.
        100
    }

    fn subscriptions(&self) -> HashSet<EventKind> {
        EventKind::ALL.iter().copied().collect()
    }

    async fn probe(&self) -> bool {
        match self.path.parent() {
            Some(parent) => std::fs::create_dir_all(parent).is_ok(),
            None => false,
        }
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}
