//! Durable mission backlog.
//!
//! The queue holds pending mission specifications and hands them out one at
//! a time under a single drain lock. A queue item is only marked promoted
//! after the corresponding mission record has been durably created, so a
//! failed promotion leaves the item pending for the next drain.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::mission::MissionSpec;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue item {0} not found")]
    NotFound(Uuid),

    #[error("queue item {0} is not pending")]
    NotPending(Uuid),

    #[error("failed to persist queue: {0}")]
    Persist(#[source] std::io::Error),

    #[error("invalid queue file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Promoted,
    Rejected,
}

/// A pending mission specification awaiting promotion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub spec: MissionSpec,
    pub enqueued_at: DateTime<Utc>,
    pub status: QueueItemStatus,
}

/// Ordered backlog of pending missions.
///
/// All state lives behind one mutex; whoever holds it owns the queue.
/// `try_drain` hands that lock out as a guard so the promotion protocol
/// (peek, create mission durably, then commit) runs under exclusion, while
/// a concurrent drain attempt observes "busy" and no-ops.
pub struct MissionQueue {
    items: Mutex<Vec<QueueItem>>,
    path: Option<PathBuf>,
}

impl MissionQueue {
    /// An ephemeral queue with no backing file (tests, dry runs).
    pub fn ephemeral() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            path: None,
        }
    }

    /// Load the queue from `path`, creating an empty one if absent.
    pub fn load(path: PathBuf) -> Result<Self, QueueError> {
        let items = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(QueueError::Persist)?;
            let items: Vec<QueueItem> = serde_json::from_str(&contents)?;
            info!(
                pending = items
                    .iter()
                    .filter(|i| i.status == QueueItemStatus::Pending)
                    .count(),
                "loaded mission queue from {}",
                path.display()
            );
            items
        } else {
            Vec::new()
        };
        Ok(Self {
            items: Mutex::new(items),
            path: Some(path),
        })
    }

    /// Append a new pending item and persist.
    pub async fn enqueue(&self, spec: MissionSpec) -> Result<QueueItem, QueueError> {
        let item = QueueItem {
            id: Uuid::new_v4(),
            spec,
            enqueued_at: Utc::now(),
            status: QueueItemStatus::Pending,
        };
        let mut items = self.items.lock().await;
        items.push(item.clone());
        self.persist(&items)?;
        info!(item = %item.id, priority = item.spec.priority, "enqueued mission spec");
        Ok(item)
    }

    /// Acquire the drain lock, or observe that another drain is running.
    ///
    /// Losing the race is normal, not exceptional: the caller simply has
    /// nothing to do.
    pub async fn try_drain(&self) -> Option<DrainGuard<'_>> {
        match self.items.try_lock() {
            Ok(guard) => Some(DrainGuard { queue: self, guard }),
            Err(_) => {
                debug!("queue drain already in progress");
                None
            }
        }
    }

    /// Pending items in drain order.
    pub async fn pending(&self) -> Vec<QueueItem> {
        let items = self.items.lock().await;
        let mut pending: Vec<QueueItem> = items
            .iter()
            .filter(|i| i.status == QueueItemStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.spec
                .priority
                .cmp(&a.spec.priority)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
        });
        pending
    }

    /// Reject a pending item (operator removal). The record is kept for
    /// audit; it just leaves the backlog.
    pub async fn remove(&self, id: Uuid) -> Result<QueueItem, QueueError> {
        let mut items = self.items.lock().await;
        let item = items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(QueueError::NotFound(id))?;
        if item.status != QueueItemStatus::Pending {
            return Err(QueueError::NotPending(id));
        }
        item.status = QueueItemStatus::Rejected;
        let removed = item.clone();
        self.persist(&items)?;
        info!(item = %id, "rejected queue item");
        Ok(removed)
    }

    /// Change a pending item's priority.
    pub async fn set_priority(&self, id: Uuid, priority: i32) -> Result<QueueItem, QueueError> {
        let mut items = self.items.lock().await;
        let item = items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(QueueError::NotFound(id))?;
        if item.status != QueueItemStatus::Pending {
            return Err(QueueError::NotPending(id));
        }
        item.spec.priority = priority;
        let updated = item.clone();
        self.persist(&items)?;
        Ok(updated)
    }

    fn persist(&self, items: &[QueueItem]) -> Result<(), QueueError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(QueueError::Persist)?;
        }
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(items)?;
        std::fs::write(&tmp, contents).map_err(QueueError::Persist)?;
        std::fs::rename(&tmp, path).map_err(QueueError::Persist)?;
        Ok(())
    }
}

/// Exclusive hold on the queue for one promotion attempt.
pub struct DrainGuard<'a> {
    queue: &'a MissionQueue,
    guard: MutexGuard<'a, Vec<QueueItem>>,
}

impl DrainGuard<'_> {
    /// Head of the backlog: highest priority first, ties by enqueue time.
    pub fn peek(&self) -> Option<&QueueItem> {
        self.guard
            .iter()
            .filter(|i| i.status == QueueItemStatus::Pending)
            .min_by(|a, b| {
                b.spec
                    .priority
                    .cmp(&a.spec.priority)
                    .then(a.enqueued_at.cmp(&b.enqueued_at))
            })
    }

    /// Mark `id` promoted, after its mission has been durably created.
    ///
    /// The in-memory state moves first; if the backing file cannot be
    /// written the promotion still stands (the file catches up on the next
    /// write) rather than risking a duplicate mission on retry.
    pub fn commit(&mut self, id: Uuid) -> Result<(), QueueError> {
        let item = self
            .guard
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(QueueError::NotFound(id))?;
        if item.status != QueueItemStatus::Pending {
            return Err(QueueError::NotPending(id));
        }
        item.status = QueueItemStatus::Promoted;
        if let Err(err) = self.queue.persist(&self.guard) {
            warn!(item = %id, "queue file write failed after promotion; state will catch up: {err}");
        }
        Ok(())
    }
}
