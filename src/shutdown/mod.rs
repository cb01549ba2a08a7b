// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronous flush of pending updates on shutdown.
//!
//! When the host stops, every update still inside its debounce window is
//! committed immediately, before the process exits. A user who dims a light
//! and restarts the host a second later gets the dimmed state back.

use std::sync::Arc;

use tokio::task::JoinSet;

use crate::error::PersistenceError;
use crate::event::{EventBus, KeeperEvent};
use crate::observer::ChangeObserver;
use crate::store::SnapshotStore;
use crate::types::EntityId;

/// Outcome of a shutdown flush.
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Entities whose pending record was written.
    pub committed: Vec<EntityId>,
    /// Entities whose pending record was already stored, or superseded by a
    /// later commit.
    pub unchanged: Vec<EntityId>,
    /// Entities whose pending record could not be written.
    pub failed: Vec<(EntityId, PersistenceError)>,
}

impl FlushReport {
    /// Returns `true` if nothing was pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.committed.is_empty() && self.unchanged.is_empty() && self.failed.is_empty()
    }

    /// Returns `true` if every pending record reached the store.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Returns the number of records that were pending.
    #[must_use]
    pub fn total(&self) -> usize {
        self.committed.len() + self.unchanged.len() + self.failed.len()
    }
}

/// Commits everything the observer still holds.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    observer: Arc<ChangeObserver>,
    store: Arc<SnapshotStore>,
    events: EventBus,
}

impl ShutdownCoordinator {
    /// Creates a coordinator for the given observer and store.
    #[must_use]
    pub fn new(observer: Arc<ChangeObserver>, store: Arc<SnapshotStore>, events: EventBus) -> Self {
        Self {
            observer,
            store,
            events,
        }
    }

    /// Cancels every debounce timer and commits all pending records.
    ///
    /// Returns once every commit has completed or failed; a failure of one
    /// entity does not stop the others. Calling it again with nothing pending
    /// returns an empty report and writes nothing.
    pub async fn flush(&self) -> FlushReport {
        let pending = self.observer.drain();
        let mut report = FlushReport::default();
        if pending.is_empty() {
            tracing::debug!("Nothing pending to flush");
            return report;
        }

        tracing::info!(pending = pending.len(), "Flushing pending snapshots");

        let mut commits = JoinSet::new();
        for update in pending {
            let store = Arc::clone(&self.store);
            commits.spawn_blocking(move || {
                let entity_id = update.record.entity_id.clone();
                let captured_at = update.record.captured_at;
                (
                    entity_id,
                    captured_at,
                    store.put_sequenced(update.record, update.sequence),
                )
            });
        }

        while let Some(joined) = commits.join_next().await {
            match joined {
                Ok((entity_id, captured_at, Ok(true))) => {
                    self.events.publish(KeeperEvent::SnapshotCommitted {
                        entity_id: entity_id.clone(),
                        captured_at,
                    });
                    report.committed.push(entity_id);
                }
                Ok((entity_id, _, Ok(false))) => report.unchanged.push(entity_id),
                Ok((entity_id, _, Err(e))) => {
                    tracing::error!(%entity_id, error = %e, "Failed to flush snapshot");
                    report.failed.push((entity_id, e));
                }
                Err(e) => {
                    tracing::error!(error = %e, "Flush task aborted");
                }
            }
        }

        report.committed.sort();
        report.unchanged.sort();
        report.failed.sort_by(|a, b| a.0.cmp(&b.0));

        tracing::info!(
            committed = report.committed.len(),
            unchanged = report.unchanged.len(),
            failed = report.failed.len(),
            "Flush complete"
        );
        self.events.publish(KeeperEvent::Flushed {
            committed: report.committed.len(),
            failed: report.failed.len(),
        });

        report
    }
}
