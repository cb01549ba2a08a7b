// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Debounced capture of host state changes.
//!
//! The [`ChangeObserver`] holds at most one pending update per entity. Each
//! steady update replaces the pending one and restarts that entity's debounce
//! timer; when the timer expires without a newer update, the pending record
//! is committed to the [`SnapshotStore`]. Updates reported while the entity
//! is still transitioning are ignored.
//!
//! Timers are independent per entity: a burst on one light never delays the
//! commit of another.
//!
//! Every accepted update gets a sequence number from a process-wide counter.
//! Commits carry it to [`SnapshotStore::put_sequenced`], so a debounce commit
//! that loses a race against the shutdown flush never overwrites the newer
//! record.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::event::{EventBus, KeeperEvent, StateUpdate};
use crate::state::{EntityState, EntityStateRecord};
use crate::store::SnapshotStore;
use crate::types::EntityId;

/// An update waiting for its debounce window to close.
struct PendingUpdate {
    record: EntityStateRecord,
    sequence: u64,
    timer: JoinHandle<()>,
}

/// A pending record handed out by [`ChangeObserver::drain`].
#[derive(Debug, Clone, PartialEq)]
pub struct DrainedUpdate {
    /// The record to commit.
    pub record: EntityStateRecord,
    /// Order of the observation, for [`SnapshotStore::put_sequenced`].
    pub sequence: u64,
}

#[derive(Default)]
struct ObserverState {
    configured: HashSet<EntityId>,
    pending: HashMap<EntityId, PendingUpdate>,
}

/// Per-entity debouncer in front of the snapshot store.
///
/// Must be used from within a tokio runtime, since every accepted update
/// arms a timer task.
pub struct ChangeObserver {
    store: Arc<SnapshotStore>,
    events: EventBus,
    debounce: Duration,
    state: Mutex<ObserverState>,
    next_sequence: AtomicU64,
}

impl ChangeObserver {
    /// Creates an observer capturing the given entities.
    #[must_use]
    pub fn new(
        store: Arc<SnapshotStore>,
        events: EventBus,
        debounce: Duration,
        configured: HashSet<EntityId>,
    ) -> Self {
        Self {
            store,
            events,
            debounce,
            state: Mutex::new(ObserverState {
                configured,
                pending: HashMap::new(),
            }),
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Returns the debounce window.
    #[must_use]
    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Accepts a state update.
    ///
    /// Returns `true` if the update became the entity's pending update,
    /// `false` if it was ignored because the entity is transitioning or not
    /// configured.
    pub fn observe(self: &Arc<Self>, update: StateUpdate) -> bool {
        if update.transitioning {
            tracing::trace!(entity_id = %update.entity_id, "Ignoring transitional update");
            return false;
        }

        let mut state = self.state.lock();
        if !state.configured.contains(&update.entity_id) {
            tracing::trace!(entity_id = %update.entity_id, "Ignoring update for unmanaged entity");
            return false;
        }

        let entity_id = update.entity_id.clone();
        // Taken under the state lock, so sequences follow acceptance order
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let timer = self.arm_timer(entity_id.clone(), sequence);
        let pending = PendingUpdate {
            record: update.into_record(),
            sequence,
            timer,
        };

        if let Some(superseded) = state.pending.insert(entity_id, pending) {
            superseded.timer.abort();
        }
        true
    }

    /// Feeds every update from a host subscription into the observer until
    /// the stream ends or `stop` fires.
    ///
    /// On `stop` (or when its sender is dropped) the subscription is closed
    /// and every update the host already queued is still observed before
    /// returning, so awaiting the task guarantees nothing sent earlier is
    /// lost.
    pub async fn run(
        self: Arc<Self>,
        mut updates: mpsc::Receiver<StateUpdate>,
        mut stop: oneshot::Receiver<()>,
    ) {
        tracing::debug!("Starting state update listener");
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                update = updates.recv() => match update {
                    Some(update) => {
                        self.observe(update);
                    }
                    None => {
                        tracing::debug!("State update stream closed");
                        return;
                    }
                },
            }
        }

        updates.close();
        let mut queued = 0_usize;
        while let Ok(update) = updates.try_recv() {
            self.observe(update);
            queued += 1;
        }
        tracing::debug!(queued, "State update listener stopped");
    }

    /// Replaces the configured entity set.
    ///
    /// Pending updates of entities no longer configured are discarded without
    /// being committed. Returns the discarded entities.
    pub fn retain(&self, configured: HashSet<EntityId>) -> Vec<EntityId> {
        let mut guard = self.state.lock();
        let ObserverState {
            configured: current,
            pending,
        } = &mut *guard;
        *current = configured;

        let mut dropped: Vec<EntityId> = pending
            .keys()
            .filter(|entity_id| !current.contains(*entity_id))
            .cloned()
            .collect();
        dropped.sort();

        for entity_id in &dropped {
            if let Some(update) = pending.remove(entity_id) {
                update.timer.abort();
            }
            tracing::debug!(%entity_id, "Discarded pending update of removed entity");
            self.events.publish(KeeperEvent::SnapshotDropped {
                entity_id: entity_id.clone(),
            });
        }

        dropped
    }

    /// Cancels every debounce timer and hands back the pending records.
    ///
    /// Used by the shutdown flush; after this call nothing is pending.
    pub fn drain(&self) -> Vec<DrainedUpdate> {
        let mut state = self.state.lock();
        state
            .pending
            .drain()
            .map(|(_, update)| {
                update.timer.abort();
                DrainedUpdate {
                    record: update.record,
                    sequence: update.sequence,
                }
            })
            .collect()
    }

    /// Returns the number of pending updates.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Returns the pending state of an entity, if any.
    #[must_use]
    pub fn pending_state(&self, entity_id: &EntityId) -> Option<EntityState> {
        self.state
            .lock()
            .pending
            .get(entity_id)
            .map(|update| update.record.state.clone())
    }

    fn arm_timer(self: &Arc<Self>, entity_id: EntityId, sequence: u64) -> JoinHandle<()> {
        let observer = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(observer.debounce).await;
            observer.commit_expired(entity_id, sequence).await;
        })
    }

    async fn commit_expired(&self, entity_id: EntityId, sequence: u64) {
        let record = {
            let state = self.state.lock();
            match state.pending.get(&entity_id) {
                Some(update) if update.sequence == sequence => update.record.clone(),
                // Superseded, drained or dropped meanwhile
                _ => return,
            }
        };

        let captured_at = record.captured_at;
        match self.store.commit(record, sequence).await {
            Ok(written) => {
                if written {
                    self.events.publish(KeeperEvent::SnapshotCommitted {
                        entity_id: entity_id.clone(),
                        captured_at,
                    });
                }
                let mut state = self.state.lock();
                if state
                    .pending
                    .get(&entity_id)
                    .is_some_and(|update| update.sequence == sequence)
                {
                    state.pending.remove(&entity_id);
                }
            }
            Err(e) => {
                // Left pending so the shutdown flush retries it
                tracing::warn!(%entity_id, error = %e, "Failed to commit snapshot");
            }
        }
    }
}

impl std::fmt::Debug for ChangeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChangeObserver")
            .field("debounce", &self.debounce)
            .field("configured", &state.configured.len())
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::types::AttributeValue;

    const DEBOUNCE: Duration = Duration::from_millis(50);
    const SETTLE: Duration = Duration::from_millis(300);

    fn id(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    fn observer_in(dir: &TempDir, entities: &[&str]) -> Arc<ChangeObserver> {
        let store = Arc::new(SnapshotStore::new(dir.path().join("lights.json")));
        Arc::new(ChangeObserver::new(
            store,
            EventBus::new(),
            DEBOUNCE,
            entities.iter().map(|s| id(s)).collect(),
        ))
    }

    #[tokio::test]
    async fn burst_collapses_to_last_update() {
        let dir = TempDir::new().unwrap();
        let observer = observer_in(&dir, &["light.kitchen"]);
        let mut events = observer.events.subscribe();

        for brightness in [10, 40, 90] {
            observer.observe(StateUpdate::new(
                id("light.kitchen"),
                EntityState::on().with_attribute("brightness", brightness),
            ));
        }
        assert_eq!(observer.pending_count(), 1);

        tokio::time::sleep(SETTLE).await;

        assert_eq!(observer.pending_count(), 0);
        let record = observer.store.get("light.kitchen").unwrap();
        assert_eq!(record.state.attribute("brightness"), Some(&90.into()));

        let event = events.recv().await.unwrap();
        assert_eq!(event.entity_id(), Some(&id("light.kitchen")));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn transitional_updates_are_ignored() {
        let dir = TempDir::new().unwrap();
        let observer = observer_in(&dir, &["light.kitchen"]);

        let update = StateUpdate::new(id("light.kitchen"), EntityState::on()).in_transition();
        assert!(!observer.observe(update));
        assert_eq!(observer.pending_count(), 0);

        tokio::time::sleep(SETTLE).await;
        assert!(observer.store.is_empty());
    }

    #[tokio::test]
    async fn unmanaged_entities_are_ignored() {
        let dir = TempDir::new().unwrap();
        let observer = observer_in(&dir, &["light.kitchen"]);

        assert!(!observer.observe(StateUpdate::new(id("switch.fan"), EntityState::on())));
        assert_eq!(observer.pending_count(), 0);
    }

    #[tokio::test]
    async fn entities_debounce_independently() {
        let dir = TempDir::new().unwrap();
        let observer = observer_in(&dir, &["light.a", "light.b"]);

        observer.observe(StateUpdate::new(id("light.a"), EntityState::on()));
        tokio::time::sleep(SETTLE).await;
        observer.observe(StateUpdate::new(id("light.b"), EntityState::off()));

        // light.a committed while light.b is still inside its window
        assert!(observer.store.contains("light.a"));
        assert_eq!(observer.pending_state(&id("light.b")), Some(EntityState::off()));

        tokio::time::sleep(SETTLE).await;
        assert_eq!(observer.store.len(), 2);
    }

    #[tokio::test]
    async fn drain_cancels_timers() {
        let dir = TempDir::new().unwrap();
        let observer = observer_in(&dir, &["light.a", "light.b"]);
        observer.observe(StateUpdate::new(id("light.a"), EntityState::on()));
        observer.observe(StateUpdate::new(id("light.b"), EntityState::on()));

        let drained = observer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(observer.pending_count(), 0);

        tokio::time::sleep(SETTLE).await;
        assert!(observer.store.is_empty());
    }

    #[tokio::test]
    async fn retain_discards_removed_entities() {
        let dir = TempDir::new().unwrap();
        let observer = observer_in(&dir, &["light.a", "light.b"]);
        let mut events = observer.events.subscribe();
        observer.observe(StateUpdate::new(id("light.a"), EntityState::on()));
        observer.observe(StateUpdate::new(id("light.b"), EntityState::on()));

        let dropped = observer.retain(HashSet::from([id("light.a")]));
        assert_eq!(dropped, vec![id("light.b")]);
        assert_eq!(
            events.recv().await.unwrap(),
            KeeperEvent::SnapshotDropped {
                entity_id: id("light.b")
            }
        );

        tokio::time::sleep(SETTLE).await;
        assert!(observer.store.contains("light.a"));
        assert!(!observer.store.contains("light.b"));

        // No longer accepted
        assert!(!observer.observe(StateUpdate::new(id("light.b"), EntityState::off())));
    }

    #[tokio::test]
    async fn run_consumes_subscription() {
        let dir = TempDir::new().unwrap();
        let observer = observer_in(&dir, &["light.a"]);
        let (tx, rx) = mpsc::channel(8);
        let (_stop, stopped) = oneshot::channel();
        let listener = tokio::spawn(Arc::clone(&observer).run(rx, stopped));

        tx.send(StateUpdate::new(id("light.a"), EntityState::on()))
            .await
            .unwrap();
        drop(tx);
        listener.await.unwrap();

        assert_eq!(observer.pending_count(), 1);
        tokio::time::sleep(SETTLE).await;
        assert!(observer.store.contains("light.a"));
    }

    #[tokio::test]
    async fn stop_observes_queued_updates() {
        let dir = TempDir::new().unwrap();
        let observer = observer_in(&dir, &["light.a", "light.b"]);
        let (tx, rx) = mpsc::channel(8);
        tx.try_send(StateUpdate::new(id("light.a"), EntityState::on()))
            .unwrap();
        tx.try_send(StateUpdate::new(id("light.b"), EntityState::off()))
            .unwrap();

        // Stopped before the listener ever ran
        let (stop, stopped) = oneshot::channel();
        stop.send(()).unwrap();
        Arc::clone(&observer).run(rx, stopped).await;

        assert_eq!(observer.pending_count(), 2);
        assert_eq!(observer.pending_state(&id("light.b")), Some(EntityState::off()));
        assert!(tx.try_send(StateUpdate::new(id("light.a"), EntityState::off())).is_err());
    }

    #[tokio::test]
    async fn drain_hands_out_sequences_in_observation_order() {
        let dir = TempDir::new().unwrap();
        let observer = observer_in(&dir, &["light.a", "light.b"]);
        observer.observe(StateUpdate::new(id("light.a"), EntityState::on()));
        observer.observe(StateUpdate::new(id("light.b"), EntityState::on()));
        observer.observe(StateUpdate::new(id("light.a"), EntityState::off()));

        let mut drained = observer.drain();
        drained.sort_by_key(|update| update.sequence);

        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].record.entity_id, id("light.b"));
        assert_eq!(drained[1].record.state, EntityState::off());
    }

    fn shared_brightness(task: usize) -> i64 {
        i64::try_from(task).unwrap() * 100
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_keep_one_pending_update_per_entity() {
        let dir = TempDir::new().unwrap();
        let names = ["light.a", "light.b", "light.c", "light.d", "light.shared"];
        let observer = observer_in(&dir, &names);

        let mut producers = tokio::task::JoinSet::new();
        for (task, name) in names.iter().take(4).enumerate() {
            let observer = Arc::clone(&observer);
            let own = id(name);
            producers.spawn(async move {
                for brightness in 0_i64..25 {
                    observer.observe(StateUpdate::new(
                        own.clone(),
                        EntityState::on().with_attribute("brightness", brightness),
                    ));
                    // Every producer also hammers the shared light
                    observer.observe(StateUpdate::new(
                        id("light.shared"),
                        EntityState::on().with_attribute("brightness", shared_brightness(task)),
                    ));
                    tokio::task::yield_now().await;
                }
            });
        }
        while let Some(joined) = producers.join_next().await {
            joined.unwrap();
        }

        assert!(observer.pending_count() <= names.len());
        tokio::time::sleep(SETTLE).await;

        assert_eq!(observer.pending_count(), 0);
        assert_eq!(observer.store.len(), names.len());
        for name in &names[..4] {
            let record = observer.store.get(*name).unwrap();
            assert_eq!(record.state.attribute("brightness"), Some(&24.into()));
        }
        let shared = observer.store.get("light.shared").unwrap();
        let pushed: Vec<AttributeValue> = (0..4)
            .map(|task| shared_brightness(task).into())
            .collect();
        assert!(
            pushed
                .iter()
                .any(|value| shared.state.attribute("brightness") == Some(value))
        );
    }
}
