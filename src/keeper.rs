// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The state keeper: capture, flush and restoration wired together.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::KeeperConfig;
use crate::error::{Error, Result};
use crate::event::{EventBus, KeeperEvent, StateUpdate};
use crate::host::Host;
use crate::observer::ChangeObserver;
use crate::restore::{RestorationOrchestrator, RestorationReport, RestorationStatus};
use crate::shutdown::{FlushReport, ShutdownCoordinator};
use crate::store::SnapshotStore;
use crate::types::EntityId;

/// The task feeding one host subscription into the observer.
struct Listener {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Listener {
    fn spawn(observer: Arc<ChangeObserver>, updates: mpsc::Receiver<StateUpdate>) -> Self {
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(observer.run(updates, stopped));
        Self { stop, task }
    }

    /// Signals the task to observe what is already queued and exit.
    fn stop(self) -> JoinHandle<()> {
        // An error means the task has already exited
        let _ = self.stop.send(());
        self.task
    }
}

/// Keeps the state of a set of lights across host restarts.
///
/// The `StateKeeper` owns the single [`SnapshotStore`] and shares it with the
/// change observer (which writes it) and the restoration orchestrator (which
/// reads it).
///
/// # Lifecycle
///
/// 1. [`start`](Self::start): load the snapshot file, subscribe to the host's
///    state changes, and restore recorded states in the background.
/// 2. While running, steady state changes are debounced and committed.
/// 3. [`shutdown`](Self::shutdown): stop listening, cancel restoration, and
///    flush every pending update before returning.
///
/// A disabled keeper does none of this. The keeper can be disabled and
/// re-enabled at runtime with [`set_enabled`](Self::set_enabled).
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use state_keeper::config::KeeperConfig;
/// use state_keeper::host::InMemoryHost;
/// use state_keeper::types::EntityId;
/// use state_keeper::StateKeeper;
///
/// #[tokio::main]
/// async fn main() -> state_keeper::Result<()> {
///     let config = KeeperConfig::new("/var/lib/keeper/lights.json")
///         .with_entity(EntityId::new("light.kitchen")?);
///     let keeper = StateKeeper::new(config, Arc::new(InMemoryHost::new()));
///
///     keeper.start().await;
///     let report = keeper.wait_for_restoration().await?;
///     println!("restored {} light(s)", report.restored.len());
///
///     // Flushes pending updates once the host signals shutdown
///     let (_stop, stopped) = tokio::sync::oneshot::channel::<()>();
///     keeper.run_until(stopped).await;
///     Ok(())
/// }
/// ```
pub struct StateKeeper<H: Host> {
    config: KeeperConfig,
    entities: RwLock<BTreeSet<EntityId>>,
    host: Arc<H>,
    store: Arc<SnapshotStore>,
    observer: Arc<ChangeObserver>,
    orchestrator: Arc<RestorationOrchestrator<H>>,
    coordinator: ShutdownCoordinator,
    event_bus: EventBus,
    listener: Mutex<Option<Listener>>,
    startup_restoration: Mutex<Option<JoinHandle<RestorationReport>>>,
    enabled: AtomicBool,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl<H: Host> StateKeeper<H> {
    /// Creates a keeper for `host`. Nothing happens until
    /// [`start`](Self::start).
    #[must_use]
    pub fn new(config: KeeperConfig, host: Arc<H>) -> Self {
        let event_bus = EventBus::new();
        let store = Arc::new(SnapshotStore::new(config.storage_path()));
        let observer = Arc::new(ChangeObserver::new(
            Arc::clone(&store),
            event_bus.clone(),
            config.debounce,
            config.entity_set(),
        ));
        let orchestrator = Arc::new(
            RestorationOrchestrator::new(
                Arc::clone(&host),
                config.retry.clone(),
                config.host_timeout,
                event_bus.clone(),
            )
            .with_transition(config.transition),
        );
        let coordinator = ShutdownCoordinator::new(
            Arc::clone(&observer),
            Arc::clone(&store),
            event_bus.clone(),
        );

        Self {
            entities: RwLock::new(config.entities.clone()),
            enabled: AtomicBool::new(config.enabled),
            config,
            host,
            store,
            observer,
            orchestrator,
            coordinator,
            event_bus,
            listener: Mutex::new(None),
            startup_restoration: Mutex::new(None),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Loads the snapshot file, starts capturing, and starts restoring.
    ///
    /// Returns once the file is loaded; restoration runs in the background,
    /// see [`wait_for_restoration`](Self::wait_for_restoration). Every
    /// restoration is cancellable (by [`reconfigure`](Self::reconfigure),
    /// [`set_enabled`](Self::set_enabled) or [`shutdown`](Self::shutdown))
    /// as soon as this returns. An unreadable snapshot file is logged and
    /// treated as empty. Calling `start` twice, or on a disabled keeper,
    /// does nothing.
    pub async fn start(&self) {
        if !self.is_enabled() {
            tracing::info!("State keeper disabled, not starting");
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("State keeper already started");
            return;
        }

        // The file is read before anything can write it
        if let Err(e) = self.store.open().await {
            tracing::warn!(
                path = %self.store.path().display(),
                error = %e,
                "Ignoring unreadable snapshot file"
            );
        }
        if !self.is_enabled() {
            tracing::info!("State keeper disabled while loading, not subscribing");
            return;
        }

        self.attach_listener();

        let records: Vec<_> = self.store.records().into_values().collect();
        let configured = self.entities();
        let restoration = self.orchestrator.prepare(records, &configured);
        *self.startup_restoration.lock() = Some(tokio::spawn(restoration.execute()));

        tracing::info!(
            entities = configured.len(),
            records = self.store.len(),
            "State keeper started"
        );
    }

    /// Waits for the restoration started by [`start`](Self::start).
    ///
    /// Returns an empty report if no restoration is outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RestorationFailed`] listing every entity that could
    /// not be restored, or [`Error::Disabled`] if the keeper is disabled.
    pub async fn wait_for_restoration(&self) -> Result<RestorationReport> {
        if !self.is_enabled() {
            return Err(Error::Disabled);
        }

        let restoration = self.startup_restoration.lock().take();
        let Some(restoration) = restoration else {
            return Ok(RestorationReport::default());
        };

        match restoration.await {
            Ok(report) => report.into_result(),
            Err(e) => {
                tracing::warn!(error = %e, "Startup restoration aborted");
                Ok(RestorationReport::default())
            }
        }
    }

    /// Stops capturing and flushes every pending update to disk.
    ///
    /// This is the host's shutdown hook; the host should wait for it before
    /// exiting. Updates the host sent before this call are captured and
    /// flushed, even if the listener had not picked them up yet. Running
    /// restorations are cancelled. Calling it again flushes nothing.
    pub async fn shutdown(&self) -> FlushReport {
        self.shut_down.store(true, Ordering::SeqCst);
        if !self.is_enabled() {
            return FlushReport::default();
        }

        let listener = self.listener.lock().take();
        if let Some(listener) = listener
            && let Err(e) = listener.stop().await
        {
            tracing::warn!(error = %e, "State update listener ended abnormally");
        }

        let cancelled = self.orchestrator.cancel_all();
        if cancelled > 0 {
            tracing::debug!(cancelled, "Cancelled running restorations");
        }

        let report = self.coordinator.flush().await;
        tracing::info!(flushed = report.total(), "State keeper shut down");
        report
    }

    /// Waits for `signal`, then shuts down.
    ///
    /// ```no_run
    /// # use state_keeper::{host::InMemoryHost, StateKeeper};
    /// # async fn example(keeper: StateKeeper<InMemoryHost>) {
    /// let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    /// keeper.start().await;
    /// # drop(stop);
    /// let report = keeper.run_until(stopped).await;
    /// assert!(report.is_complete());
    /// # }
    /// ```
    pub async fn run_until<F: Future>(&self, signal: F) -> FlushReport {
        signal.await;
        tracing::debug!("Shutdown signal received");
        self.shutdown().await
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Restores the given entities from the current snapshot, now.
    ///
    /// Entities without a record are ignored; recorded entities that are not
    /// configured are skipped. Entities whose restoration is already running
    /// are left to it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RestorationFailed`] listing every entity that could
    /// not be restored, or [`Error::Disabled`] if the keeper is disabled.
    pub async fn restore_now(
        &self,
        entity_ids: impl IntoIterator<Item = EntityId>,
    ) -> Result<RestorationReport> {
        if !self.is_enabled() {
            return Err(Error::Disabled);
        }

        let records: Vec<_> = entity_ids
            .into_iter()
            .filter_map(|entity_id| {
                let record = self.store.get(&entity_id);
                if record.is_none() {
                    tracing::debug!(%entity_id, "No recorded state to restore");
                }
                record
            })
            .collect();

        let configured = self.entities();
        self.orchestrator.run(records, &configured).await.into_result()
    }

    /// Replaces the set of managed entities.
    ///
    /// Pending updates and running restorations of removed entities are
    /// discarded; their records stay in the store. A running keeper
    /// resubscribes to the host with the new set. Returns the entities whose
    /// pending update was discarded.
    pub fn reconfigure(&self, entities: BTreeSet<EntityId>) -> Vec<EntityId> {
        let removed: Vec<EntityId> = {
            let mut current = self.entities.write();
            let removed = current.difference(&entities).cloned().collect();
            *current = entities;
            removed
        };

        if !self.is_enabled() {
            return Vec::new();
        }

        let dropped = self.observer.retain(self.entity_set());
        self.orchestrator.cancel(&removed);
        if self.is_running() {
            self.attach_listener();
        }

        tracing::info!(
            entities = self.entities.read().len(),
            removed = removed.len(),
            dropped = dropped.len(),
            "Configuration updated"
        );
        dropped
    }

    /// Enables or disables the keeper at runtime.
    ///
    /// Disabling stops listening to the host, cancels running restorations
    /// and discards pending updates without committing them; the snapshot
    /// file is left as it is. Re-enabling a running keeper resubscribes to
    /// the host; recorded states are not restored again until
    /// [`restore_now`](Self::restore_now). A keeper that was never started
    /// still needs [`start`](Self::start).
    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }

        if enabled {
            self.observer.retain(self.entity_set());
            if self.is_running() {
                self.attach_listener();
            }
            tracing::info!("State keeper enabled");
            return;
        }

        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            drop(listener.stop());
        }
        let cancelled = self.orchestrator.cancel_all();
        let dropped = self.observer.retain(HashSet::new());
        tracing::info!(
            cancelled,
            dropped = dropped.len(),
            "State keeper disabled"
        );
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Subscribes to keeper events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<KeeperEvent> {
        self.event_bus.subscribe()
    }

    /// Returns the configuration the keeper was created with.
    #[must_use]
    pub fn config(&self) -> &KeeperConfig {
        &self.config
    }

    /// Returns `true` unless the keeper is disabled, by configuration or by
    /// [`set_enabled`](Self::set_enabled).
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Returns the currently managed entities.
    #[must_use]
    pub fn entities(&self) -> BTreeSet<EntityId> {
        self.entities.read().clone()
    }

    /// Returns the snapshot store.
    #[must_use]
    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Returns the host the keeper drives.
    #[must_use]
    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    /// Returns the number of updates waiting for their debounce window.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.observer.pending_count()
    }

    /// Returns the restoration status of an entity.
    #[must_use]
    pub fn restoration_status(&self, entity_id: &EntityId) -> Option<RestorationStatus> {
        self.orchestrator.status(entity_id)
    }

    /// Returns the restoration status of every tracked entity.
    #[must_use]
    pub fn restoration_statuses(&self) -> HashMap<EntityId, RestorationStatus> {
        self.orchestrator.statuses()
    }

    fn entity_set(&self) -> HashSet<EntityId> {
        self.entities.read().iter().cloned().collect()
    }

    /// Started and not yet shut down.
    fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shut_down.load(Ordering::SeqCst)
    }

    /// Subscribes to the host and feeds the observer, replacing any previous
    /// subscription.
    fn attach_listener(&self) {
        let updates = self.host.subscribe_state_changes(&self.entity_set());
        let listener = Listener::spawn(Arc::clone(&self.observer), updates);
        let previous = self.listener.lock().replace(listener);
        if let Some(previous) = previous {
            // Exits on its own once its queue is observed
            drop(previous.stop());
        }
    }
}

impl<H: Host> Drop for StateKeeper<H> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.task.abort();
        }
    }
}

impl<H: Host> std::fmt::Debug for StateKeeper<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateKeeper")
            .field("enabled", &self.is_enabled())
            .field("entities", &self.entities.read().len())
            .field("store", &self.store)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::host::InMemoryHost;
    use crate::state::EntityState;

    fn id(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    fn config(dir: &TempDir) -> KeeperConfig {
        KeeperConfig::new(dir.path().join("lights.json"))
            .with_entities([id("light.a"), id("light.b")])
            .with_debounce(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(InMemoryHost::new());
        let keeper = StateKeeper::new(config(&dir), Arc::clone(&host));

        keeper.start().await;
        keeper.start().await;

        assert_eq!(host.subscriber_count(), 1);
        assert!(keeper.wait_for_restoration().await.unwrap().restored.is_empty());
    }

    #[tokio::test]
    async fn reconfigure_resubscribes_and_drops_pending() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(InMemoryHost::new());
        let keeper = StateKeeper::new(
            config(&dir).with_debounce(Duration::from_secs(60)),
            Arc::clone(&host),
        );
        keeper.start().await;

        host.push_update(StateUpdate::new(id("light.b"), EntityState::on()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(keeper.pending_count(), 1);

        let dropped = keeper.reconfigure(BTreeSet::from([id("light.a")]));
        assert_eq!(dropped, vec![id("light.b")]);
        assert_eq!(keeper.entities(), BTreeSet::from([id("light.a")]));

        // Updates for the removed entity no longer reach the keeper
        tokio::time::sleep(Duration::from_millis(50)).await;
        host.push_update(StateUpdate::new(id("light.b"), EntityState::off()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(keeper.pending_count(), 0);
        assert_eq!(host.subscriber_count(), 1);

        assert!(keeper.shutdown().await.is_empty());
        assert!(keeper.store().is_empty());
    }

    #[tokio::test]
    async fn disabled_keeper_refuses_operations() {
        let dir = TempDir::new().unwrap();
        let keeper = StateKeeper::new(config(&dir).disabled(), Arc::new(InMemoryHost::new()));

        keeper.start().await;
        assert!(!keeper.is_enabled());
        assert!(matches!(keeper.restore_now([id("light.a")]).await, Err(Error::Disabled)));
        assert!(matches!(keeper.wait_for_restoration().await, Err(Error::Disabled)));
        assert!(keeper.shutdown().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_observes_updates_still_queued() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(InMemoryHost::new());
        let keeper = StateKeeper::new(config(&dir), Arc::clone(&host));
        keeper.start().await;

        // Queued in the subscription; the listener has not run yet
        host.push_update(StateUpdate::new(id("light.a"), EntityState::off()));
        let report = keeper.shutdown().await;

        assert_eq!(report.committed, vec![id("light.a")]);
        assert_eq!(
            keeper.store().get("light.a").map(|record| record.state),
            Some(EntityState::off())
        );
    }

    #[tokio::test]
    async fn set_enabled_toggles_capture() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(InMemoryHost::new());
        let keeper = StateKeeper::new(
            config(&dir).with_debounce(Duration::from_secs(60)),
            Arc::clone(&host),
        );
        keeper.start().await;

        host.push_update(StateUpdate::new(id("light.a"), EntityState::on()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(keeper.pending_count(), 1);

        keeper.set_enabled(false);
        assert!(!keeper.is_enabled());
        assert_eq!(keeper.pending_count(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(host.subscriber_count(), 0);
        host.push_update(StateUpdate::new(id("light.b"), EntityState::on()));
        assert!(matches!(keeper.restore_now([id("light.a")]).await, Err(Error::Disabled)));

        keeper.set_enabled(true);
        assert_eq!(host.subscriber_count(), 1);
        host.push_update(StateUpdate::new(id("light.b"), EntityState::off()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(keeper.pending_count(), 1);

        let report = keeper.shutdown().await;
        assert_eq!(report.committed, vec![id("light.b")]);
        assert!(!keeper.store().contains("light.a"));
    }
}
