// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Restoration of recorded states after a host restart.
//!
//! The [`RestorationOrchestrator`] drives every recorded, still-configured
//! entity back to its recorded state. Each entity runs in its own task:
//! check availability, send the state, and on any failure wait an
//! exponentially growing delay before trying again, up to the retry policy's
//! attempt limit. A slow or missing light never holds up the others.
//!
//! Failures are not reported one by one. Once every entity is terminal the
//! run produces a single [`RestorationReport`]; if anything failed, one error
//! is logged and one [`KeeperEvent::RestorationFailed`] is published.

mod report;
mod status;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::RetryPolicy;
use crate::error::{EntityFailure, HostError};
use crate::event::{EventBus, KeeperEvent};
use crate::host::Host;
use crate::state::{EntityState, EntityStateRecord};
use crate::types::EntityId;

pub use report::RestorationReport;
pub use status::RestorationStatus;

type StatusMap = Arc<RwLock<HashMap<EntityId, RestorationStatus>>>;
type Cancellations = Arc<Mutex<HashMap<EntityId, watch::Sender<bool>>>>;

/// Drives recorded entities back to their recorded states.
pub struct RestorationOrchestrator<H: Host> {
    host: Arc<H>,
    policy: RetryPolicy,
    host_timeout: Duration,
    transition: Option<Duration>,
    events: EventBus,
    statuses: StatusMap,
    cancellations: Cancellations,
}

impl<H: Host> RestorationOrchestrator<H> {
    /// Creates an orchestrator calling into `host`.
    #[must_use]
    pub fn new(
        host: Arc<H>,
        policy: RetryPolicy,
        host_timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            host,
            policy,
            host_timeout,
            transition: None,
            events,
            statuses: Arc::new(RwLock::new(HashMap::new())),
            cancellations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sets the fade time passed to the host with every restored state.
    #[must_use]
    pub fn with_transition(mut self, transition: Option<Duration>) -> Self {
        self.transition = transition;
        self
    }

    /// Restores every record whose entity is in `configured`.
    ///
    /// Shorthand for [`prepare`](Self::prepare) followed by
    /// [`PreparedRestoration::execute`]. Returns once every started entity
    /// is terminal.
    pub async fn run(
        &self,
        records: impl IntoIterator<Item = EntityStateRecord>,
        configured: &BTreeSet<EntityId>,
    ) -> RestorationReport {
        self.prepare(records, configured).execute().await
    }

    /// Registers a restoration run without starting it.
    ///
    /// Recorded entities that are no longer configured are marked skipped
    /// right away and their records left untouched. Every other entity is
    /// marked pending and becomes cancellable through
    /// [`cancel`](Self::cancel) before this returns, so a cancellation that
    /// follows `prepare` is never missed, however late the run is polled.
    /// Entities already being restored by an earlier run are left to that
    /// run.
    pub fn prepare(
        &self,
        records: impl IntoIterator<Item = EntityStateRecord>,
        configured: &BTreeSet<EntityId>,
    ) -> PreparedRestoration<H> {
        let mut prepared = PreparedRestoration {
            entities: Vec::new(),
            report: RestorationReport::default(),
            started: Started {
                cancellations: Arc::clone(&self.cancellations),
                entity_ids: Vec::new(),
            },
            events: self.events.clone(),
        };

        for record in records {
            let entity_id = record.entity_id;
            if !configured.contains(&entity_id) {
                tracing::info!(%entity_id, "Recorded entity no longer configured, skipping");
                self.set_status(&entity_id, RestorationStatus::Skipped);
                self.events.publish(KeeperEvent::EntitySkipped {
                    entity_id: entity_id.clone(),
                });
                prepared.report.skipped.push(entity_id);
                continue;
            }

            let cancel = {
                let mut cancellations = self.cancellations.lock();
                if cancellations.contains_key(&entity_id) {
                    tracing::debug!(%entity_id, "Restoration already in progress");
                    continue;
                }
                let (tx, rx) = watch::channel(false);
                cancellations.insert(entity_id.clone(), tx);
                rx
            };
            prepared.started.entity_ids.push(entity_id.clone());

            self.set_status(&entity_id, RestorationStatus::Pending);
            prepared.entities.push(EntityRestoration {
                host: Arc::clone(&self.host),
                policy: self.policy.clone(),
                host_timeout: self.host_timeout,
                transition: self.transition,
                statuses: Arc::clone(&self.statuses),
                entity_id,
                state: record.state,
                cancel,
            });
        }

        prepared
    }

    /// Asks the restorations of the given entities to stop.
    ///
    /// A cancelled entity makes no further host calls and ends as
    /// [`RestorationStatus::Skipped`]. An attempt already in flight is
    /// allowed to finish. Returns the number of restorations signalled.
    pub fn cancel<'a>(&self, entity_ids: impl IntoIterator<Item = &'a EntityId>) -> usize {
        let cancellations = self.cancellations.lock();
        entity_ids
            .into_iter()
            .filter_map(|entity_id| cancellations.get(entity_id))
            .map(|tx| tx.send_replace(true))
            .count()
    }

    /// Asks every running restoration to stop.
    pub fn cancel_all(&self) -> usize {
        let cancellations = self.cancellations.lock();
        for tx in cancellations.values() {
            tx.send_replace(true);
        }
        cancellations.len()
    }

    /// Returns the restoration status of an entity.
    #[must_use]
    pub fn status(&self, entity_id: &EntityId) -> Option<RestorationStatus> {
        self.statuses.read().get(entity_id).cloned()
    }

    /// Returns the restoration status of every tracked entity.
    #[must_use]
    pub fn statuses(&self) -> HashMap<EntityId, RestorationStatus> {
        self.statuses.read().clone()
    }

    /// Returns `true` while any entity is being restored.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.cancellations.lock().is_empty()
    }

    fn set_status(&self, entity_id: &EntityId, status: RestorationStatus) {
        self.statuses.write().insert(entity_id.clone(), status);
    }
}

impl<H: Host> std::fmt::Debug for RestorationOrchestrator<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestorationOrchestrator")
            .field("policy", &self.policy)
            .field("host_timeout", &self.host_timeout)
            .field("transition", &self.transition)
            .field("tracked", &self.statuses.read().len())
            .finish_non_exhaustive()
    }
}

/// A registered restoration run, see [`RestorationOrchestrator::prepare`].
///
/// Dropping it without executing releases its entities.
pub struct PreparedRestoration<H: Host> {
    entities: Vec<EntityRestoration<H>>,
    report: RestorationReport,
    started: Started,
    events: EventBus,
}

impl<H: Host> PreparedRestoration<H> {
    /// Returns the entities this run will restore.
    #[must_use]
    pub fn entity_ids(&self) -> &[EntityId] {
        &self.started.entity_ids
    }

    /// Runs one task per entity and waits until every entity is terminal.
    ///
    /// If anything failed, one error is logged and one
    /// [`KeeperEvent::RestorationFailed`] is published.
    pub async fn execute(self) -> RestorationReport {
        let Self {
            entities,
            mut report,
            started,
            events,
        } = self;

        let mut tasks = JoinSet::new();
        for entity in entities {
            tasks.spawn(entity.run());
        }
        if !tasks.is_empty() {
            tracing::info!(entities = tasks.len(), "Restoring recorded states");
        }

        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(error = %e, "Restoration task aborted");
                    continue;
                }
            };

            match outcome {
                Outcome::Restored {
                    entity_id,
                    attempts,
                } => {
                    events.publish(KeeperEvent::EntityRestored {
                        entity_id: entity_id.clone(),
                        attempts,
                    });
                    report.restored.push(entity_id);
                }
                Outcome::Cancelled(entity_id) => {
                    events.publish(KeeperEvent::EntitySkipped {
                        entity_id: entity_id.clone(),
                    });
                    report.skipped.push(entity_id);
                }
                Outcome::Failed(failure) => report.failed.push(failure),
            }
        }

        drop(started);
        report.sort();

        if !report.failed.is_empty() {
            let summary = report
                .failed
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            tracing::error!(
                failed = report.failed.len(),
                %summary,
                "Restoration failed for some entities"
            );
            events.publish(KeeperEvent::RestorationFailed {
                failures: report.failed.clone(),
            });
        }

        tracing::info!(
            restored = report.restored.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Restoration finished"
        );
        report
    }
}

impl<H: Host> std::fmt::Debug for PreparedRestoration<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedRestoration")
            .field("entities", &self.started.entity_ids)
            .field("skipped", &self.report.skipped)
            .finish_non_exhaustive()
    }
}

/// Releases the entities of a run, also when the run is dropped midway.
struct Started {
    cancellations: Cancellations,
    entity_ids: Vec<EntityId>,
}

impl Drop for Started {
    fn drop(&mut self) {
        let mut cancellations = self.cancellations.lock();
        for entity_id in &self.entity_ids {
            cancellations.remove(entity_id);
        }
    }
}

/// How a single entity's restoration ended.
enum Outcome {
    Restored { entity_id: EntityId, attempts: u32 },
    Cancelled(EntityId),
    Failed(EntityFailure),
}

/// Attempt bookkeeping of one entity, discarded once it is terminal.
#[derive(Debug, Default)]
struct RestorationAttempt {
    count: u32,
    last_error: Option<HostError>,
}

/// The restoration task of one entity.
struct EntityRestoration<H: Host> {
    host: Arc<H>,
    policy: RetryPolicy,
    host_timeout: Duration,
    transition: Option<Duration>,
    statuses: StatusMap,
    entity_id: EntityId,
    state: EntityState,
    cancel: watch::Receiver<bool>,
}

impl<H: Host> EntityRestoration<H> {
    async fn run(mut self) -> Outcome {
        let mut attempt = RestorationAttempt::default();

        loop {
            if self.is_cancelled() {
                return self.cancelled();
            }

            attempt.count += 1;
            self.set_status(RestorationStatus::Attempting {
                attempt: attempt.count,
            });

            let error = match self.attempt().await {
                Ok(()) => {
                    tracing::info!(
                        entity_id = %self.entity_id,
                        attempts = attempt.count,
                        "Restored recorded state"
                    );
                    self.set_status(RestorationStatus::Restored {
                        attempts: attempt.count,
                    });
                    return Outcome::Restored {
                        entity_id: self.entity_id,
                        attempts: attempt.count,
                    };
                }
                Err(e) => e,
            };

            tracing::debug!(
                entity_id = %self.entity_id,
                attempt = attempt.count,
                error = %error,
                "Restoration attempt failed"
            );
            attempt.last_error = Some(error);

            if !self.policy.should_retry(attempt.count) {
                return self.failed(attempt);
            }

            self.set_status(RestorationStatus::Pending);
            let delay = self.policy.delay_for_attempt(attempt.count - 1);
            if self.cancelled_during(delay).await {
                return self.cancelled();
            }
        }
    }

    /// Sleeps for `delay`, returning `true` early if cancelled meanwhile.
    async fn cancelled_during(&mut self, delay: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(delay) => false,
            _ = self.cancel.wait_for(|cancelled| *cancelled) => true,
        }
    }

    /// One availability check followed by one set-state call.
    async fn attempt(&self) -> Result<(), HostError> {
        let millis = u64::try_from(self.host_timeout.as_millis()).unwrap_or(u64::MAX);
        let timed_out = |entity_id: &EntityId| HostError::Timeout {
            entity_id: entity_id.clone(),
            millis,
        };

        let available =
            tokio::time::timeout(self.host_timeout, self.host.is_available(&self.entity_id))
                .await
                .map_err(|_| timed_out(&self.entity_id))?;
        if !available {
            return Err(HostError::Unavailable(self.entity_id.clone()));
        }

        tokio::time::timeout(
            self.host_timeout,
            self.host
                .set_state(&self.entity_id, &self.state, self.transition),
        )
        .await
        .map_err(|_| timed_out(&self.entity_id))?
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn cancelled(self) -> Outcome {
        tracing::info!(entity_id = %self.entity_id, "Restoration cancelled");
        self.set_status(RestorationStatus::Skipped);
        Outcome::Cancelled(self.entity_id)
    }

    fn failed(self, attempt: RestorationAttempt) -> Outcome {
        let last_error = attempt
            .last_error
            .unwrap_or_else(|| HostError::Unavailable(self.entity_id.clone()));
        tracing::warn!(
            entity_id = %self.entity_id,
            attempts = attempt.count,
            error = %last_error,
            "Giving up restoring recorded state"
        );
        self.set_status(RestorationStatus::Failed {
            attempts: attempt.count,
            last_error: last_error.clone(),
        });
        Outcome::Failed(EntityFailure {
            entity_id: self.entity_id,
            attempts: attempt.count,
            last_error,
        })
    }

    fn set_status(&self, status: RestorationStatus) {
        self.statuses.write().insert(self.entity_id.clone(), status);
    }
}
