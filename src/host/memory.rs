// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process host implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::HostError;
use crate::event::StateUpdate;
use crate::state::EntityState;
use crate::types::EntityId;

use super::Host;

/// Buffer size of each subscription channel.
const SUBSCRIPTION_CAPACITY: usize = 256;

/// A recorded `set_state` call.
#[derive(Debug, Clone, PartialEq)]
pub struct SetStateCall {
    /// Target entity.
    pub entity_id: EntityId,
    /// Requested state.
    pub state: EntityState,
    /// Requested fade time.
    pub transition: Option<Duration>,
    /// When the call reached the host.
    pub at: Instant,
}

#[derive(Default)]
struct Inner {
    states: HashMap<EntityId, EntityState>,
    available: HashSet<EntityId>,
    /// Remaining rejections per entity; `u32::MAX` rejects forever.
    rejections: HashMap<EntityId, u32>,
    latency: Duration,
    set_state_calls: Vec<SetStateCall>,
    availability_checks: Vec<(EntityId, Instant)>,
    subscribers: Vec<(HashSet<EntityId>, mpsc::Sender<StateUpdate>)>,
}

/// A host that keeps entity states in memory.
///
/// Entities are unavailable until marked available. Successful `set_state`
/// calls update the stored state and are echoed to subscribers as
/// [`StateUpdate`]s, the way a real platform reports the result of a
/// command. Every call is recorded for inspection.
///
/// Clones share the same state.
///
/// # Examples
///
/// ```
/// use state_keeper::host::{Host, InMemoryHost};
/// use state_keeper::state::EntityState;
/// use state_keeper::types::EntityId;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let kitchen = EntityId::new("light.kitchen").unwrap();
/// let host = InMemoryHost::new().with_available([kitchen.clone()]);
///
/// host.set_state(&kitchen, &EntityState::on(), None).await.unwrap();
/// assert_eq!(host.state(&kitchen), Some(EntityState::on()));
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryHost {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryHost {
    /// Creates a host with no entities.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the given entities available.
    #[must_use]
    pub fn with_available(self, entity_ids: impl IntoIterator<Item = EntityId>) -> Self {
        self.inner.lock().available.extend(entity_ids);
        self
    }

    /// Makes an entity available or unavailable.
    pub fn set_available(&self, entity_id: &EntityId, available: bool) {
        let mut inner = self.inner.lock();
        if available {
            inner.available.insert(entity_id.clone());
        } else {
            inner.available.remove(entity_id);
        }
    }

    /// Rejects the next `count` `set_state` calls for an entity.
    pub fn reject_next(&self, entity_id: &EntityId, count: u32) {
        self.inner.lock().rejections.insert(entity_id.clone(), count);
    }

    /// Rejects every `set_state` call for an entity.
    pub fn reject_always(&self, entity_id: &EntityId) {
        self.reject_next(entity_id, u32::MAX);
    }

    /// Delays every host call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    /// Returns the current state of an entity.
    #[must_use]
    pub fn state(&self, entity_id: &EntityId) -> Option<EntityState> {
        self.inner.lock().states.get(entity_id).cloned()
    }

    /// Returns every recorded `set_state` call, in order.
    #[must_use]
    pub fn set_state_calls(&self) -> Vec<SetStateCall> {
        self.inner.lock().set_state_calls.clone()
    }

    /// Returns the recorded `set_state` calls for one entity.
    #[must_use]
    pub fn set_state_calls_for(&self, entity_id: &EntityId) -> Vec<SetStateCall> {
        self.inner
            .lock()
            .set_state_calls
            .iter()
            .filter(|call| call.entity_id == *entity_id)
            .cloned()
            .collect()
    }

    /// Returns the times at which availability of an entity was checked.
    #[must_use]
    pub fn availability_checks_for(&self, entity_id: &EntityId) -> Vec<Instant> {
        self.inner
            .lock()
            .availability_checks
            .iter()
            .filter(|(id, _)| id == entity_id)
            .map(|(_, at)| *at)
            .collect()
    }

    /// Returns the number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|(_, tx)| !tx.is_closed());
        inner.subscribers.len()
    }

    /// Reports a state change to every subscriber interested in the entity.
    ///
    /// Steady updates also become the entity's current state.
    pub fn push_update(&self, update: StateUpdate) {
        let mut inner = self.inner.lock();
        if !update.transitioning {
            inner
                .states
                .insert(update.entity_id.clone(), update.state.clone());
        }

        inner.subscribers.retain(|(entity_ids, tx)| {
            if !entity_ids.contains(&update.entity_id) {
                return !tx.is_closed();
            }
            match tx.try_send(update.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(entity_id = %update.entity_id, "Subscriber lagging, update dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn latency(&self) -> Duration {
        self.inner.lock().latency
    }
}

impl std::fmt::Debug for InMemoryHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("InMemoryHost")
            .field("entities", &inner.states.len())
            .field("available", &inner.available.len())
            .field("subscribers", &inner.subscribers.len())
            .finish_non_exhaustive()
    }
}

impl Host for InMemoryHost {
    fn subscribe_state_changes(
        &self,
        entity_ids: &HashSet<EntityId>,
    ) -> mpsc::Receiver<StateUpdate> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.inner.lock().subscribers.push((entity_ids.clone(), tx));
        rx
    }

    async fn list_available_entities(&self) -> HashSet<EntityId> {
        self.inner.lock().available.clone()
    }

    async fn is_available(&self, entity_id: &EntityId) -> bool {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.inner.lock();
        inner
            .availability_checks
            .push((entity_id.clone(), Instant::now()));
        inner.available.contains(entity_id)
    }

    async fn set_state(
        &self,
        entity_id: &EntityId,
        state: &EntityState,
        transition: Option<Duration>,
    ) -> Result<(), HostError> {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        {
            let mut inner = self.inner.lock();
            inner.set_state_calls.push(SetStateCall {
                entity_id: entity_id.clone(),
                state: state.clone(),
                transition,
                at: Instant::now(),
            });

            if !inner.available.contains(entity_id) {
                return Err(HostError::Unavailable(entity_id.clone()));
            }

            if let Some(remaining) = inner.rejections.get_mut(entity_id)
                && *remaining > 0
            {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(HostError::Rejected {
                    entity_id: entity_id.clone(),
                    reason: "state not supported".to_string(),
                });
            }
        }

        self.push_update(StateUpdate::new(entity_id.clone(), state.clone()));
        Ok(())
    }
}
