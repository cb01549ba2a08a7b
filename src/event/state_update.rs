// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! State-change notifications delivered by the host.

use chrono::{DateTime, Utc};

use crate::state::{EntityState, EntityStateRecord};
use crate::types::EntityId;

/// A state-change notification for one entity.
///
/// Hosts that animate transitions (fades, ramps) may report intermediate
/// states; those are flagged with `transitioning` and are never captured.
///
/// # Examples
///
/// ```
/// use state_keeper::event::StateUpdate;
/// use state_keeper::state::EntityState;
/// use state_keeper::types::EntityId;
///
/// let id = EntityId::new("light.kitchen").unwrap();
/// let update = StateUpdate::new(id, EntityState::on().with_attribute("brightness", 30))
///     .in_transition();
///
/// assert!(update.transitioning);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    /// The entity whose state changed.
    pub entity_id: EntityId,
    /// The new state.
    pub state: EntityState,
    /// `true` while the host is still moving towards a target state.
    pub transitioning: bool,
    /// When the host observed the change.
    pub observed_at: DateTime<Utc>,
}

impl StateUpdate {
    /// Creates a steady-state update observed now.
    #[must_use]
    pub fn new(entity_id: EntityId, state: EntityState) -> Self {
        Self {
            entity_id,
            state,
            transitioning: false,
            observed_at: Utc::now(),
        }
    }

    /// Marks the update as an intermediate transition state.
    #[must_use]
    pub fn in_transition(mut self) -> Self {
        self.transitioning = true;
        self
    }

    /// Overrides the observation time.
    #[must_use]
    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }

    /// Converts the update into the record that would be persisted for it.
    #[must_use]
    pub fn into_record(self) -> EntityStateRecord {
        EntityStateRecord::new(self.entity_id, self.state, self.observed_at)
    }
}
