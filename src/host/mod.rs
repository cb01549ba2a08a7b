// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Seam between the keeper and the host automation platform.
//!
//! The keeper never talks to devices directly. It subscribes to the host's
//! state-change stream, asks the host which entities are available, and asks
//! the host to apply a state. Implement [`Host`] to embed the keeper in a
//! platform; [`InMemoryHost`] is a complete in-process implementation used
//! by the test suite and handy for demos.

mod memory;

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::HostError;
use crate::event::StateUpdate;
use crate::state::EntityState;
use crate::types::EntityId;

pub use memory::{InMemoryHost, SetStateCall};

/// Operations the keeper needs from the host platform.
///
/// Futures returned by the host must be `Send`, because restoration runs one
/// task per entity on the tokio runtime. The keeper wraps every call in its
/// own timeout, so implementations need not enforce one.
pub trait Host: Send + Sync + 'static {
    /// Subscribes to state changes of the given entities.
    ///
    /// The host filters at the source: updates for entities outside
    /// `entity_ids` are never sent. The stream ends when the host drops the
    /// sender.
    fn subscribe_state_changes(&self, entity_ids: &HashSet<EntityId>)
    -> mpsc::Receiver<StateUpdate>;

    /// Returns every entity currently registered and reachable.
    fn list_available_entities(&self) -> impl Future<Output = HashSet<EntityId>> + Send;

    /// Returns `true` if the entity is registered and reachable.
    ///
    /// The default implementation consults
    /// [`list_available_entities`](Self::list_available_entities).
    fn is_available(&self, entity_id: &EntityId) -> impl Future<Output = bool> + Send {
        async move { self.list_available_entities().await.contains(entity_id) }
    }

    /// Drives the entity to the given state, fading over `transition` when
    /// one is given and the entity supports it.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Unavailable`] if the entity is not reachable and
    /// [`HostError::Rejected`] if the host refuses the state.
    fn set_state(
        &self,
        entity_id: &EntityId,
        state: &EntityState,
        transition: Option<Duration>,
    ) -> impl Future<Output = Result<(), HostError>> + Send;
}
