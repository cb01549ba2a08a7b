// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Keeper event types.

use chrono::{DateTime, Utc};

use crate::error::EntityFailure;
use crate::types::EntityId;

/// Events emitted by the state keeper.
///
/// These events report what the engine did: snapshots committed to disk,
/// pending updates dropped after a configuration change, and the outcome of
/// restoration. Restoration failures are reported once, aggregated, rather
/// than per attempt.
///
/// # Examples
///
/// ```
/// use state_keeper::event::KeeperEvent;
/// use state_keeper::types::EntityId;
///
/// let entity_id = EntityId::new("light.kitchen").unwrap();
/// let event = KeeperEvent::EntityRestored { entity_id, attempts: 1 };
/// assert!(event.is_restoration());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum KeeperEvent {
    /// A record was durably written to the snapshot store.
    SnapshotCommitted {
        /// The entity whose record was written.
        entity_id: EntityId,
        /// Capture time of the written record.
        captured_at: DateTime<Utc>,
    },

    /// A pending update was discarded because its entity left the configuration.
    SnapshotDropped {
        /// The entity whose update was discarded.
        entity_id: EntityId,
    },

    /// Pending updates were flushed at shutdown.
    Flushed {
        /// Number of records written.
        committed: usize,
        /// Number of records that failed to write.
        failed: usize,
    },

    /// An entity was driven back to its recorded state.
    EntityRestored {
        /// The restored entity.
        entity_id: EntityId,
        /// Attempts needed, including the successful one.
        attempts: u32,
    },

    /// A recorded entity is no longer configured and was left alone.
    EntitySkipped {
        /// The skipped entity.
        entity_id: EntityId,
    },

    /// Restoration gave up on one or more entities.
    RestorationFailed {
        /// Every entity that exhausted its retries.
        failures: Vec<EntityFailure>,
    },
}

impl KeeperEvent {
    /// Returns the entity this event concerns, if it concerns exactly one.
    #[must_use]
    pub fn entity_id(&self) -> Option<&EntityId> {
        match self {
            Self::SnapshotCommitted { entity_id, .. }
            | Self::SnapshotDropped { entity_id }
            | Self::EntityRestored { entity_id, .. }
            | Self::EntitySkipped { entity_id } => Some(entity_id),
            Self::Flushed { .. } | Self::RestorationFailed { .. } => None,
        }
    }

    /// Returns `true` for capture-side events (commits, drops, flushes).
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        matches!(
            self,
            Self::SnapshotCommitted { .. } | Self::SnapshotDropped { .. } | Self::Flushed { .. }
        )
    }

    /// Returns `true` for restoration outcome events.
    #[must_use]
    pub fn is_restoration(&self) -> bool {
        matches!(
            self,
            Self::EntityRestored { .. }
                | Self::EntitySkipped { .. }
                | Self::RestorationFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> EntityId {
        EntityId::new("light.kitchen").unwrap()
    }

    #[test]
    fn entity_id_extraction() {
        let committed = KeeperEvent::SnapshotCommitted {
            entity_id: id(),
            captured_at: Utc::now(),
        };
        assert_eq!(committed.entity_id(), Some(&id()));

        let flushed = KeeperEvent::Flushed {
            committed: 2,
            failed: 0,
        };
        assert!(flushed.entity_id().is_none());
    }

    #[test]
    fn classification() {
        assert!(KeeperEvent::SnapshotDropped { entity_id: id() }.is_snapshot());
        assert!(!KeeperEvent::SnapshotDropped { entity_id: id() }.is_restoration());

        let failed = KeeperEvent::RestorationFailed { failures: vec![] };
        assert!(failed.is_restoration());
        assert!(!failed.is_snapshot());
    }
}
