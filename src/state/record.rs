// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persisted snapshot of one entity.

use chrono::{DateTime, Utc};

use crate::types::EntityId;

use super::EntityState;

/// Schema version written into every new record.
pub const RECORD_SCHEMA_VERSION: u32 = 1;

/// The most recently captured state of one entity.
///
/// There is at most one record per [`EntityId`] in the snapshot store. A new
/// record for the same entity replaces the old one as a whole; attributes
/// are never merged.
///
/// # Examples
///
/// ```
/// use state_keeper::state::{EntityState, EntityStateRecord, RECORD_SCHEMA_VERSION};
/// use state_keeper::types::EntityId;
///
/// let record = EntityStateRecord::captured_now(
///     EntityId::new("light.kitchen").unwrap(),
///     EntityState::on().with_attribute("brightness", 80),
/// );
///
/// assert_eq!(record.schema_version, RECORD_SCHEMA_VERSION);
/// assert!(record.state.is_on());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EntityStateRecord {
    /// The entity this record belongs to.
    pub entity_id: EntityId,
    /// The captured state.
    pub state: EntityState,
    /// When the observation that produced this record was made.
    pub captured_at: DateTime<Utc>,
    /// Format version of this record.
    pub schema_version: u32,
}

impl EntityStateRecord {
    /// Creates a record at the current schema version.
    #[must_use]
    pub fn new(entity_id: EntityId, state: EntityState, captured_at: DateTime<Utc>) -> Self {
        Self {
            entity_id,
            state,
            captured_at,
            schema_version: RECORD_SCHEMA_VERSION,
        }
    }

    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn captured_now(entity_id: EntityId, state: EntityState) -> Self {
        Self::new(entity_id, state, Utc::now())
    }

    /// Returns `true` if this build knows how to decode the record's schema.
    #[must_use]
    pub fn is_supported_version(&self) -> bool {
        self.schema_version == RECORD_SCHEMA_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_version() {
        let mut record = EntityStateRecord::captured_now(
            EntityId::new("light.kitchen").unwrap(),
            EntityState::on(),
        );
        assert!(record.is_supported_version());

        record.schema_version = 7;
        assert!(!record.is_supported_version());
    }
}
