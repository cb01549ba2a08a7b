// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Aggregated outcome of a restoration run.

use crate::error::{EntityFailure, Error, Result};
use crate::types::EntityId;

/// Aggregated outcome of one restoration run.
///
/// Each list is sorted by entity id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestorationReport {
    /// Entities driven back to their recorded state.
    pub restored: Vec<EntityId>,
    /// Entities left alone: no longer configured, or cancelled.
    pub skipped: Vec<EntityId>,
    /// Entities that exhausted their retries.
    pub failed: Vec<EntityFailure>,
}

impl RestorationReport {
    /// Returns `true` if no entity failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Returns the number of entities the run covered.
    #[must_use]
    pub fn total(&self) -> usize {
        self.restored.len() + self.skipped.len() + self.failed.len()
    }

    /// Converts the report into a result carrying every failure at once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RestorationFailed`] listing each failed entity if
    /// any failed.
    pub fn into_result(self) -> Result<Self> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(Error::RestorationFailed(self.failed))
        }
    }

    pub(crate) fn sort(&mut self) {
        self.restored.sort();
        self.skipped.sort();
        self.failed.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    }
}
