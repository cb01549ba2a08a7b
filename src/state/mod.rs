// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entity state types.
//!
//! [`EntityState`] is what the host reports and accepts: an on/off
//! discriminant plus opaque scalar attributes. [`EntityStateRecord`] is the
//! persisted snapshot of one entity's most recent state.
//!
//! # Examples
//!
//! ```
//! use state_keeper::state::{EntityState, EntityStateRecord};
//! use state_keeper::types::EntityId;
//!
//! let id = EntityId::new("light.kitchen").unwrap();
//! let state = EntityState::on().with_attribute("brightness", 80);
//! let record = EntityStateRecord::captured_now(id, state.clone());
//!
//! assert_eq!(record.state, state);
//! ```

mod entity_state;
mod record;

pub use entity_state::EntityState;
pub use record::{EntityStateRecord, RECORD_SCHEMA_VERSION};
