// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Value types shared by every component of the keeper.
//!
//! - [`EntityId`] - Validated identifier of a host entity (`light.kitchen`)
//! - [`PowerState`] - On/off discriminant of an entity state
//! - [`AttributeValue`] - Scalar value of a named state attribute

mod attribute;
mod entity_id;
mod power;

pub use attribute::AttributeValue;
pub use entity_id::EntityId;
pub use power::PowerState;
