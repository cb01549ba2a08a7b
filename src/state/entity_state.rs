// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entity state tracking.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{AttributeValue, PowerState};

/// Semantic state of an entity.
///
/// The keeper understands only the on/off discriminant. Every other parameter
/// is an opaque attribute that is captured and replayed verbatim. Attributes
/// are kept sorted by name so that serialized snapshots are stable.
///
/// # Examples
///
/// ```
/// use state_keeper::state::EntityState;
/// use state_keeper::types::PowerState;
///
/// let state = EntityState::on()
///     .with_attribute("brightness", 80)
///     .with_attribute("color_temp", 370);
///
/// assert_eq!(state.power(), PowerState::On);
/// assert_eq!(state.attribute("brightness").and_then(|v| v.as_i64()), Some(80));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    /// On/off discriminant.
    power: PowerState,
    /// Named scalar parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attributes: BTreeMap<String, AttributeValue>,
}

impl EntityState {
    /// Creates a state with the given power and no attributes.
    #[must_use]
    pub fn new(power: PowerState) -> Self {
        Self {
            power,
            attributes: BTreeMap::new(),
        }
    }

    /// Creates an "on" state with no attributes.
    #[must_use]
    pub fn on() -> Self {
        Self::new(PowerState::On)
    }

    /// Creates an "off" state with no attributes.
    #[must_use]
    pub fn off() -> Self {
        Self::new(PowerState::Off)
    }

    /// Adds or replaces an attribute.
    #[must_use]
    pub fn with_attribute(
        mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    // ========== Power ==========

    /// Returns the power discriminant.
    #[must_use]
    pub fn power(&self) -> PowerState {
        self.power
    }

    /// Returns `true` if the entity is on.
    #[must_use]
    pub fn is_on(&self) -> bool {
        self.power.is_on()
    }

    /// Sets the power discriminant.
    pub fn set_power(&mut self, power: PowerState) {
        self.power = power;
    }

    // ========== Attributes ==========

    /// Gets an attribute by name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Returns all attributes, sorted by name.
    #[must_use]
    pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }

    /// Sets an attribute, returning the previous value.
    pub fn set_attribute(
        &mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Option<AttributeValue> {
        self.attributes.insert(name.into(), value.into())
    }

    /// Removes an attribute, returning its value.
    pub fn remove_attribute(&mut self, name: &str) -> Option<AttributeValue> {
        self.attributes.remove(name)
    }

    /// Clears all attributes, keeping the power discriminant.
    pub fn clear_attributes(&mut self) {
        self.attributes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_has_no_attributes() {
        let state = EntityState::off();
        assert!(!state.is_on());
        assert!(state.attributes().is_empty());
    }

    #[test]
    fn attribute_management() {
        let mut state = EntityState::on();

        assert!(state.set_attribute("brightness", 40).is_none());
        let previous = state.set_attribute("brightness", 80);
        assert_eq!(previous, Some(AttributeValue::Int(40)));

        assert_eq!(state.remove_attribute("brightness"), Some(AttributeValue::Int(80)));
        assert!(state.attribute("brightness").is_none());
    }

    #[test]
    fn clear_keeps_power() {
        let mut state = EntityState::on().with_attribute("effect", "colorloop");
        state.clear_attributes();

        assert!(state.is_on());
        assert!(state.attributes().is_empty());
    }

    #[test]
    fn serialized_shape() {
        let state = EntityState::on().with_attribute("brightness", 80);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"power": "on", "attributes": {"brightness": 80}})
        );

        let bare = serde_json::to_value(EntityState::off()).unwrap();
        assert_eq!(bare, serde_json::json!({"power": "off"}));
    }

    #[test]
    fn deserialize_without_attributes() {
        let state: EntityState = serde_json::from_str(r#"{"power":"on"}"#).unwrap();
        assert_eq!(state, EntityState::on());
    }
}
