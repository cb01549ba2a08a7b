// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entity identifier type.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValueError;

/// Stable identifier of a host-managed entity, such as `light.kitchen`.
///
/// Identifiers are non-empty and contain no whitespace. They are the unique
/// key of the snapshot store, so the type implements [`Borrow<str>`] to allow
/// lookups by string slice.
///
/// # Examples
///
/// ```
/// use state_keeper::types::EntityId;
///
/// let id = EntityId::new("light.kitchen").unwrap();
/// assert_eq!(id.domain(), Some("light"));
/// assert_eq!(id.to_string(), "light.kitchen");
///
/// assert!(EntityId::new("").is_err());
/// assert!(EntityId::new("light kitchen").is_err());
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    /// Creates an entity identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::InvalidEntityId`] if the identifier is empty or
    /// contains whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self, ValueError> {
        let id = id.into();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(ValueError::InvalidEntityId(id));
        }
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the domain part (`light` in `light.kitchen`), if any.
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.0.split_once('.').map(|(domain, _)| domain)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EntityId {
    type Error = ValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for EntityId {
    type Error = ValueError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_whitespace() {
        assert!(matches!(
            EntityId::new(""),
            Err(ValueError::InvalidEntityId(_))
        ));
        assert!(EntityId::new("light.\tporch").is_err());
        assert!(EntityId::new("light.porch").is_ok());
    }

    #[test]
    fn domain_split() {
        let id = EntityId::new("light.living_room").unwrap();
        assert_eq!(id.domain(), Some("light"));

        let bare = EntityId::new("porch").unwrap();
        assert_eq!(bare.domain(), None);
    }

    #[test]
    fn debug_format() {
        let id = EntityId::new("light.kitchen").unwrap();
        assert_eq!(format!("{id:?}"), "EntityId(light.kitchen)");
    }

    #[test]
    fn deserialize_validates() {
        let ok: EntityId = serde_json::from_str("\"light.kitchen\"").unwrap();
        assert_eq!(ok.as_str(), "light.kitchen");

        assert!(serde_json::from_str::<EntityId>("\"\"").is_err());
    }

    #[test]
    fn lookup_by_str() {
        use std::collections::HashMap;

        let mut map = HashMap::new();
        map.insert(EntityId::new("light.kitchen").unwrap(), 1);
        assert_eq!(map.get("light.kitchen"), Some(&1));
    }
}
