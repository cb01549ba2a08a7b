// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-entity restoration state.

use std::fmt;

use crate::error::HostError;

/// Where an entity stands in its restoration.
///
/// ```text
/// Pending -> Attempting -> Restored
///    ^           |
///    +-----------+  (failure, retries left)
///                |
///                +-> Failed   (retries exhausted)
///
/// Pending / Attempting -> Skipped  (not configured, or cancelled)
/// ```
///
/// `Restored`, `Skipped` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestorationStatus {
    /// Waiting for the first attempt or for the next retry.
    Pending,
    /// An attempt is in flight.
    Attempting {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// The host accepted the recorded state.
    Restored {
        /// Attempts made, including the successful one.
        attempts: u32,
    },
    /// The entity was left alone.
    Skipped,
    /// Every attempt failed.
    Failed {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last_error: HostError,
    },
}

impl RestorationStatus {
    /// Returns `true` once no further transition can happen.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Restored { .. } | Self::Skipped | Self::Failed { .. }
        )
    }

    /// Returns `true` for [`Restored`](Self::Restored).
    #[must_use]
    pub fn is_restored(&self) -> bool {
        matches!(self, Self::Restored { .. })
    }
}

impl fmt::Display for RestorationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Attempting { attempt } => write!(f, "attempting (#{attempt})"),
            Self::Restored { attempts } => write!(f, "restored after {attempts} attempt(s)"),
            Self::Skipped => f.write_str("skipped"),
            Self::Failed {
                attempts,
                last_error,
            } => write!(f, "failed after {attempts} attempt(s): {last_error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityId;

    #[test]
    fn terminal_states() {
        assert!(!RestorationStatus::Pending.is_terminal());
        assert!(!RestorationStatus::Attempting { attempt: 1 }.is_terminal());
        assert!(RestorationStatus::Restored { attempts: 1 }.is_terminal());
        assert!(RestorationStatus::Skipped.is_terminal());

        let failed = RestorationStatus::Failed {
            attempts: 3,
            last_error: HostError::Unavailable(EntityId::new("light.a").unwrap()),
        };
        assert!(failed.is_terminal());
        assert!(!failed.is_restored());
    }

    #[test]
    fn display() {
        assert_eq!(
            RestorationStatus::Restored { attempts: 2 }.to_string(),
            "restored after 2 attempt(s)"
        );
        assert_eq!(RestorationStatus::Attempting { attempt: 3 }.to_string(), "attempting (#3)");
    }
}
