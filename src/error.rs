// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the state keeper.
//!
//! The hierarchy mirrors the failure domains of the engine: value validation,
//! durable storage, calls into the host platform, and the aggregated outcome
//! of a restoration run. Only [`Error::RestorationFailed`] is meant to reach an
//! operator; the other kinds are absorbed and logged where they happen.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::EntityId;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// Error occurred during value validation.
    #[error("value error: {0}")]
    Value(#[from] ValueError),

    /// Error occurred while reading or writing the snapshot file.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// A call into the host platform failed.
    #[error("host error: {0}")]
    Host(#[from] HostError),

    /// One or more entities could not be restored after exhausting retries.
    #[error("failed to restore {} entity(ies): {}", .0.len(), summarize(.0))]
    RestorationFailed(Vec<EntityFailure>),

    /// The keeper is disabled by configuration.
    #[error("state keeper is disabled")]
    Disabled,
}

/// Errors related to value validation and constraints.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// An entity identifier is empty or contains whitespace.
    #[error("invalid entity id: {0:?}")]
    InvalidEntityId(String),

    /// An invalid power state string was provided.
    #[error("invalid power state: {0}")]
    InvalidPowerState(String),
}

/// Errors related to the durable snapshot file.
///
/// These are always recoverable: a failed load falls back to an empty
/// mapping and a failed commit leaves the previous file in place.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The file system refused a read or write.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// The file that was being accessed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The snapshot file exists but cannot be parsed.
    #[error("snapshot file {} is corrupt: {source}", path.display())]
    Corrupt {
        /// The corrupt file.
        path: PathBuf,
        /// The parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// The snapshot file was written by an incompatible format version.
    #[error("unsupported snapshot file version {0}")]
    UnsupportedVersion(u32),

    /// The in-memory mapping could not be serialized.
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A blocking commit task was cancelled or panicked.
    #[error("commit task did not complete: {0}")]
    TaskAborted(String),
}

/// Errors returned by the host platform.
///
/// Unavailability, rejection and timeouts are all treated as transient by the
/// restoration loop; at this layer a transient refusal cannot be told apart
/// from a permanent one.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    /// The entity is not (yet) registered or reachable.
    #[error("entity {0} is not available")]
    Unavailable(EntityId),

    /// The host refused the requested state.
    #[error("entity {entity_id} rejected the requested state: {reason}")]
    Rejected {
        /// The entity that refused the command.
        entity_id: EntityId,
        /// Reason reported by the host.
        reason: String,
    },

    /// The host call did not complete in time.
    #[error("call for entity {entity_id} timed out after {millis} ms")]
    Timeout {
        /// The entity the call targeted.
        entity_id: EntityId,
        /// The timeout that elapsed, in milliseconds.
        millis: u64,
    },

    /// The host's notification channel was closed.
    #[error("host channel closed")]
    ChannelClosed,
}

/// Final failure of a single entity's restoration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFailure {
    /// The entity that could not be restored.
    pub entity_id: EntityId,
    /// Number of attempts made.
    pub attempts: u32,
    /// The error returned by the last attempt.
    pub last_error: HostError,
}

impl std::fmt::Display for EntityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} after {} attempt(s) ({})",
            self.entity_id, self.attempts, self.last_error
        )
    }
}

fn summarize(failures: &[EntityFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
