// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration types for the state keeper.
//!
//! Parsing a configuration file is the embedding application's job; these
//! types are the already-validated settings the engine consumes.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::EntityId;

/// Quiet period after the last update before an entity's state is committed.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

/// Upper bound for every availability check and set-state call to the host.
pub const DEFAULT_HOST_TIMEOUT: Duration = Duration::from_secs(5);

/// Fade time the host is asked to apply when restoring a state.
pub const DEFAULT_TRANSITION: Duration = Duration::from_secs(1);

/// Configuration of a [`StateKeeper`](crate::StateKeeper).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use state_keeper::config::{KeeperConfig, RetryPolicy};
/// use state_keeper::types::EntityId;
///
/// let config = KeeperConfig::new("/var/lib/keeper/lights.json")
///     .with_entity(EntityId::new("light.kitchen").unwrap())
///     .with_entity(EntityId::new("light.hallway").unwrap())
///     .with_debounce(Duration::from_millis(500))
///     .with_retry(RetryPolicy::new().with_max_attempts(5));
///
/// assert!(config.enabled);
/// assert_eq!(config.entities.len(), 2);
/// assert_eq!(config.transition, Some(Duration::from_secs(1)));
/// ```
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    /// Initial enablement. When `false`, the keeper neither subscribes,
    /// restores nor flushes until enabled at runtime.
    pub enabled: bool,
    /// Entities whose state is captured and restored.
    pub entities: BTreeSet<EntityId>,
    /// Location of the snapshot file.
    pub storage_path: PathBuf,
    /// Debounce window applied per entity before committing.
    pub debounce: Duration,
    /// Timeout applied to each host call.
    pub host_timeout: Duration,
    /// Retry policy for restoration.
    pub retry: RetryPolicy,
    /// Fade time passed to the host with every restored state. `None` lets
    /// the host apply the state its own way.
    pub transition: Option<Duration>,
}

impl KeeperConfig {
    /// Creates an enabled configuration with no entities and default timings.
    #[must_use]
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            entities: BTreeSet::new(),
            storage_path: storage_path.into(),
            debounce: DEFAULT_DEBOUNCE,
            host_timeout: DEFAULT_HOST_TIMEOUT,
            retry: RetryPolicy::default(),
            transition: Some(DEFAULT_TRANSITION),
        }
    }

    /// Adds one managed entity.
    #[must_use]
    pub fn with_entity(mut self, entity_id: EntityId) -> Self {
        self.entities.insert(entity_id);
        self
    }

    /// Adds several managed entities.
    #[must_use]
    pub fn with_entities(mut self, entity_ids: impl IntoIterator<Item = EntityId>) -> Self {
        self.entities.extend(entity_ids);
        self
    }

    /// Sets the debounce window.
    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Sets the host call timeout.
    #[must_use]
    pub fn with_host_timeout(mut self, timeout: Duration) -> Self {
        self.host_timeout = timeout;
        self
    }

    /// Sets the restoration retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the fade time applied when restoring a state.
    #[must_use]
    pub fn with_transition(mut self, transition: Duration) -> Self {
        self.transition = Some(transition);
        self
    }

    /// Restores states without asking the host for a transition.
    #[must_use]
    pub fn without_transition(mut self) -> Self {
        self.transition = None;
        self
    }

    /// Disables the keeper entirely.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Returns `true` if the entity is managed by this configuration.
    #[must_use]
    pub fn is_managed(&self, entity_id: &EntityId) -> bool {
        self.entities.contains(entity_id)
    }

    /// Returns the managed entities as a hash set, the shape host
    /// subscriptions take.
    #[must_use]
    pub fn entity_set(&self) -> HashSet<EntityId> {
        self.entities.iter().cloned().collect()
    }

    /// Returns the snapshot file location.
    #[must_use]
    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }
}

/// Exponential backoff for restoration retries.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use state_keeper::config::RetryPolicy;
///
/// // Default policy: 1 s doubling up to 30 s, 10 attempts
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
///
/// // Custom policy
/// let policy = RetryPolicy::new()
///     .with_max_attempts(3)
///     .with_initial_delay(Duration::from_millis(200))
///     .with_max_delay(Duration::from_secs(2));
/// assert!(!policy.should_retry(3));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one, before giving up. A value of
    /// 0 behaves as 1: the first attempt is always made.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound of any single delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f32,
}

impl RetryPolicy {
    /// Creates a retry policy with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the total number of attempts, at least 1.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the delay after the first failed attempt.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay between attempts.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f32) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay before retry number `retry` (0-based).
    ///
    /// Delays never decrease with `retry` as long as the multiplier is at
    /// least 1, and never exceed `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        if retry == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let multiplier = self
            .backoff_multiplier
            .max(1.0)
            .powi(i32::try_from(retry).unwrap_or(i32::MAX));

        // initial_delay is seconds, far from f32 precision limits
        #[allow(clippy::cast_precision_loss)]
        let delay_ms = self.initial_delay.as_millis() as f32 * multiplier;

        // delay_ms is positive; infinity saturates to u64::MAX
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay = Duration::from_millis(delay_ms as u64);

        delay.min(self.max_delay)
    }

    /// Returns true if another attempt may follow `attempts_made` failures.
    #[must_use]
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}
