// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Durable snapshot store.
//!
//! The [`SnapshotStore`] keeps one [`EntityStateRecord`] per entity in memory
//! and mirrors the whole mapping to a single JSON file. Every committed change
//! rewrites the file atomically (temp file, fsync, rename), so a crash at any
//! point leaves either the previous complete file or the new complete file
//! on disk.
//!
//! The store has no background writer. [`SnapshotStore::put`] performs
//! blocking file I/O on the calling thread; async callers use
//! [`SnapshotStore::commit`] and [`SnapshotStore::open`], which run on the
//! blocking thread pool.
//!
//! # Examples
//!
//! ```no_run
//! use state_keeper::state::{EntityState, EntityStateRecord};
//! use state_keeper::store::SnapshotStore;
//! use state_keeper::types::EntityId;
//!
//! # fn example() -> state_keeper::Result<()> {
//! let store = SnapshotStore::new("/var/lib/keeper/lights.json");
//! if let Err(e) = store.load() {
//!     // Corrupt file: the store starts empty and stays usable
//!     eprintln!("ignoring snapshot file: {e}");
//! }
//!
//! let id = EntityId::new("light.kitchen")?;
//! store.put(EntityStateRecord::captured_now(id.clone(), EntityState::on()))?;
//! assert!(store.get(&id).is_some());
//! # Ok(())
//! # }
//! ```

mod file;

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::PersistenceError;
use crate::state::EntityStateRecord;
use crate::types::EntityId;

#[derive(Debug, Default)]
struct Records {
    map: HashMap<EntityId, EntityStateRecord>,
    /// Sequence of the last sequenced put per entity. Never persisted.
    sequences: HashMap<EntityId, u64>,
}

/// Durable mapping from entity to its most recent state record.
///
/// The in-memory mapping is the single source of truth for both capture and
/// restoration. Writers are serialized by a dedicated writer lock held for
/// the whole file rewrite, so the file never lags behind a newer commit.
/// The mapping itself is only locked to update and encode it; readers never
/// wait for the disk.
#[derive(Debug)]
pub struct SnapshotStore {
    path: PathBuf,
    records: Mutex<Records>,
    writer: Mutex<()>,
}

impl SnapshotStore {
    /// Creates an empty store backed by `path`.
    ///
    /// Nothing is read until [`load`](Self::load) is called.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(Records::default()),
            writer: Mutex::new(()),
        }
    }

    /// Returns the snapshot file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot file into memory, replacing the current mapping.
    ///
    /// A missing file yields an empty store. Records with an unknown schema
    /// version are dropped individually and logged.
    ///
    /// # Errors
    ///
    /// Returns a [`PersistenceError`] if the file cannot be read or parsed.
    /// The store is left empty and fully usable in that case; the error is
    /// informational and callers are expected to log it and carry on.
    pub fn load(&self) -> Result<usize, PersistenceError> {
        let _writer = self.writer.lock();
        *self.records.lock() = Records::default();

        let Some(loaded) = file::read(&self.path)? else {
            tracing::info!(
                path = %self.path.display(),
                "No snapshot file found, starting empty"
            );
            return Ok(0);
        };

        let count = loaded.len();
        self.records.lock().map = loaded;
        tracing::info!(
            path = %self.path.display(),
            records = count,
            "Loaded snapshot file"
        );
        Ok(count)
    }

    /// Runs [`load`](Self::load) on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns the error of `load`, or [`PersistenceError::TaskAborted`] if
    /// the blocking task panicked or was cancelled.
    pub async fn open(self: &Arc<Self>) -> Result<usize, PersistenceError> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.load())
            .await
            .map_err(|e| PersistenceError::TaskAborted(e.to_string()))?
    }

    /// Returns the record for an entity.
    #[must_use]
    pub fn get<Q>(&self, entity_id: &Q) -> Option<EntityStateRecord>
    where
        EntityId: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.records.lock().map.get(entity_id).cloned()
    }

    /// Returns `true` if a record exists for the entity.
    #[must_use]
    pub fn contains<Q>(&self, entity_id: &Q) -> bool
    where
        EntityId: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.records.lock().map.contains_key(entity_id)
    }

    /// Returns a copy of every record.
    #[must_use]
    pub fn records(&self) -> HashMap<EntityId, EntityStateRecord> {
        self.records.lock().map.clone()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().map.len()
    }

    /// Returns `true` if the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().map.is_empty()
    }

    /// Commits a record and durably rewrites the snapshot file.
    ///
    /// The record replaces the stored one whatever its `captured_at`; the
    /// wall clock may step backwards between two observations.
    ///
    /// # Returns
    ///
    /// Returns `true` if the record was written, `false` if it was identical
    /// to the stored one.
    ///
    /// # Errors
    ///
    /// Returns a [`PersistenceError`] if the file cannot be written. The
    /// in-memory mapping is rolled back so it keeps mirroring the file.
    pub fn put(&self, record: EntityStateRecord) -> Result<bool, PersistenceError> {
        self.write(record, None)
    }

    /// Commits a record taken from a numbered stream of observations.
    ///
    /// Like [`put`](Self::put), except that a record whose `sequence` is
    /// lower than the last one committed for the entity is ignored, so a
    /// commit that lost a race never overwrites a later observation.
    /// Sequences are compared within this process only.
    ///
    /// # Errors
    ///
    /// Same as [`put`](Self::put).
    pub fn put_sequenced(
        &self,
        record: EntityStateRecord,
        sequence: u64,
    ) -> Result<bool, PersistenceError> {
        self.write(record, Some(sequence))
    }

    /// Runs [`put_sequenced`](Self::put_sequenced) on the blocking thread
    /// pool.
    ///
    /// # Errors
    ///
    /// Returns the error of `put_sequenced`, or
    /// [`PersistenceError::TaskAborted`] if the blocking task panicked or
    /// was cancelled.
    pub async fn commit(
        self: &Arc<Self>,
        record: EntityStateRecord,
        sequence: u64,
    ) -> Result<bool, PersistenceError> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.put_sequenced(record, sequence))
            .await
            .map_err(|e| PersistenceError::TaskAborted(e.to_string()))?
    }

    fn write(
        &self,
        record: EntityStateRecord,
        sequence: Option<u64>,
    ) -> Result<bool, PersistenceError> {
        let _writer = self.writer.lock();
        let entity_id = record.entity_id.clone();

        let (bytes, previous, previous_sequence) = {
            let mut records = self.records.lock();

            if let Some(sequence) = sequence
                && records
                    .sequences
                    .get(&entity_id)
                    .is_some_and(|last| sequence < *last)
            {
                tracing::debug!(
                    %entity_id,
                    sequence,
                    "Ignoring record superseded by a later commit"
                );
                return Ok(false);
            }
            if records.map.get(&entity_id) == Some(&record) {
                if let Some(sequence) = sequence {
                    records.sequences.insert(entity_id, sequence);
                }
                return Ok(false);
            }

            let previous = records.map.insert(entity_id.clone(), record);
            let previous_sequence = match sequence {
                Some(sequence) => records.sequences.insert(entity_id.clone(), sequence),
                None => records.sequences.get(&entity_id).copied(),
            };
            match file::encode(&records.map) {
                Ok(bytes) => (bytes, previous, previous_sequence),
                Err(e) => {
                    records.rollback(&entity_id, previous, previous_sequence);
                    return Err(e);
                }
            }
        };

        if let Err(e) = file::write_atomic(&self.path, &bytes) {
            self.records
                .lock()
                .rollback(&entity_id, previous, previous_sequence);
            return Err(e);
        }

        tracing::debug!(%entity_id, path = %self.path.display(), "Committed snapshot record");
        Ok(true)
    }
}

impl Records {
    fn rollback(
        &mut self,
        entity_id: &EntityId,
        previous: Option<EntityStateRecord>,
        previous_sequence: Option<u64>,
    ) {
        match previous {
            Some(previous) => self.map.insert(entity_id.clone(), previous),
            None => self.map.remove(entity_id),
        };
        match previous_sequence {
            Some(sequence) => self.sequences.insert(entity_id.clone(), sequence),
            None => self.sequences.remove(entity_id),
        };
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::TimeDelta;
    use tempfile::TempDir;

    use super::*;
    use crate::state::EntityState;

    fn id(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    fn store_in(dir: &TempDir) -> SnapshotStore {
        SnapshotStore::new(dir.path().join("lights.json"))
    }

    #[test]
    fn load_without_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        assert_eq!(store.load().unwrap(), 0);
        assert!(store.is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn put_then_reload() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let record = EntityStateRecord::captured_now(
            id("light.kitchen"),
            EntityState::on().with_attribute("brightness", 80),
        );

        assert!(store.put(record.clone()).unwrap());

        let reopened = store_in(&dir);
        assert_eq!(reopened.load().unwrap(), 1);
        assert_eq!(reopened.get("light.kitchen"), Some(record));
    }

    #[test]
    fn idempotent_commit() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let record = EntityStateRecord::captured_now(id("light.kitchen"), EntityState::on());

        assert!(store.put(record.clone()).unwrap());
        let first = fs::read(store.path()).unwrap();

        assert!(!store.put(record.clone()).unwrap());
        let second = fs::read(store.path()).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&record.entity_id), Some(record));
    }

    #[test]
    fn put_replaces_even_when_clock_stepped_back() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let on = EntityStateRecord::captured_now(id("light.kitchen"), EntityState::on());
        let off = EntityStateRecord::new(
            id("light.kitchen"),
            EntityState::off(),
            on.captured_at - TimeDelta::hours(1),
        );

        assert!(store.put(on).unwrap());
        assert!(store.put(off.clone()).unwrap());

        assert_eq!(store.get("light.kitchen"), Some(off.clone()));
        let reopened = store_in(&dir);
        reopened.load().unwrap();
        assert_eq!(reopened.get("light.kitchen"), Some(off));
    }

    #[test]
    fn late_sequenced_commit_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let earlier = EntityStateRecord::captured_now(id("light.kitchen"), EntityState::off());
        // Captured later by the clock, but observed first
        let later = EntityStateRecord::new(
            id("light.kitchen"),
            EntityState::on(),
            earlier.captured_at - TimeDelta::minutes(5),
        );

        assert!(store.put_sequenced(later.clone(), 8).unwrap());
        let bytes = fs::read(store.path()).unwrap();

        assert!(!store.put_sequenced(earlier, 3).unwrap());
        assert_eq!(store.get("light.kitchen"), Some(later));
        assert_eq!(fs::read(store.path()).unwrap(), bytes);

        // Sequences are per entity
        let desk = EntityStateRecord::captured_now(id("light.desk"), EntityState::on());
        assert!(store.put_sequenced(desk, 1).unwrap());
    }

    #[test]
    fn failed_sequenced_write_does_not_block_later_retry() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();
        let store = SnapshotStore::new(blocker.join("lights.json"));
        let record = EntityStateRecord::captured_now(id("light.kitchen"), EntityState::on());

        assert!(store.put_sequenced(record.clone(), 5).is_err());
        assert!(store.get("light.kitchen").is_none());

        // The failed sequence was rolled back, so an earlier one still counts
        fs::remove_file(&blocker).unwrap();
        fs::create_dir(&blocker).unwrap();
        assert!(store.put_sequenced(record, 4).unwrap());
    }

    #[test]
    fn corrupt_file_yields_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), b"\x00\x01 definitely not json").unwrap();

        let result = store.load();
        assert!(matches!(result, Err(PersistenceError::Corrupt { .. })));
        assert!(store.is_empty());

        // Still usable afterwards
        let record = EntityStateRecord::captured_now(id("light.desk"), EntityState::on());
        assert!(store.put(record).unwrap());
        assert_eq!(store_in(&dir).load().unwrap(), 1);
    }

    #[test]
    fn crash_before_rename_keeps_previous_file() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let record = EntityStateRecord::captured_now(id("light.kitchen"), EntityState::on());
        store.put(record.clone()).unwrap();

        // A crash mid-write leaves a truncated temp file next to the real one
        let full = fs::read(store.path()).unwrap();
        fs::write(file::temp_path(store.path()), &full[..full.len() / 2]).unwrap();

        let reopened = store_in(&dir);
        assert_eq!(reopened.load().unwrap(), 1);
        assert_eq!(reopened.get("light.kitchen"), Some(record));
    }

    #[test]
    fn leftover_temp_file_is_replaced_by_next_commit() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(file::temp_path(store.path()), b"{\"version\":1,\"rec").unwrap();

        let record = EntityStateRecord::captured_now(id("light.porch"), EntityState::off());
        store.put(record.clone()).unwrap();

        assert!(!file::temp_path(store.path()).exists());
        let reopened = store_in(&dir);
        reopened.load().unwrap();
        assert_eq!(reopened.get("light.porch"), Some(record));
    }

    #[test]
    fn every_intermediate_file_parses() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        for brightness in 0_i64..20 {
            let record = EntityStateRecord::captured_now(
                id("light.kitchen"),
                EntityState::on().with_attribute("brightness", brightness),
            );
            store.put(record).unwrap();

            let bytes = fs::read(store.path()).unwrap();
            let decoded = file::decode(store.path(), &bytes).unwrap();
            assert_eq!(
                decoded["light.kitchen"].state.attribute("brightness"),
                Some(&brightness.into())
            );
        }
    }

    #[test]
    fn failed_write_rolls_back_memory() {
        let dir = TempDir::new().unwrap();
        // The parent "directory" is a regular file, so every write fails
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();
        let store = SnapshotStore::new(blocker.join("lights.json"));

        let record = EntityStateRecord::captured_now(id("light.kitchen"), EntityState::on());
        let result = store.put(record);

        assert!(matches!(result, Err(PersistenceError::Io { .. })));
        assert!(store.get("light.kitchen").is_none());
    }

    #[tokio::test]
    async fn commit_and_open_run_off_the_runtime() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store_in(&dir));
        let record = EntityStateRecord::captured_now(id("light.kitchen"), EntityState::on());

        assert!(store.commit(record.clone(), 1).await.unwrap());
        assert!(!store.commit(record.clone(), 2).await.unwrap());

        let reopened = Arc::new(store_in(&dir));
        assert_eq!(reopened.open().await.unwrap(), 1);
        assert_eq!(reopened.get("light.kitchen"), Some(record));
    }

    #[test]
    fn readers_are_not_blocked_by_the_writer_lock() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .put(EntityStateRecord::captured_now(id("light.kitchen"), EntityState::on()))
            .unwrap();

        let _writer = store.writer.lock();
        assert_eq!(store.len(), 1);
        assert!(store.contains("light.kitchen"));
    }
}
