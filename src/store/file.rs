// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-disk layout of the snapshot file.
//!
//! ```json
//! {
//!   "version": 1,
//!   "records": {
//!     "light.kitchen": {
//!       "schema_version": 1,
//!       "state": { "power": "on", "attributes": { "brightness": 80 } },
//!       "captured_at": "2026-01-01T00:00:00Z"
//!     }
//!   }
//! }
//! ```
//!
//! Records are decoded one by one: a record with an unknown
//! `schema_version`, or one that fails to decode, is dropped on its own
//! without invalidating the rest of the file.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::state::{EntityState, EntityStateRecord, RECORD_SCHEMA_VERSION};
use crate::types::EntityId;

/// Version of the file envelope.
pub(crate) const FILE_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotFileRef<'a> {
    version: u32,
    records: BTreeMap<&'a str, StoredRecordRef<'a>>,
}

#[derive(Serialize)]
struct StoredRecordRef<'a> {
    schema_version: u32,
    state: &'a EntityState,
    captured_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct SnapshotFileRaw {
    version: u32,
    #[serde(default)]
    records: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct StoredRecord {
    schema_version: u32,
    state: EntityState,
    captured_at: DateTime<Utc>,
}

/// Returns the sibling path used for in-progress writes.
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Serializes the whole mapping in a stable, human-readable form.
pub(crate) fn encode(
    records: &HashMap<EntityId, EntityStateRecord>,
) -> Result<Vec<u8>, PersistenceError> {
    let file = SnapshotFileRef {
        version: FILE_VERSION,
        records: records
            .values()
            .map(|record| {
                (
                    record.entity_id.as_str(),
                    StoredRecordRef {
                        schema_version: record.schema_version,
                        state: &record.state,
                        captured_at: record.captured_at,
                    },
                )
            })
            .collect(),
    };

    Ok(serde_json::to_vec_pretty(&file)?)
}

/// Decodes a snapshot file body.
///
/// # Errors
///
/// Returns [`PersistenceError::Corrupt`] if the envelope does not parse and
/// [`PersistenceError::UnsupportedVersion`] for an unknown envelope version.
pub(crate) fn decode(
    path: &Path,
    bytes: &[u8],
) -> Result<HashMap<EntityId, EntityStateRecord>, PersistenceError> {
    let raw: SnapshotFileRaw =
        serde_json::from_slice(bytes).map_err(|source| PersistenceError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

    if raw.version != FILE_VERSION {
        return Err(PersistenceError::UnsupportedVersion(raw.version));
    }

    let mut records = HashMap::with_capacity(raw.records.len());
    for (key, value) in raw.records {
        let Ok(entity_id) = EntityId::new(key.as_str()) else {
            tracing::warn!(key = %key, "Dropping snapshot record with invalid entity id");
            continue;
        };

        let schema_version = value.get("schema_version").and_then(serde_json::Value::as_u64);
        if schema_version != Some(u64::from(RECORD_SCHEMA_VERSION)) {
            tracing::warn!(
                %entity_id,
                ?schema_version,
                "Dropping snapshot record with unknown schema version"
            );
            continue;
        }

        match serde_json::from_value::<StoredRecord>(value) {
            Ok(stored) => {
                let record = EntityStateRecord {
                    entity_id: entity_id.clone(),
                    state: stored.state,
                    captured_at: stored.captured_at,
                    schema_version: stored.schema_version,
                };
                records.insert(entity_id, record);
            }
            Err(e) => {
                tracing::warn!(%entity_id, error = %e, "Dropping undecodable snapshot record");
            }
        }
    }

    Ok(records)
}

/// Reads and decodes the snapshot file, `Ok(None)` if it does not exist.
pub(crate) fn read(
    path: &Path,
) -> Result<Option<HashMap<EntityId, EntityStateRecord>>, PersistenceError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PersistenceError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    decode(path, &bytes).map(Some)
}

/// Replaces the file at `path` with `bytes` without ever exposing a partial
/// file: write a sibling temp file, fsync it, rename it over the target,
/// then fsync the directory.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let tmp_path = temp_path(path);
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| PersistenceError::Io { path, source }
    };

    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let written = File::create(&tmp_path)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .map_err(io_err(&tmp_path));

    if let Err(e) = written.and_then(|()| fs::rename(&tmp_path, path).map_err(io_err(path))) {
        // Leftover temp files are harmless, remove them anyway
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    // Persist the rename itself; not every platform can open a directory
    if let Some(parent) = parent
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }

    Ok(())
}
