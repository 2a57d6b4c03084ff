//! Typed record persistence over an ordered embedded key-value store.
//!
//! Records are JSON-encoded and stored under opaque string keys in a single
//! redb table. Every write commits with immediate durability before
//! returning. The store does not interpret record contents; callers own the
//! key scheme and re-sort scan results as needed.

use std::path::{Path, PathBuf};

use redb::{Database, Durability, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Result type for record store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record '{0}' not found")]
    NotFound(String),
    #[error(transparent)]
    Database(#[from] redb::DatabaseError),
    #[error(transparent)]
    Transaction(#[from] redb::TransactionError),
    #[error(transparent)]
    Table(#[from] redb::TableError),
    #[error(transparent)]
    Storage(#[from] redb::StorageError),
    #[error(transparent)]
    Commit(#[from] redb::CommitError),
    #[error("failed to encode or decode record '{key}': {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Durable record store handle. Open once at process start and share via `Arc`.
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    db: Database,
}

impl RecordStore {
    /// Opens (or creates) the store file at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(&path)?;

        let txn = db.begin_write()?;
        txn.open_table(RECORDS)?;
        txn.commit()?;

        tracing::debug!(path = %path.display(), "record store opened");
        Ok(Self { path, db })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serializes `value` and durably stores it under `key`, replacing any previous record.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        self.put_raw(key, &encode(key, value)?)
    }

    /// Stores `value` under `key` only if `condition` accepts the current record.
    ///
    /// The current record is read inside the same write transaction, so no other
    /// writer can change it between the check and the write. Returns whether
    /// `value` was written.
    pub fn put_if<T, F>(&self, key: &str, value: &T, condition: F) -> StoreResult<bool>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<&T>) -> bool,
    {
        let payload = encode(key, value)?;
        let mut txn = self.db.begin_write()?;
        txn.set_durability(Durability::Immediate);
        let written = {
            let mut table = txn.open_table(RECORDS)?;
            let current = table.get(key)?.map(|guard| guard.value().to_vec());
            let current = current
                .map(|payload| decode::<T>(key, &payload))
                .transpose()?;
            if condition(current.as_ref()) {
                table.insert(key, payload.as_slice())?;
                true
            } else {
                false
            }
        };
        txn.commit()?;
        Ok(written)
    }

    /// Stores raw bytes under `key`.
    pub fn put_raw(&self, key: &str, payload: &[u8]) -> StoreResult<()> {
        let mut txn = self.db.begin_write()?;
        txn.set_durability(Durability::Immediate);
        {
            let mut table = txn.open_table(RECORDS)?;
            table.insert(key, payload)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Loads and deserializes the record under `key`, if present.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let Some(payload) = self.get_raw(key)? else {
            return Ok(None);
        };
        Ok(Some(decode(key, &payload)?))
    }

    /// Like [`RecordStore::get`], but a missing record is a `NotFound` error.
    pub fn get_required<T: DeserializeOwned>(&self, key: &str) -> StoreResult<T> {
        self.get(key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    /// Loads raw bytes stored under `key`.
    pub fn get_raw(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RECORDS)?;
        let value = table.get(key)?.map(|guard| guard.value().to_vec());
        Ok(value)
    }

    /// Removes the record under `key`. Deleting a missing key is not an error.
    pub fn delete(&self, key: &str) -> StoreResult<()> {
        self.delete_many(std::iter::once(key))
    }

    /// Removes every listed key in a single durable transaction.
    pub fn delete_many<'a, I>(&self, keys: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut txn = self.db.begin_write()?;
        txn.set_durability(Durability::Immediate);
        {
            let mut table = txn.open_table(RECORDS)?;
            for key in keys {
                table.remove(key)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Removes each listed record that `condition` still accepts, re-reading it
    /// inside a single write transaction. Missing keys are skipped. Returns the
    /// removed keys.
    pub fn delete_many_if<'a, T, I, F>(&self, keys: I, mut condition: F) -> StoreResult<Vec<String>>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = &'a str>,
        F: FnMut(&T) -> bool,
    {
        let mut removed = Vec::new();
        let mut txn = self.db.begin_write()?;
        txn.set_durability(Durability::Immediate);
        {
            let mut table = txn.open_table(RECORDS)?;
            for key in keys {
                let Some(payload) = table.get(key)?.map(|guard| guard.value().to_vec()) else {
                    continue;
                };
                if condition(&decode::<T>(key, &payload)?) {
                    table.remove(key)?;
                    removed.push(key.to_string());
                }
            }
        }
        txn.commit()?;
        Ok(removed)
    }

    /// Deserializes every record whose key starts with `prefix`, in key order.
    pub fn scan_prefix<T: DeserializeOwned>(&self, prefix: &str) -> StoreResult<Vec<T>> {
        let mut rows = Vec::new();
        for (key, payload) in self.scan_prefix_raw(prefix)? {
            rows.push(decode(&key, &payload)?);
        }
        Ok(rows)
    }

    /// Returns every key starting with `prefix`, in key order.
    pub fn scan_prefix_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .scan_prefix_raw(prefix)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    fn scan_prefix_raw(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RECORDS)?;
        let mut rows = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_string(), value.value().to_vec()));
        }
        Ok(rows)
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|source| StoreError::Json {
        key: key.to_string(),
        source,
    })
}

fn decode<T: DeserializeOwned>(key: &str, payload: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(payload).map_err(|source| StoreError::Json {
        key: key.to_string(),
        source,
    })
}
