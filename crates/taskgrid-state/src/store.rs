//! redb-backed versioned key-value store for TaskGrid.
//!
//! Every record carries a version drawn from one store-wide sequence held in
//! the `meta` table. Writers either overwrite blindly (`put`), write only if
//! the version they read is still current (`compare_and_set`), or commit a
//! batch of conditioned writes atomically (`transaction`). redb serializes
//! write transactions, so each of these is linearizable.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use taskgrid_core::{Settings, Task};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for keyspace in Keyspace::ALL {
            txn.open_table(table_for(keyspace)).map_err(map_err!(Table))?;
        }
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Read a record without its version.
    pub fn get<T: DeserializeOwned>(&self, keyspace: Keyspace, key: &str) -> StateResult<Option<T>> {
        Ok(self.get_versioned(keyspace, key)?.map(|v| v.value))
    }

    /// Read a record together with the version it is stored at.
    pub fn get_versioned<T: DeserializeOwned>(
        &self,
        keyspace: Keyspace,
        key: &str,
    ) -> StateResult<Option<Versioned<T>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_for(keyspace)).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(key, guard.value())?)),
            None => Ok(None),
        }
    }

    /// Current version of a key, if it exists.
    pub fn version(&self, keyspace: Keyspace, key: &str) -> StateResult<Option<Version>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_for(keyspace)).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode_version(key, guard.value())?)),
            None => Ok(None),
        }
    }

    /// All records whose key starts with `prefix`, in key order.
    pub fn scan<T: DeserializeOwned>(
        &self,
        keyspace: Keyspace,
        prefix: &str,
    ) -> StateResult<Vec<(String, Versioned<T>)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_for(keyspace)).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.to_string(), decode(key, value.value())?));
        }
        Ok(results)
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Unconditional write. Returns the new version.
    pub fn put<T: Serialize>(&self, keyspace: Keyspace, key: &str, value: &T) -> StateResult<Version> {
        let op = WriteOp::put(keyspace, key, value, Precondition::Any)?;
        match self.transaction(&[op])? {
            TxnOutcome::Committed { version } => Ok(version),
            // `Any` always holds.
            TxnOutcome::Conflict { key, .. } => Err(StateError::Transaction(format!(
                "unconditional write to {key} reported a conflict"
            ))),
        }
    }

    /// Write `value` only if the key is still at `expected` (`None` = absent).
    pub fn compare_and_set<T: Serialize>(
        &self,
        keyspace: Keyspace,
        key: &str,
        expected: Option<Version>,
        value: &T,
    ) -> StateResult<CasOutcome> {
        let payload = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let current = {
            let table = txn.open_table(table_for(keyspace)).map_err(map_err!(Table))?;
            current_version(&table, key)?
        };
        if !Precondition::expecting(expected).holds(current) {
            txn.abort().map_err(map_err!(Transaction))?;
            debug!(%keyspace, %key, ?expected, ?current, "compare-and-set conflict");
            return Ok(CasOutcome::Conflict { current });
        }
        let version = next_version(&txn)?;
        {
            let mut table = txn.open_table(table_for(keyspace)).map_err(map_err!(Table))?;
            let raw = encode(version, &payload);
            table
                .insert(key, raw.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(CasOutcome::Committed { version })
    }

    /// Atomically apply a batch of conditioned writes.
    ///
    /// All preconditions are checked against the state before the batch.
    /// If any fails, nothing is written and the first failing key is
    /// reported. Every write of a committed batch gets the same new version.
    pub fn transaction(&self, ops: &[WriteOp]) -> StateResult<TxnOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;

        for op in ops {
            let current = {
                let table = txn
                    .open_table(table_for(op.keyspace))
                    .map_err(map_err!(Table))?;
                current_version(&table, &op.key)?
            };
            if !op.precondition.holds(current) {
                txn.abort().map_err(map_err!(Transaction))?;
                debug!(
                    keyspace = %op.keyspace,
                    key = %op.key,
                    precondition = ?op.precondition,
                    ?current,
                    "transaction conflict"
                );
                return Ok(TxnOutcome::Conflict {
                    keyspace: op.keyspace,
                    key: op.key.clone(),
                });
            }
        }

        let version = next_version(&txn)?;
        for op in ops {
            let mut table = txn
                .open_table(table_for(op.keyspace))
                .map_err(map_err!(Table))?;
            match &op.action {
                WriteAction::Put(payload) => {
                    let raw = encode(version, payload);
                    table
                        .insert(op.key.as_str(), raw.as_slice())
                        .map_err(map_err!(Write))?;
                }
                WriteAction::Delete => {
                    table.remove(op.key.as_str()).map_err(map_err!(Write))?;
                }
                WriteAction::Check => {}
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(TxnOutcome::Committed { version })
    }

    /// Delete a key unconditionally. Returns true if it existed.
    pub fn delete(&self, keyspace: Keyspace, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table_for(keyspace)).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Empty several keyspaces in one transaction. The version sequence is kept.
    pub fn clear(&self, keyspaces: &[Keyspace]) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0;
        for keyspace in keyspaces {
            let mut table = txn.open_table(table_for(*keyspace)).map_err(map_err!(Table))?;
            count += remove_prefix(&mut table, "")?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(?keyspaces, count, "keyspaces cleared");
        Ok(count)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub fn get_task(&self, id: &str) -> StateResult<Option<Versioned<Task>>> {
        self.get_versioned(Keyspace::Tasks, id)
    }

    pub fn list_tasks(&self) -> StateResult<Vec<Versioned<Task>>> {
        Ok(self
            .scan(Keyspace::Tasks, "")?
            .into_iter()
            .map(|(_, task)| task)
            .collect())
    }

    // ── Settings ───────────────────────────────────────────────────

    pub fn get_settings(&self) -> StateResult<Option<Versioned<Settings>>> {
        self.get_versioned(Keyspace::Settings, SETTINGS_KEY)
    }

    /// Settings record, or the built-in defaults when none was written yet.
    pub fn settings(&self) -> StateResult<Settings> {
        Ok(self.get_settings()?.map(|s| s.value).unwrap_or_default())
    }

    /// Write `settings` unless a settings record already exists.
    pub fn seed_settings(&self, settings: &Settings) -> StateResult<bool> {
        let outcome = self.compare_and_set(Keyspace::Settings, SETTINGS_KEY, None, settings)?;
        if outcome.is_committed() {
            debug!(?settings, "settings seeded");
        }
        Ok(outcome.is_committed())
    }

    // ── Semaphores ─────────────────────────────────────────────────

    pub fn get_counter(&self, semaphore: &str) -> StateResult<Option<Versioned<SemaphoreCounter>>> {
        self.get_versioned(Keyspace::Counters, semaphore)
    }

    pub fn list_claims(&self, semaphore: &str) -> StateResult<Vec<SlotClaim>> {
        let prefix = format!("{semaphore}/");
        Ok(self
            .scan::<SlotClaim>(Keyspace::Claims, &prefix)?
            .into_iter()
            .map(|(_, claim)| claim.value)
            .collect())
    }
}

/// Version currently stored under `key`, read inside a write transaction.
fn current_version(
    table: &Table<'_, &'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<Version>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode_version(key, guard.value())?)),
        None => Ok(None),
    }
}

/// Advance the store-wide version sequence.
fn next_version(txn: &WriteTransaction) -> StateResult<Version> {
    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
    let current = meta
        .get(VERSION_SEQ)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    meta.insert(VERSION_SEQ, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn remove_prefix(table: &mut Table<'_, &'static str, &'static [u8]>, prefix: &str) -> StateResult<u32> {
    // Collect first; the range borrows the table.
    let keys: Vec<String> = {
        let mut keys = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }
        keys
    };
    for key in &keys {
        table.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    Ok(keys.len() as u32)
}
