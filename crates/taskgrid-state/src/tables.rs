//! redb table definitions for the TaskGrid state store.
//!
//! Record tables use `&str` keys and `&[u8]` values. Every value starts with
//! an 8-byte big-endian version followed by the JSON-serialized record.

use redb::TableDefinition;

use crate::types::Keyspace;

/// Task records keyed by task id.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Semaphore counters keyed by semaphore name.
pub const COUNTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("counters");

/// Slot claims keyed by `{semaphore}/{holder}`.
pub const CLAIMS: TableDefinition<&str, &[u8]> = TableDefinition::new("claims");

/// Cluster settings keyed by `global`.
pub const SETTINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

/// Store bookkeeping. Holds the version sequence under [`VERSION_SEQ`].
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const VERSION_SEQ: &str = "version_seq";

pub(crate) fn table_for(keyspace: Keyspace) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match keyspace {
        Keyspace::Tasks => TASKS,
        Keyspace::Counters => COUNTERS,
        Keyspace::Claims => CLAIMS,
        Keyspace::Settings => SETTINGS,
    }
}
