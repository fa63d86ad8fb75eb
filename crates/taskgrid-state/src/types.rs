//! Store-level types: keyspaces, versioned values, write preconditions,
//! and the small records the engine keeps next to tasks.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::error::{StateError, StateResult};

/// Monotonic record version. Drawn from a store-wide sequence, never reused.
pub type Version = u64;

/// A logical table of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyspace {
    Tasks,
    Counters,
    Claims,
    Settings,
}

impl Keyspace {
    pub const ALL: [Keyspace; 4] = [
        Keyspace::Tasks,
        Keyspace::Counters,
        Keyspace::Claims,
        Keyspace::Settings,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Keyspace::Tasks => "tasks",
            Keyspace::Counters => "counters",
            Keyspace::Claims => "claims",
            Keyspace::Settings => "settings",
        }
    }
}

impl fmt::Display for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded value together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: Version,
    pub value: T,
}

/// Condition a key must satisfy for a write to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional.
    Any,
    /// The key must not exist.
    Absent,
    /// The key must exist at exactly this version.
    Version(Version),
}

impl Precondition {
    /// `None` means "must be absent", as in compare-and-set.
    pub fn expecting(expected: Option<Version>) -> Self {
        match expected {
            Some(v) => Precondition::Version(v),
            None => Precondition::Absent,
        }
    }

    pub(crate) fn holds(self, current: Option<Version>) -> bool {
        match (self, current) {
            (Precondition::Any, _) => true,
            (Precondition::Absent, None) => true,
            (Precondition::Version(want), Some(have)) => want == have,
            _ => false,
        }
    }
}

/// What a [`WriteOp`] does to its key once the precondition holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteAction {
    /// Store a JSON payload under a fresh version.
    Put(Vec<u8>),
    Delete,
    /// Leave the key untouched; only the precondition matters.
    Check,
}

/// One entry of a multi-key transaction.
#[derive(Debug, Clone)]
pub struct WriteOp {
    pub keyspace: Keyspace,
    pub key: String,
    pub precondition: Precondition,
    pub action: WriteAction,
}

impl WriteOp {
    pub fn put<T: Serialize>(
        keyspace: Keyspace,
        key: impl Into<String>,
        value: &T,
        precondition: Precondition,
    ) -> StateResult<Self> {
        let payload = serde_json::to_vec(value).map_err(|e| StateError::Serialize(e.to_string()))?;
        Ok(Self {
            keyspace,
            key: key.into(),
            precondition,
            action: WriteAction::Put(payload),
        })
    }

    pub fn delete(keyspace: Keyspace, key: impl Into<String>, precondition: Precondition) -> Self {
        Self {
            keyspace,
            key: key.into(),
            precondition,
            action: WriteAction::Delete,
        }
    }

    pub fn check(keyspace: Keyspace, key: impl Into<String>, precondition: Precondition) -> Self {
        Self {
            keyspace,
            key: key.into(),
            precondition,
            action: WriteAction::Check,
        }
    }
}

/// Result of a compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Committed { version: Version },
    Conflict { current: Option<Version> },
}

impl CasOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CasOutcome::Committed { .. })
    }
}

/// Result of a multi-key transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed { version: Version },
    /// Nothing was written; the named key failed its precondition.
    Conflict { keyspace: Keyspace, key: String },
}

impl TxnOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TxnOutcome::Committed { .. })
    }
}

// ── Records ────────────────────────────────────────────────────────

/// Counter behind a distributed semaphore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreCounter {
    pub used: u32,
}

/// Proof that `holder` owns one slot of `semaphore`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotClaim {
    pub semaphore: String,
    pub holder: String,
    /// Node or engine instance that made the claim.
    pub operation_id: String,
    pub claimed_at: u64,
}

impl SlotClaim {
    pub fn key(semaphore: &str, holder: &str) -> String {
        format!("{semaphore}/{holder}")
    }

    pub fn table_key(&self) -> String {
        Self::key(&self.semaphore, &self.holder)
    }
}

pub const SETTINGS_KEY: &str = "global";

// ── Value encoding ─────────────────────────────────────────────────

const VERSION_LEN: usize = 8;

pub(crate) fn encode(version: Version, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(VERSION_LEN + payload.len());
    buf.extend_from_slice(&version.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub(crate) fn decode_version(key: &str, raw: &[u8]) -> StateResult<Version> {
    let prefix: [u8; VERSION_LEN] = raw
        .get(..VERSION_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StateError::Corrupt {
            key: key.to_string(),
            reason: format!("value shorter than {VERSION_LEN} bytes"),
        })?;
    Ok(Version::from_be_bytes(prefix))
}

pub(crate) fn decode<T: DeserializeOwned>(key: &str, raw: &[u8]) -> StateResult<Versioned<T>> {
    let version = decode_version(key, raw)?;
    let value = serde_json::from_slice(&raw[VERSION_LEN..])
        .map_err(|e| StateError::Deserialize(format!("{key}: {e}")))?;
    Ok(Versioned { version, value })
}
