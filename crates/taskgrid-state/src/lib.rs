//! taskgrid-state — versioned state store for TaskGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for tasks, semaphore counters, slot claims, and cluster settings.
//!
//! # Architecture
//!
//! ```text
//! StateStore
//!   ├── get / get_versioned / scan     read-only snapshots
//!   ├── put                            unconditional write
//!   ├── compare_and_set                single-key optimistic write
//!   └── transaction(&[WriteOp])        all-or-nothing multi-key write
//!         └── Precondition::{Any, Absent, Version(v)}
//! ```
//!
//! Values are stored as an 8-byte version prefix followed by JSON. Versions
//! come from one store-wide sequence, so a deleted and re-created key never
//! repeats a version an old reader might still hold.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks and engine instances.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
