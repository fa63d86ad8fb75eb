//! taskgrid-engine — task-graph orchestration over a shared versioned store.
//!
//! Installs dependency graphs of remote jobs, walks each task through its
//! lifecycle, bounds how many run at once across every engine sharing the
//! store, and fails dependants when a dependency fails.
//!
//! # Architecture
//!
//! ```text
//! Engine (facade + effect driver)
//!   ├── GraphInstaller        validate, cycle check, one transaction per graph
//!   ├── TaskController        pure transition() + CAS apply per event
//!   ├── DependencyPropagator  decrement dependants, forward results
//!   ├── AdmissionQueue        ENQUEUED → STARTING under the slot bound
//!   │   └── DistributedSemaphore (counter + per-holder claims)
//!   ├── RollbackCoordinator   breadth-first poisoning of dependants
//!   ├── RemoteClient          start / cancel / notify HTTP calls
//!   └── HeartbeatSupervisor   periodic sweep: heartbeats, cancel timeouts, orphaned claims
//! ```
//!
//! Components never call each other. Each returns [`Effect`]s and the
//! engine drains them in FIFO order, so a long cascade is a loop.
//!
//! # Coordination
//!
//! There is no lock. Every mutation is a version-checked write wrapped in
//! [`CasRetry`]; a lost race re-reads and re-applies against the new state.

pub mod admission;
pub mod controller;
pub mod engine;
pub mod error;
pub mod graph;
pub mod heartbeat;
pub mod installer;
pub mod propagator;
pub mod remote;
pub mod retry;
pub mod rollback;
pub mod semaphore;

pub use admission::{AdmissionQueue, AdmissionUsage};
pub use controller::{Applied, Effect, Event, TaskController, Transition, transition};
pub use engine::{Engine, EngineOptions};
pub use error::{EngineError, EngineResult};
pub use graph::DependencyGraph;
pub use heartbeat::{HeartbeatSupervisor, SweepReport, due_event};
pub use installer::{GraphInstaller, Installed};
pub use propagator::DependencyPropagator;
pub use remote::{
    HttpRemoteClient, OutboundRequest, RecordingClient, RemoteAction, RemoteClient, RemoteError,
    RemoteResponse, build_request, callback_url,
};
pub use retry::{Attempt, CasRetry};
pub use rollback::{RollbackCoordinator, RollbackDepth};
pub use semaphore::{ADMISSION, ClaimOutcome, DistributedSemaphore};

/// Seconds since the Unix epoch.
pub(crate) fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
