//! Liveness supervision for running tasks.
//!
//! A periodic sweep fails UP tasks whose heartbeats stopped and finalizes
//! STOPPING tasks whose cancel was never acknowledged. The decision per task
//! is the pure [`due_event`]; [`Engine::sweep`](crate::Engine::sweep) applies
//! it, and [`HeartbeatSupervisor`] runs the sweep on an interval until
//! shutdown.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use taskgrid_core::{Settings, Task, TaskId, TaskState};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::controller::Event;
use crate::engine::Engine;

/// Event a sweep at `now` must deliver to `task`, if any.
pub fn due_event(task: &Task, settings: &Settings, now: u64) -> Option<Event> {
    match task.state {
        TaskState::Up => {
            let interval = task
                .configuration
                .heartbeat_interval_secs
                .unwrap_or(settings.heartbeat_interval_secs);
            if interval == 0 {
                return None;
            }
            let tolerance = task
                .configuration
                .heartbeat_tolerance
                .unwrap_or(settings.heartbeat_tolerance)
                .max(1);
            let last = task.last_heartbeat.unwrap_or(task.updated_at);
            let deadline = last.saturating_add(interval.saturating_mul(u64::from(tolerance)));
            (now > deadline).then_some(Event::HeartbeatExpired)
        }
        TaskState::Stopping => {
            let timeout = task
                .configuration
                .cancel_timeout_secs
                .unwrap_or(settings.cancel_timeout_secs);
            let since = task.stopping_since.unwrap_or(task.updated_at);
            (now >= since.saturating_add(timeout)).then_some(Event::CancelTimedOut)
        }
        _ => None,
    }
}

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Tasks found in NEW and evaluated (or poisoned).
    pub evaluated: Vec<TaskId>,
    /// UP tasks failed for missing heartbeats.
    pub expired: Vec<TaskId>,
    /// STOPPING tasks finalized after their cancel timeout.
    pub cancel_timeouts: Vec<TaskId>,
    /// Slot claims returned because their task no longer runs.
    pub reaped_claims: Vec<TaskId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.evaluated.is_empty()
            && self.expired.is_empty()
            && self.cancel_timeouts.is_empty()
            && self.reaped_claims.is_empty()
    }
}

/// Background task that sweeps on a fixed interval.
pub struct HeartbeatSupervisor;

impl HeartbeatSupervisor {
    /// Spawn the sweep loop. It exits when `shutdown` flips or its sender is dropped.
    pub fn spawn(engine: Engine, interval: Duration, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(run_sweep_loop(engine, interval, shutdown))
    }
}

async fn run_sweep_loop(engine: Engine, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    debug!(?interval, "sweep loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match engine.sweep(crate::epoch_secs()).await {
                    Ok(report) if !report.is_empty() => {
                        info!(
                            evaluated = report.evaluated.len(),
                            expired = report.expired.len(),
                            cancel_timeouts = report.cancel_timeouts.len(),
                            reaped_claims = report.reaped_claims.len(),
                            "sweep finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "sweep failed"),
                }
            }
            _ = shutdown.changed() => {
                debug!("sweep loop shutting down");
                break;
            }
        }
    }
}
