//! Per-task lifecycle state machine.
//!
//! [`transition`] is a pure function from a task and an [`Event`] to the
//! next task record plus the [`Effect`]s the engine must run afterwards.
//! [`TaskController::apply`] reads a task, runs the transition, and commits
//! the result with compare-and-set, re-running it against fresh state when
//! another writer got there first.
//!
//! ```text
//! NEW → WAITING → ENQUEUED → STARTING → UP → STOPPING → { SUCCESSFUL | FAILED }
//! ```
//!
//! States may be skipped but never revisited. A task becomes terminal
//! through exactly one committed write, so the terminal effects
//! (slot release, poke, propagation, caller notification) are emitted once.

use taskgrid_core::{Mode, ServerResponse, StateChange, StopFlag, Task, TaskId, TaskState};
use taskgrid_state::{CasOutcome, Keyspace, StateStore};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::retry::{Attempt, CasRetry};
use crate::rollback::RollbackDepth;

/// Input to the task state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Re-check dispatchability (after install, propagation, or mode change).
    Evaluate,
    /// The admission queue claimed a slot for this task.
    Admit,
    /// The start request reached the remote side.
    StartDelivered { body: serde_json::Value },
    /// The start request could not be delivered.
    StartFailed { reason: String },
    /// The cancel request reached the remote side.
    CancelDelivered { body: serde_json::Value },
    /// Positive response from the remote side.
    Accept { body: serde_json::Value },
    /// Negative response from the remote side.
    Fail { body: serde_json::Value },
    /// Operator cancellation.
    Cancel,
    /// A dependency failed.
    Poison,
    SetMode(Mode),
    Heartbeat,
    HeartbeatExpired,
    CancelTimedOut,
}

/// Follow-up work produced by a component and executed by the engine driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Try to admit enqueued tasks.
    Poke,
    /// Send the start request.
    Dispatch(TaskId),
    /// Send the cancel request.
    SendCancel(TaskId),
    /// Give back the task's admission slot.
    ReleaseSlot(TaskId),
    /// Update dependants of a task that just became terminal.
    Propagate(TaskId),
    /// Poison the dependants of `origin` up to `depth` hops.
    Rollback { origin: TaskId, depth: RollbackDepth },
    /// Tell the caller the task finished.
    NotifyCaller(TaskId),
}

/// Result of running one event through the state machine.
#[derive(Debug, Clone)]
pub struct Transition {
    pub task: Task,
    pub effects: Vec<Effect>,
    /// False when the event left the record untouched (nothing to write).
    pub changed: bool,
}

impl Transition {
    fn unchanged(task: &Task) -> Self {
        Self {
            task: task.clone(),
            effects: Vec::new(),
            changed: false,
        }
    }
}

/// Compute the effect of `event` on `task` at time `now` (epoch seconds).
pub fn transition(task: &Task, event: &Event, now: u64) -> EngineResult<Transition> {
    let mut next = task.clone();
    let prev = task.state;
    let mut effects = Vec::new();

    match event {
        Event::Evaluate => match prev {
            TaskState::New | TaskState::Waiting if task.mode == Mode::Cancel => {
                next.set_stop_flag(StopFlag::Cancelled);
                finish(&mut next, TaskState::Failed, &mut effects);
            }
            TaskState::New | TaskState::Waiting if task.is_dispatchable() => {
                next.state = TaskState::Enqueued;
                effects.push(Effect::Poke);
            }
            TaskState::New => next.state = TaskState::Waiting,
            _ => return Ok(Transition::unchanged(task)),
        },

        Event::Admit => {
            if prev != TaskState::Enqueued || task.mode != Mode::Active || task.starting {
                return Err(conflict(task, "admit"));
            }
            next.state = TaskState::Starting;
            next.starting = true;
            effects.push(Effect::Dispatch(task.id.clone()));
        }

        Event::StartDelivered { body } => {
            next.starting = false;
            record(&mut next, now, true, body.clone(), None);
        }

        Event::StartFailed { reason } => {
            next.starting = false;
            let body = serde_json::json!({ "error": reason });
            if prev == TaskState::Starting {
                next.set_stop_flag(StopFlag::SystemFailure);
                finish(&mut next, TaskState::Failed, &mut effects);
                record(&mut next, now, false, body, Some((prev, TaskState::Failed)));
            } else {
                // A callback overtook the start response.
                record(&mut next, now, false, body, None);
            }
        }

        Event::CancelDelivered { body } => {
            record(&mut next, now, true, body.clone(), None);
        }

        Event::Accept { body } => match prev {
            TaskState::Starting => {
                next.state = TaskState::Up;
                next.starting = false;
                next.last_heartbeat = Some(now);
                record(&mut next, now, true, body.clone(), Some((prev, TaskState::Up)));
            }
            TaskState::Up | TaskState::Stopping => {
                let to = if prev == TaskState::Stopping && !task.configuration.stop_counts_as_success {
                    TaskState::Failed
                } else {
                    TaskState::Successful
                };
                finish(&mut next, to, &mut effects);
                record(&mut next, now, true, body.clone(), Some((prev, to)));
            }
            TaskState::Successful | TaskState::Failed => {
                record(&mut next, now, true, body.clone(), None);
            }
            TaskState::New | TaskState::Waiting | TaskState::Enqueued => {
                return Err(conflict(task, "accept a response for"));
            }
        },

        Event::Fail { body } => match prev {
            TaskState::Starting | TaskState::Up | TaskState::Stopping => {
                next.starting = false;
                next.set_stop_flag(StopFlag::SystemFailure);
                finish(&mut next, TaskState::Failed, &mut effects);
                record(&mut next, now, false, body.clone(), Some((prev, TaskState::Failed)));
            }
            TaskState::Successful | TaskState::Failed => {
                record(&mut next, now, false, body.clone(), None);
            }
            TaskState::New | TaskState::Waiting | TaskState::Enqueued => {
                return Err(conflict(task, "accept a response for"));
            }
        },

        Event::Cancel | Event::SetMode(Mode::Cancel) => {
            if prev.is_terminal() {
                return Err(conflict(task, "cancel"));
            }
            next.mode = Mode::Cancel;
            next.set_stop_flag(StopFlag::Cancelled);
            stop(&mut next, now, &mut effects);
        }

        Event::Poison => {
            if prev.is_terminal() {
                return Ok(Transition::unchanged(task));
            }
            next.set_stop_flag(StopFlag::DependencyFailed);
            stop(&mut next, now, &mut effects);
        }

        Event::SetMode(mode) => {
            if prev.is_terminal() {
                return Err(conflict(task, "change the mode of"));
            }
            if task.mode == Mode::Cancel {
                return Err(conflict(task, "reactivate"));
            }
            next.mode = *mode;
            match prev {
                TaskState::New | TaskState::Waiting if next.is_dispatchable() => {
                    next.state = TaskState::Enqueued;
                    effects.push(Effect::Poke);
                }
                TaskState::Enqueued if *mode == Mode::Active => effects.push(Effect::Poke),
                _ => {}
            }
        }

        Event::Heartbeat => {
            if prev != TaskState::Up {
                return Ok(Transition::unchanged(task));
            }
            next.last_heartbeat = Some(now);
        }

        Event::HeartbeatExpired => {
            if prev != TaskState::Up {
                return Ok(Transition::unchanged(task));
            }
            next.set_stop_flag(StopFlag::SystemFailure);
            if task.remote_cancel.is_some() {
                effects.push(Effect::SendCancel(task.id.clone()));
            }
            finish(&mut next, TaskState::Failed, &mut effects);
        }

        Event::CancelTimedOut => {
            if prev != TaskState::Stopping {
                return Ok(Transition::unchanged(task));
            }
            finish(&mut next, TaskState::Failed, &mut effects);
        }
    }

    debug_assert!(
        next.state == prev || prev.can_advance_to(next.state),
        "state regressed from {prev} to {}",
        next.state
    );
    next.updated_at = now;
    Ok(Transition {
        task: next,
        effects,
        changed: true,
    })
}

/// Cancel/poison common path: stop a running task, fail a pending one.
fn stop(next: &mut Task, now: u64, effects: &mut Vec<Effect>) {
    match next.state {
        TaskState::New | TaskState::Waiting | TaskState::Enqueued => {
            finish(next, TaskState::Failed, effects);
        }
        TaskState::Starting | TaskState::Up if next.remote_cancel.is_some() => {
            next.state = TaskState::Stopping;
            next.stopping_since = Some(now);
            effects.push(Effect::SendCancel(next.id.clone()));
        }
        TaskState::Starting | TaskState::Up => finish(next, TaskState::Failed, effects),
        TaskState::Stopping | TaskState::Successful | TaskState::Failed => {}
    }
}

/// Move to a terminal state and queue the terminal effects.
fn finish(next: &mut Task, to: TaskState, effects: &mut Vec<Effect>) {
    let from = next.state;
    next.state = to;
    next.starting = false;
    let id = next.id.clone();

    if from.holds_slot() {
        effects.push(Effect::ReleaseSlot(id.clone()));
    }
    effects.push(Effect::Poke);

    let notify = next.caller_notification.is_some();
    if notify && next.configuration.delay_dependant_notification {
        effects.push(Effect::NotifyCaller(id.clone()));
    }
    effects.push(Effect::Propagate(id.clone()));
    if notify && !next.configuration.delay_dependant_notification {
        effects.push(Effect::NotifyCaller(id));
    }
}

fn record(
    next: &mut Task,
    now: u64,
    positive: bool,
    body: serde_json::Value,
    change: Option<(TaskState, TaskState)>,
) {
    next.server_responses.push(ServerResponse {
        received_at: now,
        positive,
        body,
        transition: change.map(|(from, to)| StateChange { from, to }),
    });
}

fn conflict(task: &Task, action: &str) -> EngineError {
    EngineError::TaskConflict(format!(
        "cannot {action} task {} in state {} (mode {})",
        task.id, task.state, task.mode
    ))
}

// ── Store-facing layer ─────────────────────────────────────────────

/// A transition that was committed to the store.
#[derive(Debug, Clone)]
pub struct Applied {
    pub from: TaskState,
    pub task: Task,
    pub effects: Vec<Effect>,
}

/// Applies state machine events to stored tasks with compare-and-set.
#[derive(Clone)]
pub struct TaskController {
    store: StateStore,
    retry: CasRetry,
}

impl TaskController {
    pub fn new(store: StateStore, retry: CasRetry) -> Self {
        Self { store, retry }
    }

    /// Apply `event` to task `id`, retrying on concurrent writes.
    pub async fn apply(&self, id: &str, event: &Event) -> EngineResult<Applied> {
        self.retry
            .run(id, || {
                let current = self
                    .store
                    .get_task(id)?
                    .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
                let from = current.value.state;
                let step = transition(&current.value, event, crate::epoch_secs())?;
                if !step.changed {
                    return Ok(Attempt::Done(Applied {
                        from,
                        task: step.task,
                        effects: step.effects,
                    }));
                }

                match self
                    .store
                    .compare_and_set(Keyspace::Tasks, id, Some(current.version), &step.task)?
                {
                    CasOutcome::Committed { .. } => {
                        if from != step.task.state {
                            debug!(
                                task_id = %id,
                                %from,
                                to = %step.task.state,
                                stop_flag = %step.task.stop_flag,
                                "task transition"
                            );
                        }
                        Ok(Attempt::Done(Applied {
                            from,
                            task: step.task,
                            effects: step.effects,
                        }))
                    }
                    CasOutcome::Conflict { .. } => Ok(Attempt::Retry),
                }
            })
            .await
    }
}
