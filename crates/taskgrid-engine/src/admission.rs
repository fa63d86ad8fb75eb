//! Admission queue. Moves enqueued tasks into STARTING under the global bound.
//!
//! `poke` is safe to call redundantly and from any number of engines sharing
//! one store. A slot is claimed before the task is admitted, and a claim
//! whose admission was rejected is returned unless the task went on to hold
//! it through another engine.

use taskgrid_core::{Mode, Task, TaskState};
use taskgrid_state::{Keyspace, Precondition, StateStore, WriteOp};
use tracing::{debug, info};

use crate::controller::{Effect, Event, TaskController};
use crate::error::{EngineError, EngineResult};
use crate::semaphore::{ClaimOutcome, DistributedSemaphore};

/// Snapshot of admission usage.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdmissionUsage {
    pub used: u32,
    pub max: u32,
    pub holders: Vec<String>,
}

#[derive(Clone)]
pub struct AdmissionQueue {
    store: StateStore,
    semaphore: DistributedSemaphore,
    controller: TaskController,
}

impl AdmissionQueue {
    pub fn new(store: StateStore, semaphore: DistributedSemaphore, controller: TaskController) -> Self {
        Self {
            store,
            semaphore,
            controller,
        }
    }

    pub fn semaphore(&self) -> &DistributedSemaphore {
        &self.semaphore
    }

    /// Enqueued, active tasks in admission order: creation sequence, then id.
    pub fn candidates(&self) -> EngineResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .store
            .list_tasks()?
            .into_iter()
            .map(|t| t.value)
            .filter(|t| t.state == TaskState::Enqueued && t.mode == Mode::Active && !t.starting)
            .collect();
        tasks.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    /// Admit as many candidates as there are free slots.
    pub async fn poke(&self) -> EngineResult<Vec<Effect>> {
        let max = self.store.settings()?.max_concurrency;
        let mut effects = Vec::new();

        for task in self.candidates()? {
            match self.semaphore.claim(&task.id, max).await? {
                ClaimOutcome::Full => {
                    debug!(task_id = %task.id, max, "admission full");
                    break;
                }
                ClaimOutcome::Claimed | ClaimOutcome::AlreadyHeld => {}
            }

            match self.controller.apply(&task.id, &Event::Admit).await {
                Ok(applied) => {
                    info!(task_id = %task.id, sequence = task.sequence, "task admitted");
                    effects.extend(applied.effects);
                }
                Err(EngineError::TaskConflict(_) | EngineError::TaskNotFound(_)) => {
                    self.return_slot(&task.id).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(effects)
    }

    /// Give back a slot claimed for a task whose admission was rejected.
    ///
    /// When the task meanwhile reached a slot-holding state it owns the
    /// claim, so it is kept. The release is conditioned on the task record
    /// being unchanged since it was inspected.
    async fn return_slot(&self, id: &str) -> EngineResult<()> {
        let guard = match self.store.get_task(id)? {
            Some(current) if current.value.state.holds_slot() => {
                debug!(task_id = %id, state = %current.value.state, "admitted elsewhere, keeping slot");
                return Ok(());
            }
            Some(current) => WriteOp::check(Keyspace::Tasks, id, Precondition::Version(current.version)),
            None => WriteOp::check(Keyspace::Tasks, id, Precondition::Absent),
        };
        if self.semaphore.release_guarded(id, Some(guard)).await? {
            debug!(task_id = %id, "admission rejected, slot returned");
        }
        Ok(())
    }

    pub fn usage(&self) -> EngineResult<AdmissionUsage> {
        Ok(AdmissionUsage {
            used: self.semaphore.used()?,
            max: self.store.settings()?.max_concurrency,
            holders: self
                .semaphore
                .holders()?
                .into_iter()
                .map(|claim| claim.holder)
                .collect(),
        })
    }
}
