//! Breadth-first poisoning of a failed task's dependants.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use taskgrid_core::TaskId;
use taskgrid_state::StateStore;
use tracing::{debug, info, warn};

use crate::controller::{Effect, Event, TaskController};
use crate::error::{EngineError, EngineResult};

/// How far a rollback reaches from its origin, counted in dependant hops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackDepth {
    Unbounded,
    /// Hops `1..=n`; always at least 1.
    Hops(u32),
}

impl RollbackDepth {
    /// Negative limits are unbounded; 0 and 1 both mean direct dependants only.
    pub fn from_limit(limit: i32) -> Self {
        if limit < 0 {
            RollbackDepth::Unbounded
        } else {
            RollbackDepth::Hops(limit.max(1) as u32)
        }
    }

    pub fn reaches(self, hop: u32) -> bool {
        match self {
            RollbackDepth::Unbounded => true,
            RollbackDepth::Hops(n) => hop <= n,
        }
    }
}

#[derive(Clone)]
pub struct RollbackCoordinator {
    store: StateStore,
    controller: TaskController,
}

impl RollbackCoordinator {
    pub fn new(store: StateStore, controller: TaskController) -> Self {
        Self { store, controller }
    }

    /// Poison every dependant of `origin` within `depth` hops.
    ///
    /// Tasks already terminal are walked through but left unchanged. Each
    /// task is visited once, so diamonds produce one cancel request per task.
    pub async fn rollback(&self, origin: &str, depth: RollbackDepth) -> EngineResult<Vec<Effect>> {
        let Some(origin_task) = self.store.get_task(origin)? else {
            warn!(%origin, "rollback origin vanished");
            return Ok(Vec::new());
        };

        let mut visited: BTreeSet<TaskId> = BTreeSet::from([origin.to_string()]);
        let mut queue: VecDeque<(TaskId, u32)> = VecDeque::new();
        for id in &origin_task.value.dependants {
            if visited.insert(id.clone()) {
                queue.push_back((id.clone(), 1));
            }
        }

        let mut effects = Vec::new();
        let mut poisoned = 0usize;
        while let Some((id, hop)) = queue.pop_front() {
            let applied = match self.controller.apply(&id, &Event::Poison).await {
                Ok(applied) => applied,
                Err(EngineError::TaskNotFound(_)) => {
                    warn!(%origin, task_id = %id, "rollback target vanished");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if applied.from != applied.task.state {
                poisoned += 1;
                debug!(%origin, task_id = %id, hop, to = %applied.task.state, "dependant poisoned");
            }
            effects.extend(applied.effects);

            if depth.reaches(hop + 1) {
                for next in &applied.task.dependants {
                    if visited.insert(next.clone()) {
                        queue.push_back((next.clone(), hop + 1));
                    }
                }
            }
        }

        if poisoned > 0 {
            info!(%origin, ?depth, poisoned, "rollback finished");
        }
        Ok(effects)
    }
}
