//! Updates dependants when a task becomes terminal.
//!
//! Success resolves one dependency edge on each dependant: the source id is
//! added to `resolved_dependencies` and `unfinished_dependencies` drops by
//! one, in the same write that re-evaluates the dependant. The marker makes
//! a second delivery of the same success a no-op.
//!
//! Failure hands the dependants to the rollback coordinator, unless the task
//! itself was failed by a cascade.

use taskgrid_core::{StopFlag, Task, TaskState};
use taskgrid_state::{CasOutcome, Keyspace, StateStore};
use tracing::{debug, warn};

use crate::controller::{Effect, Event, transition};
use crate::error::{EngineError, EngineResult};
use crate::retry::{Attempt, CasRetry};
use crate::rollback::RollbackDepth;

#[derive(Clone)]
pub struct DependencyPropagator {
    store: StateStore,
    retry: CasRetry,
}

impl DependencyPropagator {
    pub fn new(store: StateStore, retry: CasRetry) -> Self {
        Self { store, retry }
    }

    /// React to task `id` having reached a terminal state.
    pub async fn on_terminal(&self, id: &str) -> EngineResult<Vec<Effect>> {
        let task = self
            .store
            .get_task(id)?
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?
            .value;

        match task.state {
            TaskState::Successful => {
                let mut effects = Vec::new();
                for dependant in &task.dependants {
                    match self.resolve(&task, dependant).await {
                        Ok(more) => effects.extend(more),
                        Err(EngineError::TaskNotFound(_)) => {
                            warn!(task_id = %id, %dependant, "dependant vanished");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(effects)
            }
            TaskState::Failed if task.stop_flag == StopFlag::DependencyFailed => {
                debug!(task_id = %id, "failed by cascade, not starting another");
                Ok(Vec::new())
            }
            TaskState::Failed if task.dependants.is_empty() => Ok(Vec::new()),
            TaskState::Failed => {
                let limit = match task.configuration.rollback_limit {
                    Some(limit) => limit,
                    None => self.store.settings()?.rollback_limit,
                };
                Ok(vec![Effect::Rollback {
                    origin: task.id.clone(),
                    depth: RollbackDepth::from_limit(limit),
                }])
            }
            state => {
                warn!(task_id = %id, %state, "propagation requested for non-terminal task");
                Ok(Vec::new())
            }
        }
    }

    /// Apply `source`'s success to one dependant and re-evaluate it.
    async fn resolve(&self, source: &Task, dependant: &str) -> EngineResult<Vec<Effect>> {
        let result = source.final_response().cloned();
        self.retry
            .run(dependant, || {
                let current = self
                    .store
                    .get_task(dependant)?
                    .ok_or_else(|| EngineError::TaskNotFound(dependant.to_string()))?;
                let mut task = current.value;
                if task.state.is_terminal() || !task.resolved_dependencies.insert(source.id.clone()) {
                    return Ok(Attempt::Done(Vec::new()));
                }
                task.unfinished_dependencies = task.unfinished_dependencies.saturating_sub(1);
                if task.configuration.forward_results {
                    if let Some(body) = &result {
                        task.dependency_results.insert(source.id.clone(), body.clone());
                    }
                }

                let step = transition(&task, &Event::Evaluate, crate::epoch_secs())?;
                let next = if step.changed { step.task } else { task };

                match self.store.compare_and_set(
                    Keyspace::Tasks,
                    dependant,
                    Some(current.version),
                    &next,
                )? {
                    CasOutcome::Committed { .. } => {
                        debug!(
                            source = %source.id,
                            %dependant,
                            unfinished = next.unfinished_dependencies,
                            state = %next.state,
                            "dependency resolved"
                        );
                        Ok(Attempt::Done(step.effects))
                    }
                    CasOutcome::Conflict { .. } => Ok(Attempt::Retry),
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskgrid_core::{RequestTemplate, ServerResponse, StateChange, TaskDefinition};

    fn stored(store: &StateStore, id: &str, state: TaskState, deps: &[&str], dependants: &[&str]) -> Task {
        let def = TaskDefinition::new(RequestTemplate::post("http://exec/start"));
        let mut task = Task::from_definition(id, def, 1, 100);
        task.state = state;
        task.dependencies = deps.iter().map(|d| d.to_string()).collect();
        task.dependants = dependants.iter().map(|d| d.to_string()).collect();
        task.unfinished_dependencies = deps.len() as u32;
        store.put(Keyspace::Tasks, id, &task).unwrap();
        task
    }

    fn propagator(store: &StateStore) -> DependencyPropagator {
        DependencyPropagator::new(store.clone(), CasRetry::default())
    }

    #[tokio::test]
    async fn success_unblocks_dependants() {
        let store = StateStore::open_in_memory().unwrap();
        stored(&store, "a", TaskState::Successful, &[], &["b", "c"]);
        stored(&store, "b", TaskState::Waiting, &["a"], &[]);
        stored(&store, "c", TaskState::Waiting, &["a", "x"], &[]);

        let effects = propagator(&store).on_terminal("a").await.unwrap();
        assert_eq!(effects, vec![Effect::Poke]);

        let b = store.get_task("b").unwrap().unwrap().value;
        assert_eq!(b.state, TaskState::Enqueued);
        assert_eq!(b.unfinished_dependencies, 0);

        let c = store.get_task("c").unwrap().unwrap().value;
        assert_eq!(c.state, TaskState::Waiting);
        assert_eq!(c.unfinished_dependencies, 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_does_not_double_decrement() {
        let store = StateStore::open_in_memory().unwrap();
        stored(&store, "a", TaskState::Successful, &[], &["c"]);
        stored(&store, "c", TaskState::Waiting, &["a", "b"], &[]);

        let p = propagator(&store);
        p.on_terminal("a").await.unwrap();
        p.on_terminal("a").await.unwrap();

        let c = store.get_task("c").unwrap().unwrap().value;
        assert_eq!(c.unfinished_dependencies, 1);
        assert_eq!(c.state, TaskState::Waiting);
    }

    #[tokio::test]
    async fn forwards_final_result_when_configured() {
        let store = StateStore::open_in_memory().unwrap();
        let mut a = stored(&store, "a", TaskState::Successful, &[], &["b"]);
        a.server_responses.push(ServerResponse {
            received_at: 150,
            positive: true,
            body: json!({"rows": 42}),
            transition: Some(StateChange {
                from: TaskState::Up,
                to: TaskState::Successful,
            }),
        });
        store.put(Keyspace::Tasks, "a", &a).unwrap();
        let mut b = stored(&store, "b", TaskState::Waiting, &["a"], &[]);
        b.configuration.forward_results = true;
        store.put(Keyspace::Tasks, "b", &b).unwrap();

        propagator(&store).on_terminal("a").await.unwrap();
        let b = store.get_task("b").unwrap().unwrap().value;
        assert_eq!(b.dependency_results.get("a"), Some(&json!({"rows": 42})));
    }

    #[tokio::test]
    async fn failure_requests_rollback_with_configured_depth() {
        let store = StateStore::open_in_memory().unwrap();
        let mut a = stored(&store, "a", TaskState::Failed, &[], &["b"]);
        a.stop_flag = StopFlag::SystemFailure;
        a.configuration.rollback_limit = Some(1);
        store.put(Keyspace::Tasks, "a", &a).unwrap();

        let effects = propagator(&store).on_terminal("a").await.unwrap();
        assert_eq!(
            effects,
            vec![Effect::Rollback {
                origin: "a".into(),
                depth: RollbackDepth::Hops(1)
            }]
        );
    }

    #[tokio::test]
    async fn cascade_failure_does_not_cascade_again() {
        let store = StateStore::open_in_memory().unwrap();
        let mut a = stored(&store, "a", TaskState::Failed, &[], &["b"]);
        a.stop_flag = StopFlag::DependencyFailed;
        store.put(Keyspace::Tasks, "a", &a).unwrap();

        assert!(propagator(&store).on_terminal("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_dependants_are_left_alone() {
        let store = StateStore::open_in_memory().unwrap();
        stored(&store, "a", TaskState::Successful, &[], &["b"]);
        stored(&store, "b", TaskState::Failed, &["a"], &[]);

        assert!(propagator(&store).on_terminal("a").await.unwrap().is_empty());
        let b = store.get_task("b").unwrap().unwrap().value;
        assert_eq!(b.unfinished_dependencies, 1);
    }
}
