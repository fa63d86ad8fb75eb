//! Graph installer: validates a batch of tasks and edges and commits it
//! atomically.
//!
//! The cycle check runs over the induced graph: the new tasks, the new
//! edges, and the existing dependency closure of every existing task an
//! edge touches. Every task read while building that graph is part of the
//! commit's preconditions, so a concurrent install cannot slip a cycle in
//! between the check and the write.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use taskgrid_core::{Task, TaskGraph, TaskId, TaskState, TemplateError};
use taskgrid_state::{Keyspace, Precondition, StateStore, TxnOutcome, Versioned, WriteOp};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::graph::DependencyGraph;
use crate::retry::{Attempt, CasRetry};

/// Counter record that stamps tasks with their creation order.
pub const TASK_SEQUENCE: &str = "task_sequence";

/// What a committed install produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
    /// New task ids in dependency order.
    pub order: Vec<TaskId>,
    /// Tasks (new or existing) that gained a dependency that already failed.
    pub poisoned: BTreeSet<TaskId>,
}

#[derive(Clone)]
pub struct GraphInstaller {
    store: StateStore,
    retry: CasRetry,
}

impl GraphInstaller {
    pub fn new(store: StateStore, retry: CasRetry) -> Self {
        Self { store, retry }
    }

    /// Check ids and request templates without touching the store.
    pub fn validate(graph: &TaskGraph) -> EngineResult<()> {
        if graph.tasks.is_empty() {
            return Err(EngineError::InvalidServiceDeclaration(
                "graph contains no tasks".to_string(),
            ));
        }
        for (id, def) in &graph.tasks {
            validate_id(id)?;
            let templates = [
                ("remote_start", Some(&def.remote_start)),
                ("remote_cancel", def.remote_cancel.as_ref()),
                ("caller_notification", def.caller_notification.as_ref()),
            ];
            for (name, template) in templates {
                if let Some(template) = template {
                    template
                        .validate()
                        .map_err(|e| invalid_template(id, name, e))?;
                }
            }
        }
        for edge in &graph.edges {
            validate_id(&edge.source)?;
            validate_id(&edge.target)?;
        }
        Ok(())
    }

    /// Validate and commit `graph`. New tasks are left in `NEW`.
    pub async fn install(&self, graph: &TaskGraph) -> EngineResult<Installed> {
        Self::validate(graph)?;
        let edges: BTreeSet<(&str, &str)> = graph
            .edges
            .iter()
            .map(|e| (e.source.as_str(), e.target.as_str()))
            .collect();

        let installed = self
            .retry
            .run(TASK_SEQUENCE, || self.attempt(graph, &edges))
            .await?;
        info!(
            tasks = installed.order.len(),
            edges = edges.len(),
            poisoned = installed.poisoned.len(),
            "graph installed"
        );
        Ok(installed)
    }

    fn attempt(
        &self,
        graph: &TaskGraph,
        edges: &BTreeSet<(&str, &str)>,
    ) -> EngineResult<Attempt<Installed>> {
        let is_new = |id: &str| graph.tasks.contains_key(id);

        for id in graph.tasks.keys() {
            if self.store.version(Keyspace::Tasks, id)?.is_some() {
                return Err(EngineError::TaskConflict(format!("task {id} already exists")));
            }
        }

        // Existing edge endpoints.
        let mut existing: BTreeMap<TaskId, Versioned<Task>> = BTreeMap::new();
        for &(source, target) in edges {
            for id in [source, target] {
                if !is_new(id) && !existing.contains_key(id) {
                    let task = self
                        .store
                        .get_task(id)?
                        .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
                    existing.insert(id.to_string(), task);
                }
            }
            if let Some(current) = existing.get(target) {
                let state = current.value.state;
                if !matches!(state, TaskState::New | TaskState::Waiting) {
                    return Err(EngineError::TaskConflict(format!(
                        "task {target} is {state}; dependencies can only be added to new or waiting tasks"
                    )));
                }
            }
        }

        // Induced graph: new vertices and edges plus the existing dependency closure.
        let mut induced = DependencyGraph::new();
        for id in graph.tasks.keys() {
            induced.add_vertex(id);
        }
        for &(source, target) in edges {
            induced.add_edge(source, target);
        }
        let mut closure = existing.clone();
        let mut pending: VecDeque<TaskId> = existing.keys().cloned().collect();
        while let Some(id) = pending.pop_front() {
            let dependencies = match closure.get(&id) {
                Some(task) => task.value.dependencies.clone(),
                None => continue,
            };
            for dep in dependencies {
                induced.add_edge(&dep, &id);
                if closure.contains_key(&dep) {
                    continue;
                }
                match self.store.get_task(&dep)? {
                    Some(task) => {
                        closure.insert(dep.clone(), task);
                        pending.push_back(dep);
                    }
                    None => warn!(task_id = %id, dependency = %dep, "dangling dependency"),
                }
            }
        }
        let order = induced
            .topological_order()
            .map_err(|cycle| EngineError::CircularDependency { cycle })?;

        // Materialize.
        let now = crate::epoch_secs();
        let sequence = self.store.get_versioned::<u64>(Keyspace::Counters, TASK_SEQUENCE)?;
        let (base, sequence_version) = match &sequence {
            Some(s) => (s.value, Some(s.version)),
            None => (0, None),
        };

        let new_order: Vec<TaskId> = order.into_iter().filter(|id| is_new(id)).collect();
        let mut fresh: BTreeMap<TaskId, Task> = BTreeMap::new();
        for (index, id) in new_order.iter().enumerate() {
            let def = graph.tasks[id].clone();
            fresh.insert(id.clone(), Task::from_definition(id, def, base + index as u64 + 1, now));
        }

        let mut touched: BTreeMap<TaskId, Task> = BTreeMap::new();
        let mut poisoned = BTreeSet::new();
        for &(source, target) in edges {
            let source_task = match fresh.get(source) {
                Some(task) => task.clone(),
                None => existing[source].value.clone(),
            };

            let target_task = match fresh.get_mut(target) {
                Some(task) => task,
                None => touched
                    .entry(target.to_string())
                    .or_insert_with(|| existing[target].value.clone()),
            };
            if !target_task.dependencies.insert(source.to_string()) {
                continue;
            }
            match source_task.state {
                TaskState::Successful => {
                    target_task.resolved_dependencies.insert(source.to_string());
                    if target_task.configuration.forward_results {
                        if let Some(body) = source_task.final_response() {
                            target_task
                                .dependency_results
                                .insert(source.to_string(), body.clone());
                        }
                    }
                }
                TaskState::Failed => {
                    poisoned.insert(target.to_string());
                    target_task.unfinished_dependencies += 1;
                }
                _ => target_task.unfinished_dependencies += 1,
            }
            target_task.updated_at = now;

            let source_task = match fresh.get_mut(source) {
                Some(task) => task,
                None => touched
                    .entry(source.to_string())
                    .or_insert_with(|| existing[source].value.clone()),
            };
            source_task.dependants.insert(target.to_string());
        }

        // Commit.
        let mut ops = vec![WriteOp::put(
            Keyspace::Counters,
            TASK_SEQUENCE,
            &(base + new_order.len() as u64),
            Precondition::expecting(sequence_version),
        )?];
        for (id, task) in &fresh {
            ops.push(WriteOp::put(Keyspace::Tasks, id.as_str(), task, Precondition::Absent)?);
        }
        for (id, current) in &closure {
            let precondition = Precondition::Version(current.version);
            match touched.get(id) {
                Some(task) => ops.push(WriteOp::put(Keyspace::Tasks, id.as_str(), task, precondition)?),
                None => ops.push(WriteOp::check(Keyspace::Tasks, id.as_str(), precondition)),
            }
        }

        match self.store.transaction(&ops)? {
            TxnOutcome::Committed { version } => {
                debug!(version, new = fresh.len(), touched = touched.len(), "install committed");
                Ok(Attempt::Done(Installed {
                    order: new_order,
                    poisoned,
                }))
            }
            TxnOutcome::Conflict { keyspace, key } => {
                debug!(%keyspace, %key, "install conflict");
                Ok(Attempt::Retry)
            }
        }
    }
}

fn validate_id(id: &str) -> EngineResult<()> {
    if id.trim().is_empty() || id.contains('/') || id.trim() != id {
        return Err(EngineError::InvalidServiceDeclaration(format!(
            "invalid task id {id:?}: must be non-empty, without '/' or surrounding whitespace"
        )));
    }
    Ok(())
}

fn invalid_template(id: &str, name: &str, err: TemplateError) -> EngineError {
    EngineError::InvalidServiceDeclaration(format!("task {id}: {name}: {err}"))
}
