//! Engine facade and effect driver.
//!
//! Every public operation applies one event (or installs one graph) and then
//! drains the resulting effects in FIFO order. Handlers return further
//! effects instead of calling each other, so a long cascade is a loop rather
//! than a recursion.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use taskgrid_core::{Mode, Phase, Settings, Task, TaskGraph, TaskId, TaskState};
use taskgrid_state::{CasOutcome, Keyspace, Precondition, SETTINGS_KEY, StateStore, WriteOp};
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionQueue, AdmissionUsage};
use crate::controller::{Effect, Event, TaskController};
use crate::error::{EngineError, EngineResult};
use crate::heartbeat::{SweepReport, due_event};
use crate::installer::GraphInstaller;
use crate::propagator::DependencyPropagator;
use crate::remote::{RemoteAction, RemoteClient, build_request};
use crate::retry::{Attempt, CasRetry};
use crate::rollback::{RollbackCoordinator, RollbackDepth};
use crate::semaphore::{ADMISSION, DistributedSemaphore};

/// Per-instance engine settings. Cluster-wide policy lives in the store's
/// [`Settings`] record instead.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Base URL remote jobs use to report back.
    pub callback_base_url: String,
    /// Identifies this engine on the slot claims it makes.
    pub node_id: String,
    pub retry: CasRetry,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            callback_base_url: "http://127.0.0.1:8650".to_string(),
            node_id: "taskgrid-0".to_string(),
            retry: CasRetry::default(),
        }
    }
}

/// Task-graph orchestration engine. Cheap to clone; clones share components.
///
/// Any number of engines may share one [`StateStore`]; they coordinate only
/// through versioned writes.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    store: StateStore,
    remote: Arc<dyn RemoteClient>,
    options: EngineOptions,
    controller: TaskController,
    installer: GraphInstaller,
    propagator: DependencyPropagator,
    queue: AdmissionQueue,
    rollback: RollbackCoordinator,
}

impl Engine {
    pub fn new(store: StateStore, remote: Arc<dyn RemoteClient>, options: EngineOptions) -> Self {
        let retry = options.retry;
        let controller = TaskController::new(store.clone(), retry);
        let semaphore = DistributedSemaphore::new(store.clone(), ADMISSION, &options.node_id, retry);
        let inner = Inner {
            installer: GraphInstaller::new(store.clone(), retry),
            propagator: DependencyPropagator::new(store.clone(), retry),
            queue: AdmissionQueue::new(store.clone(), semaphore, controller.clone()),
            rollback: RollbackCoordinator::new(store.clone(), controller.clone()),
            controller,
            store,
            remote,
            options,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    // ── Graphs ─────────────────────────────────────────────────────

    /// Install a graph and evaluate its tasks. A task whose evaluation fails
    /// here stays `NEW` until the next sweep picks it up.
    pub async fn install(&self, graph: &TaskGraph) -> EngineResult<Vec<Task>> {
        let installed = self.inner.installer.install(graph).await?;
        let settings = self.inner.store.settings()?;
        let mut effects = Vec::new();
        let mut first_error = None;

        let existing_poisoned = installed
            .poisoned
            .iter()
            .filter(|id| !graph.tasks.contains_key(id.as_str()));
        for id in installed.order.iter().chain(existing_poisoned) {
            let poisoned = installed.poisoned.contains(id);
            match self.settle_new(id, poisoned, &settings).await {
                Ok(settled) => effects.extend(settled),
                Err(e) => {
                    error!(task_id = %id, error = %e, "task evaluation after install failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        effects.push(Effect::Poke);
        let driven = self.drive(effects).await;
        if let Some(e) = first_error {
            return Err(e);
        }
        driven?;

        installed.order.iter().map(|id| self.get_task(id)).collect()
    }

    /// Move a freshly installed task out of `NEW`, or poison it when one of
    /// its dependencies has already failed.
    async fn settle_new(
        &self,
        id: &str,
        poisoned: bool,
        settings: &Settings,
    ) -> EngineResult<Vec<Effect>> {
        if poisoned {
            let applied = self.inner.controller.apply(id, &Event::Poison).await?;
            info!(task_id = %id, "dependency already failed, task poisoned");
            let mut effects = applied.effects;
            effects.push(Effect::Rollback {
                origin: id.to_string(),
                depth: rollback_depth(&applied.task, settings),
            });
            Ok(effects)
        } else {
            Ok(self.inner.controller.apply(id, &Event::Evaluate).await?.effects)
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get_task(&self, id: &str) -> EngineResult<Task> {
        self.inner
            .store
            .get_task(id)?
            .map(|t| t.value)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))
    }

    /// Tasks in creation order, optionally restricted to one phase.
    pub fn list_tasks(&self, phase: Option<Phase>) -> EngineResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .inner
            .store
            .list_tasks()?
            .into_iter()
            .map(|t| t.value)
            .filter(|t| phase.is_none_or(|p| t.phase() == p))
            .collect();
        tasks.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    // ── Operator actions ───────────────────────────────────────────

    /// Cancel a task and poison everything that depends on it, at any depth.
    pub async fn cancel(&self, id: &str) -> EngineResult<Task> {
        let applied = self.inner.controller.apply(id, &Event::Cancel).await?;
        info!(task_id = %id, from = %applied.from, to = %applied.task.state, "task cancelled");
        let mut effects = applied.effects;
        effects.push(Effect::Rollback {
            origin: id.to_string(),
            depth: RollbackDepth::Unbounded,
        });
        self.drive(effects).await?;
        self.get_task(id)
    }

    /// Cancel every unfinished task carrying `correlation_id`.
    pub async fn cancel_correlation(&self, correlation_id: &str) -> EngineResult<Vec<TaskId>> {
        let matching: Vec<Task> = self
            .list_tasks(None)?
            .into_iter()
            .filter(|t| t.correlation_id.as_deref() == Some(correlation_id))
            .collect();
        if matching.is_empty() {
            return Err(EngineError::TaskNotFound(format!("correlation {correlation_id}")));
        }

        let mut cancelled = Vec::new();
        for task in matching.iter().filter(|t| !t.state.is_terminal()) {
            match self.cancel(&task.id).await {
                Ok(_) => cancelled.push(task.id.clone()),
                // Finished meanwhile, possibly by an earlier cancel's cascade.
                Err(EngineError::TaskConflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!(%correlation_id, cancelled = cancelled.len(), "correlation cancelled");
        Ok(cancelled)
    }

    pub async fn set_mode(&self, id: &str, mode: Mode) -> EngineResult<Task> {
        if mode == Mode::Cancel {
            return self.cancel(id).await;
        }
        let applied = self.inner.controller.apply(id, &Event::SetMode(mode)).await?;
        info!(task_id = %id, %mode, state = %applied.task.state, "task mode changed");
        self.drive(applied.effects).await?;
        self.get_task(id)
    }

    /// Deliver a response from the remote side.
    pub async fn callback(&self, id: &str, positive: bool, body: Value) -> EngineResult<Task> {
        let event = if positive {
            Event::Accept { body }
        } else {
            Event::Fail { body }
        };
        let applied = match self.inner.controller.apply(id, &event).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!(task_id = %id, positive, error = %e, "callback rejected");
                return Err(e);
            }
        };
        if applied.from == applied.task.state {
            debug!(task_id = %id, state = %applied.from, "response recorded without transition");
        }
        self.drive(applied.effects).await?;
        self.get_task(id)
    }

    pub async fn heartbeat(&self, id: &str) -> EngineResult<Task> {
        Ok(self.inner.controller.apply(id, &Event::Heartbeat).await?.task)
    }

    // ── Admission and settings ─────────────────────────────────────

    /// Admit whatever fits under the current bound.
    pub async fn poke(&self) -> EngineResult<()> {
        self.drive(vec![Effect::Poke]).await
    }

    pub fn settings(&self) -> EngineResult<Settings> {
        Ok(self.inner.store.settings()?)
    }

    pub fn max_concurrency(&self) -> EngineResult<u32> {
        Ok(self.settings()?.max_concurrency)
    }

    /// Change the admission bound. Running tasks are never preempted.
    pub async fn set_max_concurrency(&self, max: u32) -> EngineResult<Settings> {
        let settings = self
            .modify_settings(|settings| settings.max_concurrency = max)
            .await?;
        info!(max, "max concurrency updated");
        self.poke().await?;
        Ok(settings)
    }

    /// Replace the whole settings record.
    pub async fn update_settings(&self, update: Settings) -> EngineResult<Settings> {
        let settings = self
            .modify_settings(|settings| *settings = update.clone())
            .await?;
        info!(?settings, "settings updated");
        self.poke().await?;
        Ok(settings)
    }

    async fn modify_settings(&self, change: impl Fn(&mut Settings)) -> EngineResult<Settings> {
        let store = &self.inner.store;
        self.inner
            .options
            .retry
            .run(SETTINGS_KEY, || {
                let current = store.get_settings()?;
                let (mut settings, version) = match current {
                    Some(s) => (s.value, Some(s.version)),
                    None => (Settings::default(), None),
                };
                change(&mut settings);
                match store.compare_and_set(Keyspace::Settings, SETTINGS_KEY, version, &settings)? {
                    CasOutcome::Committed { .. } => Ok(Attempt::Done(settings)),
                    CasOutcome::Conflict { .. } => Ok(Attempt::Retry),
                }
            })
            .await
    }

    pub fn admission_usage(&self) -> EngineResult<AdmissionUsage> {
        self.inner.queue.usage()
    }

    /// Drop all tasks, counters and claims. Settings survive.
    pub fn reset(&self) -> EngineResult<u32> {
        let removed = self
            .inner
            .store
            .clear(&[Keyspace::Tasks, Keyspace::Counters, Keyspace::Claims])?;
        info!(removed, "engine state reset");
        Ok(removed)
    }

    // ── Supervision ────────────────────────────────────────────────

    /// Settle tasks stranded in `NEW`, fail silent tasks, finalize stuck
    /// cancels, and return orphaned slots.
    pub async fn sweep(&self, now: u64) -> EngineResult<SweepReport> {
        let settings = self.settings()?;
        let mut report = SweepReport::default();
        let mut effects = Vec::new();

        for task in self.list_tasks(None)? {
            if task.state == TaskState::New {
                let poisoned = self.has_failed_dependency(&task)?;
                match self.settle_new(&task.id, poisoned, &settings).await {
                    Ok(settled) => {
                        info!(task_id = %task.id, poisoned, "task left NEW by sweep");
                        report.evaluated.push(task.id.clone());
                        effects.extend(settled);
                    }
                    Err(EngineError::TaskNotFound(_) | EngineError::TaskConflict(_)) => {}
                    Err(e) => return Err(e),
                }
                continue;
            }
            let Some(event) = due_event(&task, &settings, now) else {
                continue;
            };
            let applied = match self.inner.controller.apply(&task.id, &event).await {
                Ok(applied) => applied,
                Err(EngineError::TaskNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if applied.from == applied.task.state {
                continue;
            }
            match event {
                Event::HeartbeatExpired => {
                    warn!(task_id = %task.id, "heartbeat expired, task failed");
                    report.expired.push(task.id.clone());
                }
                _ => {
                    warn!(task_id = %task.id, "cancel not acknowledged in time, task failed");
                    report.cancel_timeouts.push(task.id.clone());
                }
            }
            effects.extend(applied.effects);
        }

        let semaphore = self.inner.queue.semaphore();
        for claim in semaphore.holders()? {
            let guard = match self.inner.store.get_task(&claim.holder)? {
                Some(task) if task.value.state.holds_slot() => continue,
                Some(task) if task.value.state == TaskState::Enqueued => continue,
                Some(task) => {
                    WriteOp::check(Keyspace::Tasks, claim.holder.as_str(), Precondition::Version(task.version))
                }
                None => WriteOp::check(Keyspace::Tasks, claim.holder.as_str(), Precondition::Absent),
            };
            if semaphore.release_guarded(&claim.holder, Some(guard)).await? {
                warn!(task_id = %claim.holder, node = %claim.operation_id, "orphaned slot claim returned");
                report.reaped_claims.push(claim.holder);
                effects.push(Effect::Poke);
            }
        }

        self.drive(effects).await?;
        Ok(report)
    }

    fn has_failed_dependency(&self, task: &Task) -> EngineResult<bool> {
        for dep in &task.dependencies {
            let dep = self.inner.store.get_task(dep)?;
            if dep.is_some_and(|d| d.value.state == TaskState::Failed) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ── Effect driver ──────────────────────────────────────────────

    /// Run effects until none are left. Later effects still run when one
    /// fails; the first error is returned.
    async fn drive(&self, effects: Vec<Effect>) -> EngineResult<()> {
        let mut queue = VecDeque::new();
        for effect in effects {
            schedule(&mut queue, effect);
        }

        let mut first_error = None;
        while let Some(effect) = queue.pop_front() {
            match self.execute(&effect).await {
                Ok(follow_up) => {
                    for next in follow_up {
                        schedule(&mut queue, next);
                    }
                }
                Err(EngineError::TaskNotFound(id)) => {
                    warn!(?effect, task_id = %id, "effect target vanished");
                }
                Err(e) => {
                    error!(?effect, error = %e, "effect failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn execute(&self, effect: &Effect) -> EngineResult<Vec<Effect>> {
        match effect {
            Effect::Poke => self.inner.queue.poke().await,
            Effect::Dispatch(id) => self.dispatch(id).await,
            Effect::SendCancel(id) => self.send_cancel(id).await,
            Effect::ReleaseSlot(id) => {
                if !self.inner.queue.semaphore().release(id).await? {
                    debug!(task_id = %id, "no slot to release");
                }
                Ok(Vec::new())
            }
            Effect::Propagate(id) => self.inner.propagator.on_terminal(id).await,
            Effect::Rollback { origin, depth } => self.inner.rollback.rollback(origin, *depth).await,
            Effect::NotifyCaller(id) => self.notify_caller(id).await,
        }
    }

    async fn dispatch(&self, id: &str) -> EngineResult<Vec<Effect>> {
        let task = self.get_task(id)?;
        // A cancel or a duplicate dispatch may have landed since the admit.
        if task.state != TaskState::Starting || !task.starting {
            debug!(
                task_id = %id, state = %task.state,
                "task moved on before dispatch, start skipped"
            );
            return Ok(Vec::new());
        }
        let request = build_request(
            &task.remote_start,
            RemoteAction::Start,
            &task,
            &self.inner.options.callback_base_url,
        );
        let event = match self.inner.remote.send(&request).await {
            Ok(resp) if resp.is_success() => {
                info!(task_id = %id, status = resp.status, "start request delivered");
                Event::StartDelivered { body: resp.body }
            }
            Ok(resp) => {
                warn!(task_id = %id, status = resp.status, "start request rejected");
                Event::StartFailed {
                    reason: format!("start request returned status {}", resp.status),
                }
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "start request failed");
                Event::StartFailed {
                    reason: e.to_string(),
                }
            }
        };
        Ok(self.inner.controller.apply(id, &event).await?.effects)
    }

    async fn send_cancel(&self, id: &str) -> EngineResult<Vec<Effect>> {
        let task = self.get_task(id)?;
        let Some(template) = &task.remote_cancel else {
            return Ok(Vec::new());
        };
        let request = build_request(
            template,
            RemoteAction::Cancel,
            &task,
            &self.inner.options.callback_base_url,
        );
        match self.inner.remote.send(&request).await {
            Ok(resp) if resp.is_success() => {
                debug!(task_id = %id, "cancel request delivered");
                let event = Event::CancelDelivered { body: resp.body };
                Ok(self.inner.controller.apply(id, &event).await?.effects)
            }
            // The cancel timeout finalizes the task if nobody answers.
            Ok(resp) => {
                warn!(task_id = %id, status = resp.status, "cancel request rejected");
                Ok(Vec::new())
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "cancel request failed");
                Ok(Vec::new())
            }
        }
    }

    async fn notify_caller(&self, id: &str) -> EngineResult<Vec<Effect>> {
        let task = self.get_task(id)?;
        let Some(template) = &task.caller_notification else {
            return Ok(Vec::new());
        };
        let request = build_request(
            template,
            RemoteAction::Notify,
            &task,
            &self.inner.options.callback_base_url,
        );
        match self.inner.remote.send(&request).await {
            Ok(resp) if resp.is_success() => {
                debug!(task_id = %id, state = %task.state, "caller notified");
            }
            Ok(resp) => warn!(task_id = %id, status = resp.status, "caller notification rejected"),
            Err(e) => warn!(task_id = %id, error = %e, "caller notification failed"),
        }
        Ok(Vec::new())
    }
}

/// Queue an effect, coalescing pokes: one pending poke admits everything.
fn schedule(queue: &mut VecDeque<Effect>, effect: Effect) {
    if effect == Effect::Poke && queue.contains(&Effect::Poke) {
        return;
    }
    queue.push_back(effect);
}

fn rollback_depth(task: &Task, settings: &Settings) -> RollbackDepth {
    RollbackDepth::from_limit(
        task.configuration
            .rollback_limit
            .unwrap_or(settings.rollback_limit),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RecordingClient;
    use crate::semaphore::ClaimOutcome;
    use taskgrid_core::{RequestTemplate, StopFlag, TaskDefinition};

    fn paused_engine() -> (Engine, RecordingClient) {
        let store = StateStore::open_in_memory().unwrap();
        let paused = Settings {
            max_concurrency: 0,
            ..Settings::default()
        };
        store.put(Keyspace::Settings, SETTINGS_KEY, &paused).unwrap();
        let client = RecordingClient::new();
        let engine = Engine::new(store, Arc::new(client.clone()), EngineOptions::default());
        (engine, client)
    }

    fn graph_of(ids: &[&str], cancellable: bool) -> TaskGraph {
        ids.iter().fold(TaskGraph::new(), |graph, id| {
            let mut def = TaskDefinition::new(RequestTemplate::post(&format!("http://exec/{id}/start")));
            if cancellable {
                def.remote_cancel = Some(RequestTemplate::post(&format!("http://exec/{id}/cancel")));
            }
            graph.task(id, def)
        })
    }

    /// Claim a slot and admit `id` without running its dispatch.
    async fn admit_only(engine: &Engine, id: &str) {
        let outcome = engine.inner.queue.semaphore().claim(id, 1).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed);
        let admitted = engine.inner.controller.apply(id, &Event::Admit).await.unwrap();
        assert_eq!(admitted.effects, vec![Effect::Dispatch(id.to_string())]);
        assert!(admitted.task.starting);
    }

    #[test]
    fn pokes_are_coalesced() {
        let mut queue = VecDeque::new();
        schedule(&mut queue, Effect::Poke);
        schedule(&mut queue, Effect::Dispatch("a".into()));
        schedule(&mut queue, Effect::Poke);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn rollback_depth_prefers_task_override() {
        let def = taskgrid_core::TaskDefinition::new(taskgrid_core::RequestTemplate::post(
            "http://exec/start",
        ));
        let mut task = Task::from_definition("t", def, 1, 0);
        let settings = Settings::default();
        assert_eq!(rollback_depth(&task, &settings), RollbackDepth::Unbounded);
        task.configuration.rollback_limit = Some(2);
        assert_eq!(rollback_depth(&task, &settings), RollbackDepth::Hops(2));
    }

    #[tokio::test]
    async fn dispatch_skips_task_cancelled_after_admit() {
        let (engine, client) = paused_engine();
        engine.install(&graph_of(&["a"], false)).await.unwrap();
        admit_only(&engine, "a").await;

        let task = engine.cancel("a").await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.stop_flag, StopFlag::Cancelled);

        assert!(engine.dispatch("a").await.unwrap().is_empty());
        assert!(client.sent_ids(RemoteAction::Start).is_empty());
        let usage = engine.admission_usage().unwrap();
        assert_eq!(usage.used, 0);
        assert!(usage.used <= usage.max);
    }

    #[tokio::test]
    async fn dispatch_skips_task_stopping_after_admit() {
        let (engine, client) = paused_engine();
        engine.install(&graph_of(&["a"], true)).await.unwrap();
        admit_only(&engine, "a").await;

        engine.cancel("a").await.unwrap();
        assert_eq!(client.sent_ids(RemoteAction::Cancel), vec!["a"]);

        assert!(engine.dispatch("a").await.unwrap().is_empty());
        assert!(client.sent_ids(RemoteAction::Start).is_empty());
        assert_eq!(engine.get_task("a").unwrap().state, TaskState::Stopping);
        // The slot stays with the task until the cancel settles.
        assert_eq!(engine.admission_usage().unwrap().used, 1);
    }

    #[tokio::test]
    async fn dispatch_sends_one_start_per_admit() {
        let (engine, client) = paused_engine();
        engine.install(&graph_of(&["a"], false)).await.unwrap();
        admit_only(&engine, "a").await;

        engine.dispatch("a").await.unwrap();
        engine.dispatch("a").await.unwrap();
        assert_eq!(client.sent_ids(RemoteAction::Start), vec!["a"]);
        assert!(!engine.get_task("a").unwrap().starting);
    }
}
