//! Shared types used across TaskGrid crates.
//!
//! `Mode`, `TaskState` and `StopFlag` serialize as explicit numeric tags.
//! The tags are part of the wire contract: a tag is never renumbered or
//! reused, independent of the order the variants are declared in.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use http::header::{HeaderName, HeaderValue};
use http::{Method, Uri};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique, immutable task name. Primary key in the store.
pub type TaskId = String;

/// A numeric tag that does not map to any variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} tag: {tag}")]
pub struct UnknownTag {
    pub kind: &'static str,
    pub tag: u8,
}

/// A textual name that does not map to any variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind}: {name}")]
pub struct UnknownName {
    pub kind: &'static str,
    pub name: String,
}

/// Generates tag/name conversions for a wire enum.
macro_rules! wire_tags {
    ($ty:ident, $kind:literal, { $($variant:ident = $tag:literal => $name:literal),+ $(,)? }) => {
        impl $ty {
            /// Stable wire tag.
            pub const fn tag(self) -> u8 {
                match self {
                    $($ty::$variant => $tag),+
                }
            }

            /// Stable lowercase name (used by the CLI and query strings).
            pub const fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl From<$ty> for u8 {
            fn from(value: $ty) -> u8 {
                value.tag()
            }
        }

        impl TryFrom<u8> for $ty {
            type Error = UnknownTag;

            fn try_from(tag: u8) -> Result<Self, Self::Error> {
                match tag {
                    $($tag => Ok($ty::$variant),)+
                    _ => Err(UnknownTag { kind: $kind, tag }),
                }
            }
        }

        impl FromStr for $ty {
            type Err = UnknownName;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($name => Ok($ty::$variant),)+
                    _ => Err(UnknownName { kind: $kind, name: s.to_string() }),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ── Mode ───────────────────────────────────────────────────────────

/// Administratively expressed intent for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Mode {
    /// Do not start.
    Idle,
    /// Start when eligible.
    #[default]
    Active,
    /// Stop, or never start.
    Cancel,
}

wire_tags!(Mode, "mode", {
    Idle = 0 => "idle",
    Active = 1 => "active",
    Cancel = 2 => "cancel",
});

// ── TaskState ──────────────────────────────────────────────────────

/// Lifecycle phase of a task.
///
/// ```text
/// NEW → WAITING → ENQUEUED → STARTING → UP → STOPPING → { SUCCESSFUL | FAILED }
/// ```
///
/// States may be skipped but never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TaskState {
    New,
    Waiting,
    Enqueued,
    Starting,
    Up,
    Stopping,
    Successful,
    Failed,
}

wire_tags!(TaskState, "task state", {
    New = 0 => "new",
    Waiting = 1 => "waiting",
    Enqueued = 2 => "enqueued",
    Starting = 3 => "starting",
    Up = 4 => "up",
    Stopping = 5 => "stopping",
    Successful = 6 => "successful",
    Failed = 7 => "failed",
});

impl TaskState {
    /// Position in the visiting order. Both terminal states share the last rank.
    pub const fn rank(self) -> u8 {
        match self {
            TaskState::New => 0,
            TaskState::Waiting => 1,
            TaskState::Enqueued => 2,
            TaskState::Starting => 3,
            TaskState::Up => 4,
            TaskState::Stopping => 5,
            TaskState::Successful | TaskState::Failed => 6,
        }
    }

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Successful | TaskState::Failed)
    }

    /// Does a task in this state own an admission slot?
    pub fn holds_slot(self) -> bool {
        matches!(
            self,
            TaskState::Starting | TaskState::Up | TaskState::Stopping
        )
    }

    /// Can a transition from `self` to `next` happen without regressing?
    pub fn can_advance_to(self, next: TaskState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }

    pub fn phase(self) -> Phase {
        match self {
            TaskState::New | TaskState::Waiting | TaskState::Enqueued => Phase::Waiting,
            TaskState::Starting | TaskState::Up | TaskState::Stopping => Phase::Running,
            TaskState::Successful | TaskState::Failed => Phase::Finished,
        }
    }
}

/// Coarse grouping of states used for task queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Waiting,
    Running,
    Finished,
}

impl FromStr for Phase {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "waiting" => Ok(Phase::Waiting),
            "running" => Ok(Phase::Running),
            "finished" => Ok(Phase::Finished),
            _ => Err(UnknownName {
                kind: "phase",
                name: s.to_string(),
            }),
        }
    }
}

// ── StopFlag ───────────────────────────────────────────────────────

/// Why a task did not finish successfully. Written at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum StopFlag {
    #[default]
    None,
    Cancelled,
    DependencyFailed,
    SystemFailure,
}

wire_tags!(StopFlag, "stop flag", {
    None = 0 => "none",
    Cancelled = 1 => "cancelled",
    DependencyFailed = 2 => "dependency_failed",
    SystemFailure = 3 => "system_failure",
});

impl StopFlag {
    pub fn is_set(self) -> bool {
        self != StopFlag::None
    }
}

// ── Request templates ──────────────────────────────────────────────

const KNOWN_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
];

/// Problems found in a request template.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("missing url")]
    MissingUrl,
    #[error("url must be absolute http(s): {0}")]
    InvalidUrl(String),
    #[error("unsupported method: {0}")]
    InvalidMethod(String),
    #[error("invalid header {0:?}: bad name or value")]
    InvalidHeader(String),
}

/// Describes an outbound HTTP call (start, cancel, or caller notification).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTemplate {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Opaque payload forwarded verbatim to the remote side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<serde_json::Value>,
}

fn default_method() -> String {
    "POST".to_string()
}

impl RequestTemplate {
    /// A POST template with no headers or attachment.
    pub fn post(url: &str) -> Self {
        Self {
            method: default_method(),
            url: url.to_string(),
            headers: BTreeMap::new(),
            attachment: None,
        }
    }

    pub fn validate(&self) -> Result<(), TemplateError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(TemplateError::MissingUrl);
        }
        let invalid_url = || TemplateError::InvalidUrl(url.to_string());
        let uri: Uri = url.parse().map_err(|_| invalid_url())?;
        if !matches!(uri.scheme_str(), Some("http" | "https")) {
            return Err(invalid_url());
        }
        if uri.host().is_none_or(str::is_empty) {
            return Err(invalid_url());
        }

        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| TemplateError::InvalidMethod(self.method.clone()))?;
        if !KNOWN_METHODS.contains(&method) {
            return Err(TemplateError::InvalidMethod(self.method.clone()));
        }

        for (name, value) in &self.headers {
            let valid_name = HeaderName::from_bytes(name.as_bytes()).is_ok();
            if !valid_name || HeaderValue::from_str(value).is_err() {
                return Err(TemplateError::InvalidHeader(name.clone()));
            }
        }
        Ok(())
    }
}

// ── Per-task configuration ─────────────────────────────────────────

/// Per-task overrides. `None` falls back to the cluster [`Settings`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfiguration {
    /// Seconds to wait for a cancel acknowledgement before giving up.
    pub cancel_timeout_secs: Option<u64>,
    /// Rollback depth: negative = unbounded, 0 or 1 = direct dependants only.
    pub rollback_limit: Option<i32>,
    /// Expected heartbeat interval while UP. 0 disables supervision.
    pub heartbeat_interval_secs: Option<u64>,
    /// Missed intervals tolerated before the task is failed.
    pub heartbeat_tolerance: Option<u32>,
    /// Forward dependency results into this task's start request.
    pub forward_results: bool,
    /// Notify the caller before releasing dependants.
    pub delay_dependant_notification: bool,
    /// A positive cancel acknowledgement counts as success.
    pub stop_counts_as_success: bool,
}

/// Cluster-wide settings, stored as a single record and read at operation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Maximum number of tasks holding an admission slot.
    pub max_concurrency: u32,
    pub cancel_timeout_secs: u64,
    pub rollback_limit: i32,
    /// 0 disables heartbeat supervision unless a task overrides it.
    pub heartbeat_interval_secs: u64,
    pub heartbeat_tolerance: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            cancel_timeout_secs: 300,
            rollback_limit: -1,
            heartbeat_interval_secs: 0,
            heartbeat_tolerance: 3,
        }
    }
}

// ── Server responses ───────────────────────────────────────────────

/// A state change caused by a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: TaskState,
    pub to: TaskState,
}

/// One entry of a task's response history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerResponse {
    pub received_at: u64,
    pub positive: bool,
    #[serde(default)]
    pub body: serde_json::Value,
    /// `None` when the response was recorded without changing state.
    pub transition: Option<StateChange>,
}

// ── Graph DTOs ─────────────────────────────────────────────────────

/// `target` depends on `source`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub source: TaskId,
    pub target: TaskId,
}

impl Edge {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
        }
    }
}

/// Initial definition of a task to install.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    #[serde(default)]
    pub mode: Mode,
    pub remote_start: RequestTemplate,
    #[serde(default)]
    pub remote_cancel: Option<RequestTemplate>,
    #[serde(default)]
    pub caller_notification: Option<RequestTemplate>,
    #[serde(default)]
    pub configuration: TaskConfiguration,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl TaskDefinition {
    pub fn new(remote_start: RequestTemplate) -> Self {
        Self {
            mode: Mode::Active,
            remote_start,
            remote_cancel: None,
            caller_notification: None,
            configuration: TaskConfiguration::default(),
            correlation_id: None,
        }
    }
}

/// A batch of new tasks plus dependency edges, installed atomically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    pub tasks: BTreeMap<TaskId, TaskDefinition>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(mut self, id: &str, definition: TaskDefinition) -> Self {
        self.tasks.insert(id.to_string(), definition);
        self
    }

    /// Add an edge: `target` depends on `source`.
    pub fn edge(mut self, source: &str, target: &str) -> Self {
        self.edges.push(Edge::new(source, target));
        self
    }
}

// ── Task ───────────────────────────────────────────────────────────

/// The persisted unit of scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub mode: Mode,
    pub state: TaskState,
    pub stop_flag: StopFlag,
    pub dependencies: BTreeSet<TaskId>,
    pub dependants: BTreeSet<TaskId>,
    pub unfinished_dependencies: u32,
    /// Dependencies whose success was already applied to this task.
    #[serde(default)]
    pub resolved_dependencies: BTreeSet<TaskId>,
    pub remote_start: RequestTemplate,
    pub remote_cancel: Option<RequestTemplate>,
    pub caller_notification: Option<RequestTemplate>,
    #[serde(default)]
    pub server_responses: Vec<ServerResponse>,
    /// Set while the start request is in flight.
    #[serde(default)]
    pub starting: bool,
    #[serde(default)]
    pub configuration: TaskConfiguration,
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Final response bodies of dependencies (only with `forward_results`).
    #[serde(default)]
    pub dependency_results: BTreeMap<TaskId, serde_json::Value>,
    /// Creation order, used for admission fairness.
    pub sequence: u64,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub last_heartbeat: Option<u64>,
    #[serde(default)]
    pub stopping_since: Option<u64>,
}

impl Task {
    /// Materialize a freshly installed task in `NEW`.
    pub fn from_definition(id: &str, definition: TaskDefinition, sequence: u64, now: u64) -> Self {
        Self {
            id: id.to_string(),
            mode: definition.mode,
            state: TaskState::New,
            stop_flag: StopFlag::None,
            dependencies: BTreeSet::new(),
            dependants: BTreeSet::new(),
            unfinished_dependencies: 0,
            resolved_dependencies: BTreeSet::new(),
            remote_start: definition.remote_start,
            remote_cancel: definition.remote_cancel,
            caller_notification: definition.caller_notification,
            server_responses: Vec::new(),
            starting: false,
            configuration: definition.configuration,
            correlation_id: definition.correlation_id,
            dependency_results: BTreeMap::new(),
            sequence,
            created_at: now,
            updated_at: now,
            last_heartbeat: None,
            stopping_since: None,
        }
    }

    /// `mode = ACTIVE ∧ unfinished = 0`: may move on to ENQUEUED.
    pub fn is_dispatchable(&self) -> bool {
        self.mode == Mode::Active && self.unfinished_dependencies == 0
    }

    /// Set the stop flag unless one is already recorded. Returns whether it changed.
    pub fn set_stop_flag(&mut self, flag: StopFlag) -> bool {
        if self.stop_flag.is_set() || !flag.is_set() {
            return false;
        }
        self.stop_flag = flag;
        true
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Final response body of a finished task (last positive response).
    pub fn final_response(&self) -> Option<&serde_json::Value> {
        self.server_responses
            .iter()
            .rev()
            .find(|r| r.positive && r.transition.is_some())
            .map(|r| &r.body)
    }
}
