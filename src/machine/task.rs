use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::machine::stimulus::StimulusId;

/// Globally unique opaque task identifier.
pub type TaskKey = String;

/// Network address of a peer node, as announced by the coordinator.
pub type PeerAddr = String;

/// Lifecycle state of a task on this node.
///
/// Compute path: `Released -> Waiting -> Ready -> Executing | LongRunning ->
/// Memory`. Fetch path: `Released -> Waiting -> Fetch -> Flight -> Memory`.
/// `Cancelled` and `Resumed` cover the release/re-request race around an
/// in-flight operation; `Error` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Known but carrying no obligations; transient.
    Released,
    /// Missing at least one dependency value.
    Waiting,
    /// Dependency value wanted, at least one holder known, not yet admitted.
    Fetch,
    /// A fetch batch containing this key is on the wire.
    Flight,
    /// All inputs local; contending for compute resources.
    Ready,
    /// Running on the executor under a resource grant.
    Executing,
    /// Still running, but seceded from its compute slot.
    LongRunning,
    /// Value present in the local data bank.
    Memory,
    /// Execution or fetch failed terminally.
    Error,
    /// Released while an operation was in flight; outcome will be discarded.
    Cancelled,
    /// Re-requested while cancelled; the in-flight outcome will be adopted.
    Resumed,
}

impl TaskState {
    pub fn name(self) -> &'static str {
        match self {
            TaskState::Released => "released",
            TaskState::Waiting => "waiting",
            TaskState::Fetch => "fetch",
            TaskState::Flight => "flight",
            TaskState::Ready => "ready",
            TaskState::Executing => "executing",
            TaskState::LongRunning => "long-running",
            TaskState::Memory => "memory",
            TaskState::Error => "error",
            TaskState::Cancelled => "cancelled",
            TaskState::Resumed => "resumed",
        }
    }

    /// States whose task holds an open compute reservation.
    pub fn holds_compute(self) -> bool {
        matches!(self, TaskState::Executing | TaskState::LongRunning)
    }

    /// States covered by an open fetch reservation.
    pub fn in_flight(self) -> bool {
        matches!(self, TaskState::Flight)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Memory | TaskState::Error)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Tie-breaker among ready tasks; lower sorts first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Priority {
    /// Coordinator-assigned band.
    pub band: i64,
    /// Assignment generation within the band.
    pub seq: u64,
}

impl Priority {
    pub fn new(band: i64, seq: u64) -> Self {
        Self { band, seq }
    }
}

/// Per-key mutable record of a task's lifecycle on this node.
///
/// Entities live in an arena map keyed by `TaskKey`; both dependency
/// directions are plain key sets, never object references.
#[derive(Debug, Clone)]
pub struct TaskEntity {
    pub key: TaskKey,
    pub state: TaskState,
    pub dependencies: HashSet<TaskKey>,
    pub dependents: HashSet<TaskKey>,
    /// Peers known to hold this task's value; advisory and possibly stale.
    pub holders: HashSet<PeerAddr>,
    pub priority: Priority,
    /// Resource name -> quantity required while executing.
    pub restrictions: HashMap<String, u64>,
    /// Advisory run time estimate in seconds.
    pub duration_estimate: Option<f64>,
    /// Value size; an estimate until the value is stored.
    pub nbytes: Option<u64>,
    /// Opaque executor payload; present iff assigned for local compute.
    pub run_spec: Option<Value>,
    /// Free-form, uninterpreted by the state machine.
    pub metadata: Value,
    /// Failure detail once in `Error`.
    pub error: Option<String>,
    /// Which in-flight state a cancelled task left behind.
    pub cancelled_from: Option<TaskState>,
    pub fetch_attempts: u32,
    pub created_by: StimulusId,
    pub created_at: DateTime<Utc>,
}

impl TaskEntity {
    pub fn new(key: TaskKey, created_by: StimulusId, created_at: DateTime<Utc>) -> Self {
        Self {
            key,
            state: TaskState::Released,
            dependencies: HashSet::new(),
            dependents: HashSet::new(),
            holders: HashSet::new(),
            priority: Priority::default(),
            restrictions: HashMap::new(),
            duration_estimate: None,
            nbytes: None,
            run_spec: None,
            metadata: Value::Null,
            error: None,
            cancelled_from: None,
            fetch_attempts: 0,
            created_by,
            created_at,
        }
    }

    /// Whether this node is expected to compute the task locally (as opposed
    /// to only fetching its value as someone else's input).
    pub fn is_compute(&self) -> bool {
        self.run_spec.is_some()
    }

    /// Size used for fetch budgeting when the real size is unknown.
    pub fn size_estimate(&self, assumed: u64) -> u64 {
        self.nbytes.unwrap_or(assumed)
    }

    /// A task with no dependents and no local compute obligation has nothing
    /// keeping it on this node.
    pub fn is_orphan(&self) -> bool {
        self.dependents.is_empty() && !self.is_compute()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_orders_lexicographically() {
        let a = Priority::new(0, 5);
        let b = Priority::new(0, 6);
        let c = Priority::new(1, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_state_families() {
        assert!(TaskState::Executing.holds_compute());
        assert!(TaskState::LongRunning.holds_compute());
        assert!(!TaskState::Flight.holds_compute());
        assert!(TaskState::Flight.in_flight());
        assert!(TaskState::Memory.is_terminal());
        assert!(TaskState::Error.is_terminal());
        assert!(!TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn test_new_entity_starts_released() {
        let entity = TaskEntity::new("t".to_string(), StimulusId::fresh(), Utc::now());
        assert_eq!(entity.state, TaskState::Released);
        assert!(!entity.is_compute());
        assert!(entity.is_orphan());
        assert_eq!(entity.size_estimate(1024), 1024);
    }
}
