//! Structural invariant checker. Walks every task entity, the resource
//! ledger, the fetch orchestrator buckets and the stimulus log, and reports
//! violations as structured records rather than opaque assertions.
//!
//! Deterministic and side-effect-free given the current state: safe to run
//! after every stimulus in validate mode and on demand in production while
//! diagnosing an incident.

use std::fmt;

use crate::machine::task::{TaskKey, TaskState};
use crate::machine::worker::WorkerState;

/// One violated invariant with enough context to debug it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub key: Option<TaskKey>,
    pub invariant: &'static str,
    pub detail: String,
}

impl Violation {
    fn task(key: &str, invariant: &'static str, detail: String) -> Self {
        Self {
            key: Some(key.to_string()),
            invariant,
            detail,
        }
    }

    fn global(invariant: &'static str, detail: String) -> Self {
        Self {
            key: None,
            invariant,
            detail,
        }
    }

    /// Ledger corruption is the one class that must halt a production node.
    pub fn is_ledger_corruption(&self) -> bool {
        matches!(self.invariant, "reservation-consistency" | "ledger-balance")
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "[{}] task {}: {}", self.invariant, key, self.detail),
            None => write!(f, "[{}] {}", self.invariant, self.detail),
        }
    }
}

/// Whether a task in this state is expected to hold a compute reservation.
/// A cancelled or resumed task keeps the reservation of the operation still
/// running on its behalf.
fn expects_compute(state: TaskState, cancelled_from: Option<TaskState>) -> bool {
    state.holds_compute()
        || (matches!(state, TaskState::Cancelled | TaskState::Resumed)
            && cancelled_from.is_some_and(|s| s.holds_compute()))
}

fn expects_flight(state: TaskState, cancelled_from: Option<TaskState>) -> bool {
    state.in_flight()
        || (matches!(state, TaskState::Cancelled | TaskState::Resumed)
            && cancelled_from == Some(TaskState::Flight))
}

pub fn validate(worker: &WorkerState) -> Vec<Violation> {
    let (tasks, data, ledger, orchestrator, log) = worker.parts();
    let mut violations = Vec::new();

    for (key, entity) in tasks {
        // Entities only exist between the stimulus that created them and the
        // forget that removes them; `Released` never survives a stimulus.
        if entity.state == TaskState::Released {
            violations.push(Violation::task(
                key,
                "transient-released",
                "entity lingering in released state".to_string(),
            ));
        }

        // Reservation consistency, both directions.
        let expected = expects_compute(entity.state, entity.cancelled_from);
        let held = ledger.holds_compute(key);
        if expected && !held {
            violations.push(Violation::task(
                key,
                "reservation-consistency",
                format!("state {} without a compute reservation", entity.state),
            ));
        }
        if !expected && held {
            violations.push(Violation::task(
                key,
                "reservation-consistency",
                format!("state {} holding a compute reservation", entity.state),
            ));
        }

        // Flight coverage by an open fetch batch.
        if expects_flight(entity.state, entity.cancelled_from) {
            match orchestrator.in_flight_map().get(key) {
                None => violations.push(Violation::task(
                    key,
                    "flight-coverage",
                    format!("state {} but not in the in-flight bucket", entity.state),
                )),
                Some(peer) => {
                    let covered = ledger
                        .fetch_reservation(peer)
                        .is_some_and(|r| r.keys.iter().any(|k| k == key));
                    if !covered {
                        violations.push(Violation::task(
                            key,
                            "flight-coverage",
                            format!("in flight against {peer} without a batch reservation"),
                        ));
                    }
                }
            }
        }

        // Mutual dependency/dependent consistency. A dependency key without
        // an entity is permitted (released, awaiting re-announcement); a
        // dangling dependent is not.
        for dep in &entity.dependencies {
            if let Some(dep_entity) = tasks.get(dep) {
                if !dep_entity.dependents.contains(key) {
                    violations.push(Violation::task(
                        key,
                        "mutual-links",
                        format!("depends on {dep}, which does not list it as dependent"),
                    ));
                }
            }
        }
        for dependent in &entity.dependents {
            match tasks.get(dependent) {
                None => violations.push(Violation::task(
                    key,
                    "mutual-links",
                    format!("lists forgotten task {dependent} as dependent"),
                )),
                Some(other) => {
                    if !other.dependencies.contains(key) {
                        violations.push(Violation::task(
                            key,
                            "mutual-links",
                            format!("lists {dependent} as dependent, which does not depend on it"),
                        ));
                    }
                }
            }
        }

        // Memory state and the data bank agree.
        let stored = data.contains_key(key);
        if entity.state == TaskState::Memory && !stored {
            violations.push(Violation::task(
                key,
                "memory-data",
                "in memory state without a stored value".to_string(),
            ));
        }
        if entity.state != TaskState::Memory && stored {
            violations.push(Violation::task(
                key,
                "memory-data",
                format!("stored value but state {}", entity.state),
            ));
        }
    }

    // Values without an entity.
    for key in data.keys() {
        if !tasks.contains_key(key) {
            violations.push(Violation::task(
                key,
                "memory-data",
                "stored value for a forgotten task".to_string(),
            ));
        }
    }

    // Orchestrator buckets: disjoint, and consistent with task states.
    for key in orchestrator.pending_keys() {
        if orchestrator.in_flight_map().contains_key(key) {
            violations.push(Violation::task(
                key,
                "fetch-buckets",
                "simultaneously queued and in flight".to_string(),
            ));
        }
        match tasks.get(key).map(|e| e.state) {
            Some(TaskState::Fetch) => {}
            other => violations.push(Violation::task(
                key,
                "fetch-buckets",
                format!("queued for fetch but state {other:?}"),
            )),
        }
    }
    for key in orchestrator.in_flight_map().keys() {
        match tasks.get(key).map(|e| e.state) {
            Some(TaskState::Flight) | Some(TaskState::Cancelled) | Some(TaskState::Resumed) => {}
            other => violations.push(Violation::task(
                key,
                "fetch-buckets",
                format!("in flight but state {other:?}"),
            )),
        }
    }
    for (key, entity) in tasks {
        if entity.state == TaskState::Fetch && !orchestrator.is_pending(key) {
            violations.push(Violation::task(
                key,
                "fetch-buckets",
                "fetch state but not queued".to_string(),
            ));
        }
    }

    // Ledger pools reconcile with held reservations.
    for (pool, detail) in ledger.audit() {
        violations.push(Violation::global(
            "ledger-balance",
            format!("pool {pool}: {detail}"),
        ));
    }

    // Log ordering.
    if let Some(detail) = log.audit() {
        violations.push(Violation::global("log-order", detail));
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::WorkerConfig;
    use crate::machine::stimulus::{Stimulus, StimulusPayload};
    use std::collections::HashMap;

    fn assign(key: &str) -> Stimulus {
        Stimulus::new(StimulusPayload::AssignCompute {
            key: key.to_string(),
            dependencies: vec![],
            holders: HashMap::new(),
            nbytes: HashMap::new(),
            priority: Default::default(),
            restrictions: HashMap::new(),
            duration_estimate: None,
            run_spec: serde_json::json!({}),
            metadata: serde_json::Value::Null,
        })
    }

    #[test]
    fn test_clean_state_validates() {
        let worker = WorkerState::new(WorkerConfig::development()).unwrap();
        assert!(validate(&worker).is_empty());
    }

    #[test]
    fn test_validates_through_a_simple_lifecycle() {
        let mut worker = WorkerState::new(WorkerConfig::development()).unwrap();
        worker.handle_stimulus(assign("a")).unwrap();
        assert!(validate(&worker).is_empty());
    }

    #[test]
    fn test_violation_rendering() {
        let violation = Violation {
            key: Some("t1".to_string()),
            invariant: "reservation-consistency",
            detail: "state executing without a compute reservation".to_string(),
        };
        let text = violation.to_string();
        assert!(text.contains("reservation-consistency"));
        assert!(text.contains("t1"));
        assert!(violation.is_ledger_corruption());

        let violation = Violation {
            key: None,
            invariant: "log-order",
            detail: "sequence regressed".to_string(),
        };
        assert!(!violation.is_ledger_corruption());
    }
}
