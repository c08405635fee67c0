//! The legal-transition table: a pure function from (current state,
//! stimulus) to the next state plus entity-level effects. Illegal pairs are
//! distinguishable from idempotent no-ops so the state machine core can
//! surface protocol defects instead of absorbing them.

use smallvec::SmallVec;

use crate::machine::stimulus::StimulusPayload;
use crate::machine::task::TaskState;

/// Entity-level effect computed by the table and materialized by the state
/// machine core. Effects never touch state directly; they are instructions
/// to the core about what this transition means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    /// Record dependencies, priority, restrictions and run spec from an
    /// assignment (no-op for a duplicate).
    AdoptAssignment,
    /// Merge announced holders and value size.
    RecordHolders,
    /// Re-derive whether the task belongs in waiting, fetch or ready.
    EvaluateReadiness,
    /// Store the arriving value and fan out to dependents.
    StoreValue,
    /// Return the task's thread units to the pool.
    SecedeSlot,
    /// Record the failure detail on the entity.
    RecordError,
    /// Release the task's compute reservation; the freeing instruction
    /// precedes anything that might consume the freed slots.
    FreeCompute,
    /// Report successful completion to the coordinator.
    ReportFinished,
    /// Report terminal failure to the coordinator.
    ReportErred,
    /// Hand the key back to the fetch orchestrator for a retry decision.
    RequeueFetch,
    /// Remember which in-flight state a cancelled task left behind.
    MarkCancelled,
    /// Confirm to the coordinator that a stored value was dropped.
    ConfirmRelease,
    /// Discard any outcome and remove the entity from the arena.
    Forget,
}

/// Next state (None = stay) plus ordered effects.
#[derive(Debug, Clone)]
pub(crate) struct Step {
    pub next: Option<TaskState>,
    pub actions: SmallVec<[Action; 4]>,
}

impl Step {
    fn to(next: TaskState, actions: &[Action]) -> Verdict {
        Verdict::Step(Step {
            next: Some(next),
            actions: SmallVec::from_slice(actions),
        })
    }

    fn stay(actions: &[Action]) -> Verdict {
        Verdict::Step(Step {
            next: None,
            actions: SmallVec::from_slice(actions),
        })
    }
}

/// Outcome of a table lookup.
#[derive(Debug, Clone)]
pub(crate) enum Verdict {
    /// Legal transition with effects.
    Step(Step),
    /// Explicitly idempotent no-op (duplicate or stale stimulus).
    Ignore,
    /// No entry: a protocol defect, fatal to the node.
    Illegal,
}

/// Look up the (state, stimulus) pair for a task-scoped stimulus.
///
/// Node-scoped stimuli (pause/resume/close, peer data requests) never reach
/// the table; they resolve to `Ignore` for totality.
pub(crate) fn step(state: TaskState, stimulus: &StimulusPayload) -> Verdict {
    use Action::*;
    use TaskState::*;

    match stimulus {
        StimulusPayload::AssignCompute { .. } => match state {
            Released => Step::to(Waiting, &[AdoptAssignment, EvaluateReadiness]),
            Waiting => Step::stay(&[AdoptAssignment, EvaluateReadiness]),
            // Already being satisfied through the fetch path, or already
            // done: duplicate assignment is a documented no-op.
            Fetch | Flight | Ready | Executing | LongRunning | Memory | Error | Resumed => {
                Verdict::Ignore
            }
            Cancelled => Step::to(Resumed, &[]),
        },

        StimulusPayload::AnnounceHolders { .. } => match state {
            Released => Step::to(Waiting, &[RecordHolders, EvaluateReadiness]),
            Waiting => Step::stay(&[RecordHolders, EvaluateReadiness]),
            Fetch | Flight | Cancelled | Resumed => Step::stay(&[RecordHolders]),
            Ready | Executing | LongRunning | Memory | Error => Verdict::Ignore,
        },

        StimulusPayload::Secede { .. } => match state {
            Executing => Step::to(LongRunning, &[SecedeSlot]),
            LongRunning => Verdict::Ignore,
            // The cancelled/resumed operation is still occupying its slot.
            Cancelled | Resumed => Step::stay(&[SecedeSlot]),
            Released | Waiting | Fetch | Flight | Ready | Memory | Error => Verdict::Illegal,
        },

        StimulusPayload::GatherOk { .. } => match state {
            Flight => Step::to(Memory, &[StoreValue]),
            // A reply from a superseded batch can land while the key is
            // queued for retry; adopting it avoids a duplicate fetch.
            Fetch | Waiting => Step::to(Memory, &[StoreValue]),
            Resumed => Step::to(Memory, &[StoreValue]),
            Cancelled => Step::stay(&[Forget]),
            Memory => Verdict::Ignore,
            Released | Ready | Executing | LongRunning | Error => Verdict::Ignore,
        },

        StimulusPayload::GatherErr { .. } => match state {
            Flight => Step::stay(&[RequeueFetch]),
            Resumed => Step::stay(&[RequeueFetch]),
            Cancelled => Step::stay(&[Forget]),
            // Stale failure for a key that already moved on.
            Released | Waiting | Fetch | Ready | Executing | LongRunning | Memory | Error => {
                Verdict::Ignore
            }
        },

        StimulusPayload::ExecuteOk { .. } => match state {
            Executing | LongRunning => {
                Step::to(Memory, &[FreeCompute, StoreValue, ReportFinished])
            }
            Resumed => Step::to(Memory, &[FreeCompute, StoreValue, ReportFinished]),
            Cancelled => Step::stay(&[Forget]),
            Memory => Verdict::Ignore,
            Released | Waiting | Fetch | Flight | Ready | Error => Verdict::Illegal,
        },

        StimulusPayload::ExecuteErr { .. } => match state {
            Executing | LongRunning => Step::to(Error, &[FreeCompute, RecordError, ReportErred]),
            Resumed => Step::to(Error, &[FreeCompute, RecordError, ReportErred]),
            Cancelled => Step::stay(&[Forget]),
            Error => Verdict::Ignore,
            Released | Waiting | Fetch | Flight | Ready | Memory => Verdict::Illegal,
        },

        StimulusPayload::ReleaseKey { .. } => match state {
            Released | Cancelled => Verdict::Ignore,
            Waiting | Fetch | Ready => Step::to(Released, &[Forget]),
            Flight | Executing | LongRunning => Step::to(Cancelled, &[MarkCancelled]),
            Memory => Step::to(Released, &[ConfirmRelease, Forget]),
            Error => Step::to(Released, &[Forget]),
            Resumed => Step::to(Cancelled, &[MarkCancelled]),
        },

        StimulusPayload::PeerDataRequest { .. }
        | StimulusPayload::Pause
        | StimulusPayload::Resume
        | StimulusPayload::Close => Verdict::Ignore,
    }
}

/// Legality of the internal cascade edges the state machine core takes on
/// its own (admissions, fan-out, fetch retries). Every state mutation goes
/// through either `step` or this guard, so the whole edge set lives in one
/// module.
pub(crate) fn cascade(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    matches!(
        (from, to),
        (Released, Waiting)
            | (Waiting, Fetch)
            | (Waiting, Ready)
            | (Fetch, Flight)
            | (Fetch, Waiting)
            | (Ready, Executing)
            | (Ready, Waiting)
            | (Flight, Fetch)
            | (Flight, Waiting)
            | (Flight, Error)
            // An in-flight dependency orphaned by its waiter's release.
            | (Flight, Cancelled)
            // A cancelled dependency re-requested through a new assignment.
            | (Cancelled, Resumed)
            | (Resumed, Cancelled)
            | (Resumed, Fetch)
            | (Resumed, Waiting)
            | (Resumed, Error)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashMap;

    fn assign() -> StimulusPayload {
        StimulusPayload::AssignCompute {
            key: "t".into(),
            dependencies: vec![],
            holders: HashMap::new(),
            nbytes: HashMap::new(),
            priority: Default::default(),
            restrictions: HashMap::new(),
            duration_estimate: None,
            run_spec: serde_json::json!({}),
            metadata: serde_json::Value::Null,
        }
    }

    fn execute_ok() -> StimulusPayload {
        StimulusPayload::ExecuteOk {
            key: "t".into(),
            value: Bytes::from_static(b"v"),
        }
    }

    #[test]
    fn test_assignment_creates_waiting() {
        let verdict = step(TaskState::Released, &assign());
        match verdict {
            Verdict::Step(s) => assert_eq!(s.next, Some(TaskState::Waiting)),
            other => panic!("expected step, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_assignment_is_ignored() {
        for state in [TaskState::Ready, TaskState::Executing, TaskState::Memory] {
            assert!(matches!(step(state, &assign()), Verdict::Ignore));
        }
    }

    #[test]
    fn test_assignment_resumes_cancelled() {
        match step(TaskState::Cancelled, &assign()) {
            Verdict::Step(s) => assert_eq!(s.next, Some(TaskState::Resumed)),
            other => panic!("expected step, got {other:?}"),
        }
    }

    #[test]
    fn test_secede_outside_execution_is_illegal() {
        let secede = StimulusPayload::Secede { key: "t".into() };
        assert!(matches!(
            step(TaskState::Waiting, &secede),
            Verdict::Illegal
        ));
        assert!(matches!(step(TaskState::Memory, &secede), Verdict::Illegal));
        match step(TaskState::Executing, &secede) {
            Verdict::Step(s) => assert_eq!(s.next, Some(TaskState::LongRunning)),
            other => panic!("expected step, got {other:?}"),
        }
    }

    #[test]
    fn test_execution_outcome_in_wrong_state_is_illegal() {
        assert!(matches!(
            step(TaskState::Waiting, &execute_ok()),
            Verdict::Illegal
        ));
        assert!(matches!(
            step(TaskState::Flight, &execute_ok()),
            Verdict::Illegal
        ));
    }

    #[test]
    fn test_cancelled_outcomes_are_discarded() {
        match step(TaskState::Cancelled, &execute_ok()) {
            Verdict::Step(s) => {
                assert_eq!(s.next, None);
                assert!(s.actions.contains(&Action::Forget));
                assert!(!s.actions.contains(&Action::StoreValue));
            }
            other => panic!("expected step, got {other:?}"),
        }
    }

    #[test]
    fn test_resumed_outcomes_are_adopted() {
        match step(TaskState::Resumed, &execute_ok()) {
            Verdict::Step(s) => {
                assert_eq!(s.next, Some(TaskState::Memory));
                assert!(s.actions.contains(&Action::StoreValue));
            }
            other => panic!("expected step, got {other:?}"),
        }
    }

    #[test]
    fn test_release_of_in_flight_cancels() {
        let release = StimulusPayload::ReleaseKey { key: "t".into() };
        for state in [
            TaskState::Flight,
            TaskState::Executing,
            TaskState::LongRunning,
        ] {
            match step(state, &release) {
                Verdict::Step(s) => assert_eq!(s.next, Some(TaskState::Cancelled)),
                other => panic!("expected step from {state}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_cascade_edges() {
        assert!(cascade(TaskState::Waiting, TaskState::Ready));
        assert!(cascade(TaskState::Fetch, TaskState::Flight));
        assert!(cascade(TaskState::Ready, TaskState::Executing));
        assert!(!cascade(TaskState::Memory, TaskState::Executing));
        assert!(!cascade(TaskState::Released, TaskState::Executing));
    }
}
