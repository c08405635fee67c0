//! Integration suite for the worker state machine: lifecycle properties,
//! cancellation races, batching and backpressure, driven through the public
//! `WorkerState` API with no collaborators attached.

use bytes::Bytes;
use pretty_assertions::assert_eq;
use std::collections::HashMap;

use gantry::{
    GantryError, Instruction, Priority, StatusReport, Stimulus, StimulusPayload, TaskState,
    WorkerConfig, WorkerState,
};

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

fn worker() -> WorkerState {
    trace_init();
    WorkerState::new(WorkerConfig::development()).unwrap()
}

fn assign(key: &str, deps: &[(&str, &[&str])]) -> Stimulus {
    assign_with(key, deps, &[], Priority::default())
}

fn assign_with(
    key: &str,
    deps: &[(&str, &[&str])],
    restrictions: &[(&str, u64)],
    priority: Priority,
) -> Stimulus {
    let mut holders = HashMap::new();
    for (dep, peers) in deps {
        holders.insert(
            dep.to_string(),
            peers.iter().map(|p| p.to_string()).collect(),
        );
    }
    Stimulus::new(StimulusPayload::AssignCompute {
        key: key.to_string(),
        dependencies: deps.iter().map(|(dep, _)| dep.to_string()).collect(),
        holders,
        nbytes: HashMap::new(),
        priority,
        restrictions: restrictions
            .iter()
            .map(|(name, quantity)| (name.to_string(), *quantity))
            .collect(),
        duration_estimate: None,
        run_spec: serde_json::json!({"op": "integration"}),
        metadata: serde_json::Value::Null,
    })
}

fn gather_ok(peer: &str, values: &[(&str, &[u8])]) -> Stimulus {
    Stimulus::new(StimulusPayload::GatherOk {
        peer: peer.to_string(),
        data: values
            .iter()
            .map(|(k, v)| (k.to_string(), Bytes::copy_from_slice(v)))
            .collect(),
    })
}

fn release(key: &str) -> Stimulus {
    Stimulus::new(StimulusPayload::ReleaseKey {
        key: key.to_string(),
    })
}

fn execute_ok(key: &str, value: &[u8]) -> Stimulus {
    Stimulus::new(StimulusPayload::ExecuteOk {
        key: key.to_string(),
        value: Bytes::copy_from_slice(value),
    })
}

#[test]
fn duplicate_assignment_in_memory_is_a_noop() {
    let mut worker = worker();
    worker.handle_stimulus(assign("a", &[])).unwrap();
    worker.handle_stimulus(execute_ok("a", b"v")).unwrap();
    assert_eq!(worker.task_state("a"), Some(TaskState::Memory));

    let instructions = worker.handle_stimulus(assign("a", &[])).unwrap();
    assert!(instructions.is_empty());
    assert_eq!(worker.task_state("a"), Some(TaskState::Memory));
}

#[test]
fn cancel_then_reassign_adopts_the_inflight_fetch() {
    // A task in flight is released, re-requested before the fetch settles,
    // and the fetch result must be retained without a second fetch.
    let mut worker = worker();
    worker
        .handle_stimulus(assign("a", &[("b", &["peer-p"])]))
        .unwrap();
    assert_eq!(worker.task_state("b"), Some(TaskState::Flight));

    worker.handle_stimulus(release("a")).unwrap();
    // The compute task is gone; its dependency is cancelled mid-flight.
    assert_eq!(worker.task_state("a"), None);
    assert_eq!(worker.task_state("b"), Some(TaskState::Cancelled));

    // Re-request before the fetch completes.
    let instructions = worker
        .handle_stimulus(assign("a2", &[("b", &["peer-p"])]))
        .unwrap();
    assert_eq!(worker.task_state("b"), Some(TaskState::Resumed));
    // No second fetch was issued for b.
    assert!(instructions.iter().all(|i| i.kind() != "begin-fetch"));

    let instructions = worker
        .handle_stimulus(gather_ok("peer-p", &[("b", b"kept")]))
        .unwrap();
    assert_eq!(worker.task_state("b"), Some(TaskState::Memory));
    assert_eq!(worker.value("b"), Some(&Bytes::from_static(b"kept")));
    // The dependent went straight to executing off the adopted value.
    assert_eq!(worker.task_state("a2"), Some(TaskState::Executing));
    assert!(instructions.iter().any(|i| i.kind() == "execute-task"));
}

#[test]
fn release_and_rerequest_of_the_flight_key_itself() {
    // Same race, aimed at the in-flight key directly: release(b), then a
    // re-request for b before the fetch settles, then the fetch success.
    let mut worker = worker();
    worker
        .handle_stimulus(assign("a", &[("b", &["peer-p"])]))
        .unwrap();
    assert_eq!(worker.task_state("b"), Some(TaskState::Flight));

    worker.handle_stimulus(release("b")).unwrap();
    assert_eq!(worker.task_state("b"), Some(TaskState::Cancelled));

    let instructions = worker.handle_stimulus(assign("b", &[])).unwrap();
    assert_eq!(worker.task_state("b"), Some(TaskState::Resumed));
    assert!(instructions.iter().all(|i| i.kind() != "begin-fetch"));

    worker
        .handle_stimulus(gather_ok("peer-p", &[("b", b"kept")]))
        .unwrap();
    assert_eq!(worker.task_state("b"), Some(TaskState::Memory));
    assert_eq!(worker.value("b"), Some(&Bytes::from_static(b"kept")));
    // The waiter saw the value arrive like any other fan-out.
    assert_eq!(worker.task_state("a"), Some(TaskState::Executing));
}

#[test]
fn cancelled_fetch_without_rerequest_is_discarded() {
    let mut worker = worker();
    worker
        .handle_stimulus(assign("a", &[("b", &["peer-p"])]))
        .unwrap();
    worker.handle_stimulus(release("a")).unwrap();
    assert_eq!(worker.task_state("b"), Some(TaskState::Cancelled));

    worker
        .handle_stimulus(gather_ok("peer-p", &[("b", b"late")]))
        .unwrap();
    assert_eq!(worker.task_state("b"), None);
    assert_eq!(worker.value("b"), None);
    assert_eq!(worker.task_count(), 0);
}

#[test]
fn three_keys_one_peer_one_connection_one_batch() {
    let config = WorkerConfig::builder()
        .fetch_budgets(1, 64 * 1024 * 1024)
        .fetch_batching(100, 64 * 1024 * 1024)
        .validate_after_each(true)
        .build()
        .unwrap();
    let mut worker = WorkerState::new(config).unwrap();

    let instructions = worker
        .handle_stimulus(assign(
            "sink",
            &[
                ("d1", &["peer-p"]),
                ("d2", &["peer-p"]),
                ("d3", &["peer-p"]),
            ],
        ))
        .unwrap();

    let fetches: Vec<_> = instructions
        .iter()
        .filter_map(|i| match i {
            Instruction::BeginFetch { peer, keys, .. } => Some((peer.clone(), keys.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(fetches.len(), 1, "expected exactly one bundled fetch");
    let (peer, mut keys) = fetches[0].clone();
    keys.sort();
    assert_eq!(peer, "peer-p");
    assert_eq!(keys, vec!["d1", "d2", "d3"]);
}

#[test]
fn reservation_is_all_or_nothing() {
    let config = WorkerConfig::builder()
        .thread_slots(4)
        .resource("gpu", 1)
        .validate_after_each(true)
        .build()
        .unwrap();
    let mut worker = WorkerState::new(config).unwrap();

    // Needs two gpu units with only one configured: stays ready forever
    // with no reservation and no instruction.
    let instructions = worker
        .handle_stimulus(assign_with(
            "big",
            &[],
            &[("gpu", 2)],
            Priority::default(),
        ))
        .unwrap();
    assert_eq!(worker.task_state("big"), Some(TaskState::Ready));
    assert!(instructions.iter().all(|i| i.kind() != "execute-task"));

    // One unit requested with one available: admitted immediately.
    // ("big" blocks the queue head, so release it first.)
    worker.handle_stimulus(release("big")).unwrap();
    let instructions = worker
        .handle_stimulus(assign_with(
            "small",
            &[],
            &[("gpu", 1)],
            Priority::default(),
        ))
        .unwrap();
    assert_eq!(worker.task_state("small"), Some(TaskState::Executing));
    assert!(instructions.iter().any(|i| i.kind() == "execute-task"));
}

#[test]
fn priority_orders_admission() {
    let config = WorkerConfig::builder()
        .thread_slots(1)
        .validate_after_each(true)
        .build()
        .unwrap();
    let mut worker = WorkerState::new(config).unwrap();

    worker
        .handle_stimulus(assign_with("occupant", &[], &[], Priority::new(0, 0)))
        .unwrap();
    worker
        .handle_stimulus(assign_with("late-low", &[], &[], Priority::new(5, 0)))
        .unwrap();
    worker
        .handle_stimulus(assign_with("late-high", &[], &[], Priority::new(1, 0)))
        .unwrap();

    // Slot frees: the lower tuple wins even though it arrived later.
    worker.handle_stimulus(execute_ok("occupant", b"v")).unwrap();
    assert_eq!(worker.task_state("late-high"), Some(TaskState::Executing));
    assert_eq!(worker.task_state("late-low"), Some(TaskState::Ready));
}

#[test]
fn pause_holds_admissions_resume_drains() {
    let mut worker = worker();
    worker
        .handle_stimulus(Stimulus::new(StimulusPayload::Pause))
        .unwrap();

    let instructions = worker
        .handle_stimulus(assign("a", &[("b", &["peer-p"])]))
        .unwrap();
    assert!(instructions.is_empty());
    // Queued for fetch but not admitted while paused.
    assert_eq!(worker.task_state("b"), Some(TaskState::Fetch));

    let instructions = worker
        .handle_stimulus(Stimulus::new(StimulusPayload::Resume))
        .unwrap();
    assert_eq!(worker.task_state("b"), Some(TaskState::Flight));
    assert!(instructions.iter().any(|i| i.kind() == "begin-fetch"));
}

#[test]
fn secede_frees_the_slot_for_the_next_task() {
    let config = WorkerConfig::builder()
        .thread_slots(1)
        .validate_after_each(true)
        .build()
        .unwrap();
    let mut worker = WorkerState::new(config).unwrap();

    worker.handle_stimulus(assign("long", &[])).unwrap();
    worker.handle_stimulus(assign("queued", &[])).unwrap();
    assert_eq!(worker.task_state("queued"), Some(TaskState::Ready));

    let instructions = worker
        .handle_stimulus(Stimulus::new(StimulusPayload::Secede {
            key: "long".to_string(),
        }))
        .unwrap();
    assert_eq!(worker.task_state("long"), Some(TaskState::LongRunning));
    assert_eq!(worker.task_state("queued"), Some(TaskState::Executing));
    assert!(instructions.iter().any(|i| i.kind() == "execute-task"));

    // The seceded task still finishes normally.
    worker.handle_stimulus(execute_ok("long", b"v")).unwrap();
    assert_eq!(worker.task_state("long"), Some(TaskState::Memory));
}

#[test]
fn peer_data_request_answers_payload_or_not_found() {
    let mut worker = worker();
    worker.handle_stimulus(assign("have", &[])).unwrap();
    worker.handle_stimulus(execute_ok("have", b"payload")).unwrap();

    let instructions = worker
        .handle_stimulus(Stimulus::new(StimulusPayload::PeerDataRequest {
            request_id: "req-1".to_string(),
            peer: "peer-q".to_string(),
            keys: vec!["have".to_string(), "missing".to_string()],
        }))
        .unwrap();

    let reply = instructions
        .iter()
        .find_map(|i| match i {
            Instruction::SendStatusUpdate {
                report:
                    StatusReport::DataReply {
                        request_id,
                        found,
                        missing,
                        ..
                    },
            } => Some((request_id.clone(), found.clone(), missing.clone())),
            _ => None,
        })
        .expect("expected a data reply");
    assert_eq!(reply.0, "req-1");
    assert_eq!(reply.1.get("have"), Some(&Bytes::from_static(b"payload")));
    assert_eq!(reply.2, vec!["missing".to_string()]);
}

#[test]
fn peer_data_request_rejected_while_closing() {
    let mut worker = worker();
    worker
        .handle_stimulus(Stimulus::new(StimulusPayload::Close))
        .unwrap();

    let instructions = worker
        .handle_stimulus(Stimulus::new(StimulusPayload::PeerDataRequest {
            request_id: "req-2".to_string(),
            peer: "peer-q".to_string(),
            keys: vec!["anything".to_string()],
        }))
        .unwrap();
    assert!(instructions.iter().any(|i| i.kind() == "reject-request"));
}

#[test]
fn invalid_transition_is_surfaced_not_absorbed() {
    let mut worker = worker();
    worker.handle_stimulus(assign("a", &[])).unwrap();
    worker.handle_stimulus(execute_ok("a", b"v")).unwrap();

    // Seceding a task that already finished has no table entry.
    let err = worker
        .handle_stimulus(Stimulus::new(StimulusPayload::Secede {
            key: "a".to_string(),
        }))
        .unwrap_err();
    match err {
        GantryError::InvalidTransition { key, state, stimulus } => {
            assert_eq!(key, "a");
            assert_eq!(state, "memory");
            assert_eq!(stimulus, "secede-to-long-running");
        }
        other => panic!("expected invalid transition, got {other}"),
    }
}

#[test]
fn execution_failure_is_reported_and_recorded() {
    let mut worker = worker();
    worker.handle_stimulus(assign("a", &[])).unwrap();

    let instructions = worker
        .handle_stimulus(Stimulus::new(StimulusPayload::ExecuteErr {
            key: "a".to_string(),
            error: "division by zero".to_string(),
        }))
        .unwrap();
    assert_eq!(worker.task_state("a"), Some(TaskState::Error));
    assert!(instructions.iter().any(|i| matches!(
        i,
        Instruction::SendStatusUpdate {
            report: StatusReport::TaskErred { key, error }
        } if key == "a" && error.contains("division")
    )));
    assert_eq!(
        worker.task("a").unwrap().error.as_deref(),
        Some("division by zero")
    );
}

#[test]
fn fetch_failure_retries_alternate_holder_then_exhausts() {
    let config = WorkerConfig::builder()
        .fetch_failure_policy(std::time::Duration::from_secs(60), 2)
        .validate_after_each(true)
        .build()
        .unwrap();
    let mut worker = WorkerState::new(config).unwrap();

    worker
        .handle_stimulus(assign("a", &[("b", &["peer-1", "peer-2"])]))
        .unwrap();
    assert_eq!(worker.task_state("b"), Some(TaskState::Flight));

    // First failure: blacklisted, retried against the alternate holder.
    let instructions = worker
        .handle_stimulus(Stimulus::new(StimulusPayload::GatherErr {
            peer: "peer-1".to_string(),
            keys: vec!["b".to_string()],
            reason: "connection refused".to_string(),
        }))
        .unwrap();
    assert_eq!(worker.task_state("b"), Some(TaskState::Flight));
    let retry = instructions
        .iter()
        .find_map(|i| match i {
            Instruction::BeginFetch { peer, .. } => Some(peer.clone()),
            _ => None,
        })
        .expect("expected a retry fetch");
    assert_eq!(retry, "peer-2");

    // Second failure hits the retry cap: surfaced, task moves to error.
    let instructions = worker
        .handle_stimulus(Stimulus::new(StimulusPayload::GatherErr {
            peer: "peer-2".to_string(),
            keys: vec!["b".to_string()],
            reason: "connection refused".to_string(),
        }))
        .unwrap();
    assert_eq!(worker.task_state("b"), Some(TaskState::Error));
    assert!(instructions.iter().any(|i| matches!(
        i,
        Instruction::SendStatusUpdate {
            report: StatusReport::FetchExhausted { key, attempts }
        } if key == "b" && *attempts == 2
    )));
}

#[test]
fn release_of_memory_task_confirms_and_forgets() {
    let mut worker = worker();
    worker.handle_stimulus(assign("a", &[])).unwrap();
    worker.handle_stimulus(execute_ok("a", b"v")).unwrap();

    let instructions = worker.handle_stimulus(release("a")).unwrap();
    assert_eq!(worker.task_state("a"), None);
    assert_eq!(worker.value("a"), None);
    assert!(instructions.iter().any(|i| matches!(
        i,
        Instruction::SendStatusUpdate {
            report: StatusReport::ReleaseConfirmed { key }
        } if key == "a"
    )));
    assert_eq!(worker.ledger_snapshot().stored_bytes, 0);
}

#[test]
fn stimulus_log_records_the_story() {
    let mut worker = worker();
    worker
        .handle_stimulus(assign("a", &[("b", &["peer-p"])]))
        .unwrap();
    worker
        .handle_stimulus(gather_ok("peer-p", &[("b", b"v")]))
        .unwrap();
    worker.handle_stimulus(execute_ok("a", b"r")).unwrap();

    let story: Vec<&str> = worker.log().story("a").iter().map(|e| e.kind).collect();
    assert_eq!(
        story,
        vec!["task-assigned-for-compute", "task-execution-finished"]
    );
    let story: Vec<&str> = worker.log().story("b").iter().map(|e| e.kind).collect();
    assert_eq!(story, vec!["gather-dependency-succeeded"]);
    assert_eq!(worker.log().appended(), 3);
}

#[test]
fn every_stimulus_sequence_keeps_the_validator_clean() {
    // validate_after_each is on in the development preset, so each
    // handle_stimulus call already asserts a clean walk; this exercises a
    // longer mixed sequence including failure and cancellation paths.
    let mut worker = worker();
    worker
        .handle_stimulus(assign("x", &[("d", &["p1", "p2"])]))
        .unwrap();
    worker
        .handle_stimulus(Stimulus::new(StimulusPayload::GatherErr {
            peer: "p1".to_string(),
            keys: vec!["d".to_string()],
            reason: "timeout".to_string(),
        }))
        .unwrap();
    worker.handle_stimulus(release("x")).unwrap();
    worker
        .handle_stimulus(gather_ok("p2", &[("d", b"late")]))
        .unwrap();
    worker
        .handle_stimulus(Stimulus::new(StimulusPayload::Pause))
        .unwrap();
    worker
        .handle_stimulus(Stimulus::new(StimulusPayload::Resume))
        .unwrap();
    assert!(worker.validate().is_empty());
}
