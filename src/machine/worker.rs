use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::{debug, info, trace, warn};

use crate::core::config::WorkerConfig;
use crate::core::errors::{GantryError, Result};
use crate::core::limits::{LedgerSnapshot, ReserveOutcome, ResourceLedger};
use crate::fetch::orchestrator::{FetchDisposition, FetchOrchestrator};
use crate::machine::log::StimulusLog;
use crate::machine::stimulus::{
    FreeScope, Instruction, StatusReport, Stimulus, StimulusId, StimulusPayload,
};
use crate::machine::task::{TaskEntity, TaskKey, TaskState};
use crate::machine::transition::{self, Action, Verdict};
use crate::machine::validator::{self, Violation};

/// Admission posture of the node as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Running,
    /// No new admissions; in-flight operations run to completion.
    Paused,
    /// Shutting down; peer requests are rejected.
    Closing,
}

/// The state machine core: owns every task entity, the resource ledger, the
/// fetch orchestrator and the stimulus log, and converts one stimulus at a
/// time into an ordered instruction list.
///
/// Entities are mutated only here, and only through the transition table and
/// its cascade guard. Collaborators communicate exclusively by producing new
/// stimuli, so there are no locks anywhere in this type.
pub struct WorkerState {
    config: WorkerConfig,
    tasks: HashMap<TaskKey, TaskEntity>,
    /// Local value bank; presence here is what `Memory` means.
    data: HashMap<TaskKey, Bytes>,
    /// Ready tasks contending for compute, lowest priority tuple first.
    /// Entries are lazily invalidated: state is re-checked on pop.
    ready: BinaryHeap<Reverse<(crate::machine::task::Priority, TaskKey)>>,
    ledger: ResourceLedger,
    orchestrator: FetchOrchestrator,
    log: StimulusLog,
    status: NodeStatus,
}

impl WorkerState {
    pub fn new(config: WorkerConfig) -> Result<Self> {
        config.validate()?;
        let ledger = ResourceLedger::new(&config);
        let orchestrator = FetchOrchestrator::new(&config);
        let log = StimulusLog::new(config.stimulus_log_retention);
        Ok(Self {
            config,
            tasks: HashMap::new(),
            data: HashMap::new(),
            ready: BinaryHeap::new(),
            ledger,
            orchestrator,
            log,
            status: NodeStatus::Running,
        })
    }

    /// Process one stimulus atomically: look up/create the affected task
    /// entities, consult the transition table, adjust the ledger and the
    /// orchestrator, and return the instructions for collaborators, in
    /// order. Instructions freeing a budget precede instructions consuming
    /// the freed budget.
    pub fn handle_stimulus(&mut self, stimulus: Stimulus) -> Result<Vec<Instruction>> {
        let now = stimulus.received_at;
        let seq = self.log.append(&stimulus);
        trace!(seq, kind = stimulus.payload.kind(), id = %stimulus.id, "stimulus");

        let mut out = Vec::new();
        match &stimulus.payload {
            StimulusPayload::Pause => {
                if self.status == NodeStatus::Running {
                    info!("pausing admissions");
                    self.status = NodeStatus::Paused;
                }
            }
            StimulusPayload::Resume => {
                if self.status == NodeStatus::Paused {
                    info!("resuming admissions");
                    self.status = NodeStatus::Running;
                    self.drain(now, &mut out)?;
                }
            }
            StimulusPayload::Close => {
                info!("closing node");
                self.status = NodeStatus::Closing;
                out.push(Instruction::SendStatusUpdate {
                    report: StatusReport::Closing,
                });
            }
            StimulusPayload::PeerDataRequest {
                request_id,
                peer,
                keys,
            } => {
                self.serve_peer_request(request_id, peer, keys, &mut out);
            }
            StimulusPayload::GatherOk { peer, data } => {
                let reservation = self.ledger.release_fetch(peer)?;
                out.push(Instruction::FreeResources {
                    scope: FreeScope::Fetch { peer: peer.clone() },
                });
                let mut keys: Vec<&TaskKey> = data.keys().collect();
                keys.sort();
                for key in keys {
                    // The value is being adopted whatever bucket the key
                    // sat in; scrub both so the buckets stay consistent.
                    self.orchestrator.forget_key(key);
                    self.apply(key.clone(), &stimulus, now, &mut out)?;
                }
                // Keys the peer did not return count as per-key failures.
                let mut absent: Vec<TaskKey> = reservation
                    .keys
                    .iter()
                    .filter(|k| !data.contains_key(*k))
                    .cloned()
                    .collect();
                absent.sort();
                for key in absent {
                    debug!(%key, %peer, "key missing from gather response");
                    self.orchestrator.settle_ok(peer, &key);
                    match self.task_state(&key) {
                        Some(TaskState::Flight) | Some(TaskState::Resumed) => {
                            self.settle_failed_key(&key, peer, now, &mut out)?;
                        }
                        Some(TaskState::Cancelled) => {
                            self.forget(&key, &mut out)?;
                        }
                        // Forgotten or already satisfied elsewhere.
                        _ => {}
                    }
                }
                self.drain(now, &mut out)?;
            }
            StimulusPayload::GatherErr { peer, keys, reason } => {
                debug!(%peer, keys = keys.len(), %reason, "gather batch failed");
                self.ledger.release_fetch(peer)?;
                out.push(Instruction::FreeResources {
                    scope: FreeScope::Fetch { peer: peer.clone() },
                });
                let mut keys = keys.clone();
                keys.sort();
                for key in &keys {
                    self.apply(key.clone(), &stimulus, now, &mut out)?;
                }
                self.drain(now, &mut out)?;
            }
            StimulusPayload::AssignCompute { key, .. }
            | StimulusPayload::AnnounceHolders { key, .. }
            | StimulusPayload::Secede { key }
            | StimulusPayload::ExecuteOk { key, .. }
            | StimulusPayload::ExecuteErr { key, .. }
            | StimulusPayload::ReleaseKey { key } => {
                self.apply(key.clone(), &stimulus, now, &mut out)?;
                self.drain(now, &mut out)?;
            }
        }

        if self.config.validate_after_each {
            let violations = self.validate();
            if !violations.is_empty() {
                let first = violations[0].to_string();
                return Err(GantryError::invariant_violations(violations.len(), first));
            }
        }
        Ok(out)
    }

    /// Run the invariant checker over the whole state. Side-effect-free.
    pub fn validate(&self) -> Vec<Violation> {
        validator::validate(self)
    }

    // ------------------------------------------------------------------
    // Stimulus application
    // ------------------------------------------------------------------

    /// Route one task-scoped stimulus through the transition table.
    fn apply(
        &mut self,
        key: TaskKey,
        stimulus: &Stimulus,
        now: DateTime<Utc>,
        out: &mut Vec<Instruction>,
    ) -> Result<()> {
        let creates = matches!(
            stimulus.payload,
            StimulusPayload::AssignCompute { .. } | StimulusPayload::AnnounceHolders { .. }
        );
        if !self.tasks.contains_key(&key) {
            if creates {
                self.create_entity(&key, stimulus.id, now);
                // A holder announcement for a key no local task wants is
                // stale coordinator chatter, not a reason to hold state.
                if matches!(stimulus.payload, StimulusPayload::AnnounceHolders { .. })
                    && self.tasks[&key].dependents.is_empty()
                {
                    self.tasks.remove(&key);
                    debug!(%key, "holder announcement for an unwanted key");
                    return Ok(());
                }
            } else {
                match stimulus.payload {
                    // Results and failures for forgotten keys are tolerated:
                    // the cluster makes no cross-node ordering promises.
                    StimulusPayload::GatherOk { .. } | StimulusPayload::GatherErr { .. } => {
                        debug!(%key, "fetch outcome for an unknown task, dropping");
                        return Ok(());
                    }
                    StimulusPayload::ReleaseKey { .. } => {
                        trace!(%key, "release of an unknown task");
                        return Ok(());
                    }
                    _ => {
                        return Err(GantryError::invalid_transition(
                            key,
                            "forgotten",
                            stimulus.payload.kind(),
                        ));
                    }
                }
            }
        }

        let from = self.tasks[&key].state;
        match transition::step(from, &stimulus.payload) {
            Verdict::Ignore => {
                trace!(%key, state = %from, kind = stimulus.payload.kind(), "idempotent no-op");
                Ok(())
            }
            Verdict::Illegal => Err(GantryError::invalid_transition(
                key,
                from.name(),
                stimulus.payload.kind(),
            )),
            Verdict::Step(step) => {
                if let Some(next) = step.next {
                    self.set_state(&key, next);
                }
                for action in step.actions {
                    self.perform(action, &key, from, stimulus, now, out)?;
                }
                Ok(())
            }
        }
    }

    /// Materialize one table action.
    fn perform(
        &mut self,
        action: Action,
        key: &TaskKey,
        from: TaskState,
        stimulus: &Stimulus,
        now: DateTime<Utc>,
        out: &mut Vec<Instruction>,
    ) -> Result<()> {
        match action {
            Action::AdoptAssignment => self.adopt_assignment(key, stimulus, now),
            Action::RecordHolders => {
                if let StimulusPayload::AnnounceHolders {
                    holders, nbytes, ..
                } = &stimulus.payload
                {
                    let entity = self.entity_mut(key)?;
                    entity.holders.extend(holders.iter().cloned());
                    if entity.nbytes.is_none() {
                        entity.nbytes = *nbytes;
                    }
                }
                Ok(())
            }
            Action::EvaluateReadiness => self.evaluate_readiness(key),
            Action::StoreValue => {
                let value = match &stimulus.payload {
                    StimulusPayload::ExecuteOk { value, .. } => value.clone(),
                    StimulusPayload::GatherOk { data, .. } => data
                        .get(key)
                        .cloned()
                        .ok_or_else(|| GantryError::internal("gather value vanished"))?,
                    _ => return Err(GantryError::internal("store-value without a value")),
                };
                self.store_value(key, value)
            }
            Action::SecedeSlot => {
                if matches!(from, TaskState::Cancelled | TaskState::Resumed) {
                    let cancelled_from = self.entity(key)?.cancelled_from;
                    if !cancelled_from.is_some_and(TaskState::holds_compute) {
                        return Err(GantryError::invalid_transition(
                            key.clone(),
                            from.name(),
                            stimulus.payload.kind(),
                        ));
                    }
                }
                self.ledger.secede(key)
            }
            Action::RecordError => {
                if let StimulusPayload::ExecuteErr { error, .. } = &stimulus.payload {
                    self.entity_mut(key)?.error = Some(error.clone());
                }
                Ok(())
            }
            Action::FreeCompute => {
                self.ledger.release(key)?;
                out.push(Instruction::FreeResources {
                    scope: FreeScope::Compute { key: key.clone() },
                });
                Ok(())
            }
            Action::ReportFinished => {
                let nbytes = self.entity(key)?.nbytes.unwrap_or(0);
                out.push(Instruction::SendStatusUpdate {
                    report: StatusReport::TaskFinished {
                        key: key.clone(),
                        nbytes,
                    },
                });
                Ok(())
            }
            Action::ReportErred => {
                let error = self
                    .entity(key)?
                    .error
                    .clone()
                    .unwrap_or_else(|| "unspecified".to_string());
                out.push(Instruction::SendStatusUpdate {
                    report: StatusReport::TaskErred {
                        key: key.clone(),
                        error,
                    },
                });
                Ok(())
            }
            Action::RequeueFetch => {
                let peer = match &stimulus.payload {
                    StimulusPayload::GatherErr { peer, .. } => peer.clone(),
                    _ => return Err(GantryError::internal("requeue-fetch without a peer")),
                };
                self.settle_failed_key(key, &peer, now, out)
            }
            Action::MarkCancelled => {
                let entity = self.entity_mut(key)?;
                if entity.cancelled_from.is_none() {
                    entity.cancelled_from = Some(from);
                }
                Ok(())
            }
            Action::ConfirmRelease => {
                out.push(Instruction::SendStatusUpdate {
                    report: StatusReport::ReleaseConfirmed { key: key.clone() },
                });
                Ok(())
            }
            Action::Forget => self.forget(key, out),
        }
    }

    /// Record the assignment payload on the entity and wire up both
    /// dependency directions. A duplicate assignment is a no-op.
    fn adopt_assignment(
        &mut self,
        key: &TaskKey,
        stimulus: &Stimulus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let StimulusPayload::AssignCompute {
            dependencies,
            holders,
            nbytes,
            priority,
            restrictions,
            duration_estimate,
            run_spec,
            metadata,
            ..
        } = &stimulus.payload
        else {
            return Err(GantryError::internal("adopt-assignment without payload"));
        };

        if self.entity(key)?.is_compute() {
            trace!(%key, "duplicate assignment");
            return Ok(());
        }

        {
            let entity = self.entity_mut(key)?;
            entity.run_spec = Some(run_spec.clone());
            entity.priority = *priority;
            entity.restrictions = restrictions.clone();
            entity.duration_estimate = *duration_estimate;
            entity.metadata = metadata.clone();
            entity.dependencies.extend(dependencies.iter().cloned());
        }
        debug!(%key, deps = dependencies.len(), "assigned for compute");

        let priority = *priority;
        for dep in dependencies {
            if !self.tasks.contains_key(dep) {
                self.create_entity(dep, stimulus.id, now);
                self.shift(dep, TaskState::Waiting)?;
            }
            let dep_entity = self.entity_mut(dep)?;
            dep_entity.dependents.insert(key.clone());
            // A dependency fetches at the urgency of its most urgent waiter.
            if !dep_entity.is_compute() && priority < dep_entity.priority {
                dep_entity.priority = priority;
            }
            if let Some(announced) = holders.get(dep) {
                dep_entity.holders.extend(announced.iter().cloned());
            }
            if dep_entity.nbytes.is_none() {
                dep_entity.nbytes = nbytes.get(dep).copied();
            }
            // A dependency already sitting in waiting may now have holders;
            // a cancelled one has just been re-requested.
            match self.tasks[dep].state {
                TaskState::Waiting => self.evaluate_readiness(dep)?,
                TaskState::Cancelled => self.shift(dep, TaskState::Resumed)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Re-derive where a waiting task belongs: ready when every dependency
    /// is local, queued for fetch when it is a dependency with known
    /// holders, otherwise left waiting.
    fn evaluate_readiness(&mut self, key: &TaskKey) -> Result<()> {
        let entity = self.entity(key)?;
        if entity.state != TaskState::Waiting {
            return Ok(());
        }

        if entity.is_compute() {
            let missing: Vec<TaskKey> = entity
                .dependencies
                .iter()
                .filter(|dep| !self.data.contains_key(*dep))
                .cloned()
                .collect();
            if missing.is_empty() {
                let priority = entity.priority;
                self.shift(key, TaskState::Ready)?;
                self.ready.push(Reverse((priority, key.clone())));
            } else {
                for dep in missing {
                    let dep_entity = match self.tasks.get(&dep) {
                        Some(e) => e,
                        // Released dependency; it comes back when the
                        // coordinator re-announces it.
                        None => continue,
                    };
                    if dep_entity.state == TaskState::Waiting && !dep_entity.holders.is_empty() {
                        let priority = dep_entity.priority;
                        self.shift(&dep, TaskState::Fetch)?;
                        self.orchestrator.enqueue(priority, dep);
                    }
                }
            }
        } else if !entity.dependents.is_empty() && !entity.holders.is_empty() {
            let priority = entity.priority;
            self.shift(key, TaskState::Fetch)?;
            self.orchestrator.enqueue(priority, key.clone());
        }
        Ok(())
    }

    /// Store an arrived value and fan out: every dependent with no other
    /// missing dependency leaves waiting.
    fn store_value(&mut self, key: &TaskKey, value: Bytes) -> Result<()> {
        let bytes = value.len() as u64;
        self.ledger.note_stored(bytes);
        self.data.insert(key.clone(), value);
        {
            let entity = self.entity_mut(key)?;
            entity.nbytes = Some(bytes);
            entity.cancelled_from = None;
            entity.fetch_attempts = 0;
            entity.error = None;
        }
        debug!(%key, bytes, "value stored");

        let mut dependents: Vec<TaskKey> =
            self.entity(key)?.dependents.iter().cloned().collect();
        dependents.sort();
        for dependent in dependents {
            if self.tasks.get(&dependent).map(|e| e.state) == Some(TaskState::Waiting) {
                self.evaluate_readiness(&dependent)?;
            }
        }
        Ok(())
    }

    /// Per-key failure handling shared by failed batches and keys a peer
    /// answered without.
    fn settle_failed_key(
        &mut self,
        key: &TaskKey,
        peer: &str,
        now: DateTime<Utc>,
        out: &mut Vec<Instruction>,
    ) -> Result<()> {
        let attempts = {
            let entity = self.entity_mut(key)?;
            entity.fetch_attempts += 1;
            entity.fetch_attempts
        };
        let entity = self
            .tasks
            .get(key)
            .ok_or_else(|| GantryError::internal(format!("unknown task {key}")))?;
        let disposition = self
            .orchestrator
            .settle_err(now, peer, key, attempts, entity);
        match disposition {
            FetchDisposition::Requeued => {
                let priority = self.entity(key)?.priority;
                self.shift(key, TaskState::Fetch)?;
                self.entity_mut(key)?.cancelled_from = None;
                self.orchestrator.enqueue(priority, key.clone());
            }
            FetchDisposition::NeedHolders => {
                self.shift(key, TaskState::Waiting)?;
                self.entity_mut(key)?.cancelled_from = None;
                out.push(Instruction::SendStatusUpdate {
                    report: StatusReport::NeedHolders {
                        keys: vec![key.clone()],
                    },
                });
            }
            FetchDisposition::Exhausted => {
                self.shift(key, TaskState::Error)?;
                {
                    let entity = self.entity_mut(key)?;
                    entity.cancelled_from = None;
                    entity.error = Some(format!("fetch exhausted after {attempts} attempts"));
                }
                out.push(Instruction::SendStatusUpdate {
                    report: StatusReport::FetchExhausted {
                        key: key.clone(),
                        attempts,
                    },
                });
            }
        }
        Ok(())
    }

    /// Remove an entity from the arena, returning any held budget and
    /// forgetting orphaned dependencies with it.
    fn forget(&mut self, key: &TaskKey, out: &mut Vec<Instruction>) -> Result<()> {
        let mut worklist = vec![key.clone()];
        while let Some(key) = worklist.pop() {
            let Some(entity) = self.tasks.remove(&key) else {
                continue;
            };
            debug!(%key, state = %entity.state, "forgetting task");

            if self.ledger.holds_compute(&key) {
                self.ledger.release(&key)?;
                out.push(Instruction::FreeResources {
                    scope: FreeScope::Compute { key: key.clone() },
                });
            }
            self.orchestrator.forget_key(&key);
            if let Some(value) = self.data.remove(&key) {
                self.ledger.note_evicted(value.len() as u64);
            }

            let mut deps: Vec<TaskKey> = entity.dependencies.iter().cloned().collect();
            deps.sort();
            for dep in deps {
                let (orphan, state) = {
                    let Some(dep_entity) = self.tasks.get_mut(&dep) else {
                        continue;
                    };
                    dep_entity.dependents.remove(&key);
                    (dep_entity.is_orphan(), dep_entity.state)
                };
                if !orphan {
                    continue;
                }
                match state {
                    TaskState::Waiting
                    | TaskState::Fetch
                    | TaskState::Memory
                    | TaskState::Error
                    | TaskState::Released => worklist.push(dep),
                    // Nobody wants the in-flight value anymore; let the
                    // operation land and discard its outcome.
                    TaskState::Flight => {
                        self.shift(&dep, TaskState::Cancelled)?;
                        self.entity_mut(&dep)?.cancelled_from = Some(TaskState::Flight);
                    }
                    TaskState::Resumed => {
                        self.shift(&dep, TaskState::Cancelled)?;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Admit queued fetches and ready tasks up to the ledger's budgets.
    /// Runs at the end of every stimulus while the node accepts work.
    fn drain(&mut self, now: DateTime<Utc>, out: &mut Vec<Instruction>) -> Result<()> {
        if self.status != NodeStatus::Running {
            return Ok(());
        }

        let batches = self.orchestrator.admit(now, &mut self.ledger, &self.tasks);
        for batch in batches {
            for key in &batch.keys {
                self.shift(key, TaskState::Flight)?;
            }
            out.push(Instruction::BeginFetch {
                peer: batch.peer,
                keys: batch.keys,
                estimated_bytes: batch.bytes,
            });
        }

        while let Some(Reverse((priority, key))) = self.ready.peek().cloned() {
            let stale = match self.tasks.get(&key) {
                Some(entity) => entity.state != TaskState::Ready || entity.priority != priority,
                None => true,
            };
            if stale {
                self.ready.pop();
                continue;
            }
            let restrictions = self.tasks[&key].restrictions.clone();
            match self.ledger.reserve(&key, &restrictions)? {
                ReserveOutcome::Reserved(grant) => {
                    self.ready.pop();
                    let Some(inputs) = self.collect_inputs(&key) else {
                        // An input was evicted while the task sat in the
                        // heap; surrender the grant and wait again.
                        warn!(%key, "ready task lost an input, back to waiting");
                        self.ledger.release(&key)?;
                        self.shift(&key, TaskState::Waiting)?;
                        continue;
                    };
                    self.shift(&key, TaskState::Executing)?;
                    let run_spec = self.tasks[&key]
                        .run_spec
                        .clone()
                        .ok_or_else(|| GantryError::internal("ready task without a run spec"))?;
                    debug!(%key, "task admitted to executor");
                    out.push(Instruction::ExecuteTask {
                        key: key.clone(),
                        run_spec,
                        inputs,
                        grant,
                    });
                }
                ReserveOutcome::Insufficient {
                    resource,
                    requested,
                    available,
                } => {
                    // Normal backpressure; strict priority order, no bypass.
                    trace!(%key, %resource, requested, available, "admission blocked");
                    break;
                }
            }
        }
        Ok(())
    }

    fn collect_inputs(&self, key: &TaskKey) -> Option<HashMap<TaskKey, Bytes>> {
        let entity = self.tasks.get(key)?;
        let mut inputs = HashMap::with_capacity(entity.dependencies.len());
        for dep in &entity.dependencies {
            inputs.insert(dep.clone(), self.data.get(dep)?.clone());
        }
        Some(inputs)
    }

    fn serve_peer_request(
        &self,
        request_id: &str,
        peer: &str,
        keys: &[TaskKey],
        out: &mut Vec<Instruction>,
    ) {
        if self.status == NodeStatus::Closing {
            out.push(Instruction::RejectRequest {
                request_id: request_id.to_string(),
                peer: peer.to_string(),
                reason: "node is closing".to_string(),
            });
            return;
        }
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        for key in keys {
            match self.data.get(key) {
                Some(value) => {
                    found.insert(key.clone(), value.clone());
                }
                None => missing.push(key.clone()),
            }
        }
        trace!(
            %peer,
            found = found.len(),
            missing = missing.len(),
            "serving peer data request"
        );
        out.push(Instruction::SendStatusUpdate {
            report: StatusReport::DataReply {
                request_id: request_id.to_string(),
                peer: peer.to_string(),
                found,
                missing,
            },
        });
    }

    // ------------------------------------------------------------------
    // Entity plumbing
    // ------------------------------------------------------------------

    fn create_entity(&mut self, key: &TaskKey, created_by: StimulusId, now: DateTime<Utc>) {
        let mut entity = TaskEntity::new(key.clone(), created_by, now);
        // Re-link dependents that kept this key across a forget.
        for (other_key, other) in &self.tasks {
            if other.dependencies.contains(key) {
                entity.dependents.insert(other_key.clone());
            }
        }
        trace!(%key, "task created");
        self.tasks.insert(key.clone(), entity);
    }

    /// Apply a cascade edge, guarded against the legal-transition graph.
    fn shift(&mut self, key: &str, to: TaskState) -> Result<()> {
        let entity = self
            .tasks
            .get_mut(key)
            .ok_or_else(|| GantryError::internal(format!("cascade on unknown task {key}")))?;
        let from = entity.state;
        if from == to {
            return Ok(());
        }
        if !transition::cascade(from, to) {
            return Err(GantryError::invalid_transition(
                key.to_string(),
                from.name(),
                "internal-cascade",
            ));
        }
        trace!(%key, %from, %to, "cascade");
        entity.state = to;
        Ok(())
    }

    /// Apply a stimulus-table edge.
    fn set_state(&mut self, key: &str, to: TaskState) {
        if let Some(entity) = self.tasks.get_mut(key) {
            trace!(%key, from = %entity.state, %to, "transition");
            entity.state = to;
        }
    }

    fn entity(&self, key: &str) -> Result<&TaskEntity> {
        self.tasks
            .get(key)
            .ok_or_else(|| GantryError::internal(format!("unknown task {key}")))
    }

    fn entity_mut(&mut self, key: &str) -> Result<&mut TaskEntity> {
        self.tasks
            .get_mut(key)
            .ok_or_else(|| GantryError::internal(format!("unknown task {key}")))
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn task(&self, key: &str) -> Option<&TaskEntity> {
        self.tasks.get(key)
    }

    pub fn task_state(&self, key: &str) -> Option<TaskState> {
        self.tasks.get(key).map(|entity| entity.state)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn value(&self, key: &str) -> Option<&Bytes> {
        self.data.get(key)
    }

    pub fn log(&self) -> &StimulusLog {
        &self.log
    }

    pub fn ledger_snapshot(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }

    // Validator access.
    pub(crate) fn parts(
        &self,
    ) -> (
        &HashMap<TaskKey, TaskEntity>,
        &HashMap<TaskKey, Bytes>,
        &ResourceLedger,
        &FetchOrchestrator,
        &StimulusLog,
    ) {
        (
            &self.tasks,
            &self.data,
            &self.ledger,
            &self.orchestrator,
            &self.log,
        )
    }
}
