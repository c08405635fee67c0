use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::core::limits::ResourceGrant;
use crate::machine::task::{PeerAddr, Priority, TaskKey};

/// Unique identifier of one stimulus, for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StimulusId(Uuid);

impl StimulusId {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for StimulusId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One external or internally-generated event, stamped on arrival.
///
/// The timestamp rides on the envelope so processing is deterministic given
/// the stimulus sequence: replaying a recorded log reproduces every decision,
/// including blacklist expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stimulus {
    pub id: StimulusId,
    pub received_at: DateTime<Utc>,
    pub payload: StimulusPayload,
}

impl Stimulus {
    pub fn new(payload: StimulusPayload) -> Self {
        Self {
            id: StimulusId::fresh(),
            received_at: Utc::now(),
            payload,
        }
    }

    pub fn at(payload: StimulusPayload, received_at: DateTime<Utc>) -> Self {
        Self {
            id: StimulusId::fresh(),
            received_at,
            payload,
        }
    }
}

/// Event kinds consumed by the state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StimulusPayload {
    /// The coordinator assigned a task for local compute.
    AssignCompute {
        key: TaskKey,
        dependencies: Vec<TaskKey>,
        /// Known holders per dependency key; advisory.
        holders: HashMap<TaskKey, Vec<PeerAddr>>,
        /// Announced value sizes per dependency key.
        nbytes: HashMap<TaskKey, u64>,
        priority: Priority,
        restrictions: HashMap<String, u64>,
        duration_estimate: Option<f64>,
        run_spec: Value,
        /// Free-form annotations, stored on the entity uninterpreted.
        metadata: Value,
    },
    /// A dependency's value became available on the given peers.
    AnnounceHolders {
        key: TaskKey,
        holders: Vec<PeerAddr>,
        nbytes: Option<u64>,
    },
    /// An executing task signalled it will outlive its compute slot.
    Secede { key: TaskKey },
    /// A fetch batch against `peer` succeeded.
    GatherOk {
        peer: PeerAddr,
        data: HashMap<TaskKey, Bytes>,
    },
    /// A fetch batch against `peer` failed wholesale.
    GatherErr {
        peer: PeerAddr,
        keys: Vec<TaskKey>,
        reason: String,
    },
    /// A peer asked this node for stored values.
    PeerDataRequest {
        request_id: String,
        peer: PeerAddr,
        keys: Vec<TaskKey>,
    },
    /// The executor finished a task.
    ExecuteOk { key: TaskKey, value: Bytes },
    /// The executor failed a task.
    ExecuteErr { key: TaskKey, error: String },
    /// The coordinator released/cancelled a task.
    ReleaseKey { key: TaskKey },
    /// Stop admitting work; in-flight operations continue.
    Pause,
    /// Resume admissions.
    Resume,
    /// Shut the node down.
    Close,
}

impl StimulusPayload {
    /// Stable kind tag used by the stimulus log and fault reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AssignCompute { .. } => "task-assigned-for-compute",
            Self::AnnounceHolders { .. } => "task-dependency-released-from-peer",
            Self::Secede { .. } => "secede-to-long-running",
            Self::GatherOk { .. } => "gather-dependency-succeeded",
            Self::GatherErr { .. } => "gather-dependency-failed",
            Self::PeerDataRequest { .. } => "get-data-request-from-peer",
            Self::ExecuteOk { .. } => "task-execution-finished",
            Self::ExecuteErr { .. } => "task-execution-failed",
            Self::ReleaseKey { .. } => "release-task",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Close => "close-node",
        }
    }

    /// Task keys this stimulus touches, for the log.
    pub fn keys(&self) -> Vec<TaskKey> {
        match self {
            Self::AssignCompute { key, .. }
            | Self::AnnounceHolders { key, .. }
            | Self::Secede { key }
            | Self::ExecuteOk { key, .. }
            | Self::ExecuteErr { key, .. }
            | Self::ReleaseKey { key } => vec![key.clone()],
            Self::GatherOk { data, .. } => data.keys().cloned().collect(),
            Self::GatherErr { keys, .. } | Self::PeerDataRequest { keys, .. } => keys.clone(),
            Self::Pause | Self::Resume | Self::Close => Vec::new(),
        }
    }
}

/// What a batch reservation release refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreeScope {
    /// Compute grant released for a finished/failed task.
    Compute { key: TaskKey },
    /// Fetch connection and flight bytes released for a settled batch.
    Fetch { peer: PeerAddr },
}

/// Status payloads delivered to the coordinator (or a requesting peer).
/// Opaque to the core; the transport collaborator owns encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StatusReport {
    TaskFinished {
        key: TaskKey,
        nbytes: u64,
    },
    TaskErred {
        key: TaskKey,
        error: String,
    },
    /// Answer to a peer data request: payload-or-not-found per key.
    DataReply {
        request_id: String,
        peer: PeerAddr,
        found: HashMap<TaskKey, Bytes>,
        missing: Vec<TaskKey>,
    },
    /// Every known holder for these keys is blacklisted or gone.
    NeedHolders {
        keys: Vec<TaskKey>,
    },
    /// A key exceeded the fetch retry cap.
    FetchExhausted {
        key: TaskKey,
        attempts: u32,
    },
    /// A released key's value was dropped from this node.
    ReleaseConfirmed {
        key: TaskKey,
    },
    Closing,
}

/// Commands emitted by the state machine for collaborators to execute.
///
/// Order matters: an instruction freeing a budget precedes any instruction
/// that consumes the freed budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Instruction {
    /// Run a task on the executor with resolved inputs and its grant.
    ExecuteTask {
        key: TaskKey,
        run_spec: Value,
        inputs: HashMap<TaskKey, Bytes>,
        grant: ResourceGrant,
    },
    /// Open one connection to `peer` and request the batched keys.
    BeginFetch {
        peer: PeerAddr,
        keys: Vec<TaskKey>,
        estimated_bytes: u64,
    },
    /// Deliver a status payload.
    SendStatusUpdate { report: StatusReport },
    /// Refuse a peer request.
    RejectRequest {
        request_id: String,
        peer: PeerAddr,
        reason: String,
    },
    /// Tell the connection/executor pool a reservation was returned.
    FreeResources { scope: FreeScope },
}

impl Instruction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecuteTask { .. } => "execute-task",
            Self::BeginFetch { .. } => "begin-fetch",
            Self::SendStatusUpdate { .. } => "send-status-update",
            Self::RejectRequest { .. } => "reject-request",
            Self::FreeResources { .. } => "free-resources",
        }
    }
}
