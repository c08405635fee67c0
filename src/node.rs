//! Top-level node lifecycle: owns the state machine, feeds it stimuli from a
//! single inbound channel, and hands instructions to the executor and
//! network collaborators. Collaborator work runs concurrently, but it never
//! touches the state machine directly; outcomes come back as new stimuli
//! through the same channel, which is what keeps stimulus processing
//! single-threaded and totally ordered.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::core::config::WorkerConfig;
use crate::core::errors::Result;
use crate::core::limits::ResourceGrant;
use crate::machine::stimulus::{
    FreeScope, Instruction, StatusReport, Stimulus, StimulusPayload,
};
use crate::machine::task::TaskKey;
use crate::machine::worker::WorkerState;

/// Executor collaborator: runs one task under its resource grant and
/// reports exactly one outcome. A task that spawns sub-work can secede from
/// its compute slot through the handle and keep running.
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn run(
        &self,
        key: &str,
        run_spec: Value,
        inputs: HashMap<TaskKey, Bytes>,
        grant: ResourceGrant,
        handle: NodeHandle,
    ) -> anyhow::Result<Bytes>;
}

/// Network collaborator: owns connections, serialization and transport.
/// The core never sees bytes on the wire, only these calls.
#[async_trait]
pub trait PeerGateway: Send + Sync + 'static {
    /// Fetch a batch of keys from one peer.
    async fn gather(&self, peer: &str, keys: &[TaskKey]) -> anyhow::Result<HashMap<TaskKey, Bytes>>;

    /// Deliver a status payload to the coordinator or a requesting peer.
    async fn deliver(&self, report: StatusReport) -> anyhow::Result<()>;

    /// Refuse a peer request.
    async fn reject(&self, request_id: &str, peer: &str, reason: &str) -> anyhow::Result<()>;

    /// A budget reservation was returned; connection pools may recycle.
    async fn free_resources(&self, _scope: &FreeScope) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Cloneable sender half of the node's stimulus channel. External layers
/// (coordinator transport, timer collaborators) and executing tasks inject
/// stimuli through this.
#[derive(Clone)]
pub struct NodeHandle {
    tx: mpsc::UnboundedSender<Stimulus>,
}

impl NodeHandle {
    pub fn inject(&self, payload: StimulusPayload) -> Result<()> {
        self.tx.send(Stimulus::new(payload))?;
        Ok(())
    }

    pub fn secede(&self, key: impl Into<TaskKey>) -> Result<()> {
        self.inject(StimulusPayload::Secede { key: key.into() })
    }

    pub fn release(&self, key: impl Into<TaskKey>) -> Result<()> {
        self.inject(StimulusPayload::ReleaseKey { key: key.into() })
    }

    pub fn pause(&self) -> Result<()> {
        self.inject(StimulusPayload::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.inject(StimulusPayload::Resume)
    }

    pub fn close(&self) -> Result<()> {
        self.inject(StimulusPayload::Close)
    }
}

/// The worker node: state machine core plus collaborator wiring.
pub struct Node {
    state: WorkerState,
    rx: mpsc::UnboundedReceiver<Stimulus>,
    handle: NodeHandle,
    runner: Arc<dyn TaskRunner>,
    gateway: Arc<dyn PeerGateway>,
}

impl Node {
    pub fn new(
        config: WorkerConfig,
        runner: Arc<dyn TaskRunner>,
        gateway: Arc<dyn PeerGateway>,
    ) -> Result<Self> {
        let state = WorkerState::new(config)?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            state,
            rx,
            handle: NodeHandle { tx },
            runner,
            gateway,
        })
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Run until the close stimulus is processed or the channel dies.
    ///
    /// Stimuli are handled one at a time to completion in the recv arm;
    /// collaborator futures make progress in the other arm and communicate
    /// back only by sending stimuli.
    pub async fn run(mut self) -> Result<()> {
        let mut ops: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
        info!("node running");
        loop {
            tokio::select! {
                received = self.rx.recv() => {
                    let Some(stimulus) = received else { break };
                    let closing = matches!(stimulus.payload, StimulusPayload::Close);
                    match self.state.handle_stimulus(stimulus) {
                        Ok(instructions) => {
                            for instruction in instructions {
                                self.dispatch(instruction, &mut ops);
                            }
                        }
                        Err(err) if err.is_recoverable() => {
                            warn!(error = %err, "recoverable fault, stimulus dropped");
                        }
                        Err(err) => {
                            error!(error = %err, category = err.category(), "fatal fault");
                            return Err(err);
                        }
                    }
                    if closing {
                        break;
                    }
                }
                Some(()) = ops.next(), if !ops.is_empty() => {}
            }
        }
        // Let outstanding collaborator calls settle; their stimuli have
        // nowhere to go and that is fine, outcomes were already discarded.
        while ops.next().await.is_some() {}
        info!("node closed");
        Ok(())
    }

    fn dispatch(&self, instruction: Instruction, ops: &mut FuturesUnordered<BoxFuture<'static, ()>>) {
        match instruction {
            Instruction::ExecuteTask {
                key,
                run_spec,
                inputs,
                grant,
            } => {
                let runner = Arc::clone(&self.runner);
                let handle = self.handle.clone();
                ops.push(Box::pin(async move {
                    let outcome = runner
                        .run(&key, run_spec, inputs, grant, handle.clone())
                        .await;
                    let payload = match outcome {
                        Ok(value) => StimulusPayload::ExecuteOk { key, value },
                        Err(err) => StimulusPayload::ExecuteErr {
                            key,
                            error: format!("{err:#}"),
                        },
                    };
                    if handle.inject(payload).is_err() {
                        warn!("execution outcome arrived after shutdown");
                    }
                }));
            }
            Instruction::BeginFetch {
                peer,
                keys,
                estimated_bytes: _,
            } => {
                let gateway = Arc::clone(&self.gateway);
                let handle = self.handle.clone();
                ops.push(Box::pin(async move {
                    let payload = match gateway.gather(&peer, &keys).await {
                        Ok(data) => StimulusPayload::GatherOk { peer, data },
                        Err(err) => StimulusPayload::GatherErr {
                            peer,
                            keys,
                            reason: format!("{err:#}"),
                        },
                    };
                    if handle.inject(payload).is_err() {
                        warn!("gather outcome arrived after shutdown");
                    }
                }));
            }
            Instruction::SendStatusUpdate { report } => {
                let gateway = Arc::clone(&self.gateway);
                ops.push(Box::pin(async move {
                    if let Err(err) = gateway.deliver(report).await {
                        error!(error = %err, "failed to deliver status update");
                    }
                }));
            }
            Instruction::RejectRequest {
                request_id,
                peer,
                reason,
            } => {
                let gateway = Arc::clone(&self.gateway);
                ops.push(Box::pin(async move {
                    if let Err(err) = gateway.reject(&request_id, &peer, &reason).await {
                        warn!(error = %err, "failed to reject peer request");
                    }
                }));
            }
            Instruction::FreeResources { scope } => {
                let gateway = Arc::clone(&self.gateway);
                ops.push(Box::pin(async move {
                    if let Err(err) = gateway.free_resources(&scope).await {
                        warn!(error = %err, "free-resources notification failed");
                    }
                }));
            }
        }
    }
}
