// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
    pub mod limits;
}

// The worker coordination core
pub mod machine; // Task lifecycle state machine
pub mod fetch; // Remote dependency orchestration
pub mod node; // Node lifecycle and collaborator wiring

// Re-exports for convenience
pub use crate::core::config::{WorkerConfig, WorkerConfigBuilder};
pub use crate::core::errors::{GantryError, Result};
pub use crate::core::limits::{LedgerSnapshot, ResourceGrant, ResourceLedger};
pub use fetch::{FetchBatch, FetchDisposition, FetchOrchestrator};
pub use machine::{
    FreeScope, Instruction, LogEntry, NodeStatus, PeerAddr, Priority, StatusReport, Stimulus,
    StimulusId, StimulusLog, StimulusPayload, TaskEntity, TaskKey, TaskState, Violation,
    WorkerState,
};
pub use node::{Node, NodeHandle, PeerGateway, TaskRunner};
