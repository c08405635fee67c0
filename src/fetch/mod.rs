pub mod orchestrator;

pub use orchestrator::{FetchBatch, FetchDisposition, FetchOrchestrator};
