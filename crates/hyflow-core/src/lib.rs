//! Workflow execution engine for hyflow.
//!
//! Turns a validated workflow graph into scheduled, checkpointed jobs on
//! heterogeneous deployments. Backends plug in through the [`connector`]
//! traits and durable storage through [`checkpoint::CheckpointStore`]; this
//! crate never touches a database or spawns processes itself.

pub mod checkpoint;
pub mod connector;
pub mod engine;
pub mod error;
pub mod event;
pub mod executor;
pub mod graph;
pub mod scheduler;
pub mod transfer;

pub use engine::Engine;
pub use error::EngineError;
