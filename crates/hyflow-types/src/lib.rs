//! Shared domain types for hyflow.
//!
//! This crate contains the data model the engine, the infrastructure layer and
//! the CLI agree on: workflow graphs, tokens, deployments, bindings, jobs,
//! checkpoint records, configuration and run reports.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod checkpoint;
pub mod config;
pub mod deployment;
pub mod error;
pub mod event;
pub mod execution;
pub mod report;
pub mod token;
pub mod workflow;
