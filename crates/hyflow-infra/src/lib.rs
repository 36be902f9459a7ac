//! Infrastructure layer for hyflow.
//!
//! Contains the IO-bound implementations behind the traits defined in
//! `hyflow-core`: the SQLite checkpoint store, the local process connector,
//! deployments and configuration loading, and the data directory layout.

pub mod config;
pub mod connector;
pub mod deployment;
pub mod filesystem;
pub mod sqlite;
