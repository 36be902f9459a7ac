//! Connector implementations.

pub mod local;

pub use local::LocalConnector;
