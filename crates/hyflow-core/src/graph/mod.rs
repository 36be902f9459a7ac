//! Workflow graph model: definition parsing, DAG checks, ports, input
//! combinators and ordered joins.

pub mod combinator;
pub mod dag;
pub mod definition;
pub mod join;
pub mod port;

pub use combinator::{Blocked, Fire, InputCombinator};
pub use definition::{WorkflowError, load_workflow_file, parse_workflow_yaml, validate_definition};
pub use join::ReorderBuffer;
pub use port::PortState;
