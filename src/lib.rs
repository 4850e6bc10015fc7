pub mod build;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod graph;
pub mod stream;
pub mod subprocess;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::build::BuildResult;
pub use crate::graph::{Graph, GraphError, Node, NodeId, NodeState, Rule, RuleId};
pub use crate::subprocess::ExitStatus;
