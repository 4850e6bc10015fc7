//! Build orchestration.
//!
//! [`GraphBuilder`] is the capability surface the daemon drives: start,
//! interrupt, wait, result. Today there is one implementation, the
//! sequential builder; the enum leaves room for a parallel one without
//! committing the daemon to a trait object.

pub mod sequential;

pub use sequential::SequentialBuilder;

/// Overall outcome of one build.
///
/// Aggregation is by severity: `Interrupted` wins over `Failed` wins over
/// `Succeeded`; the first non-success latches and later rules do not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildResult {
    Unknown,
    Succeeded,
    Interrupted,
    Failed,
}

impl BuildResult {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildResult::Unknown => "UNKNOWN",
            BuildResult::Succeeded => "SUCCEEDED",
            BuildResult::Interrupted => "INTERRUPTED",
            BuildResult::Failed => "FAILED",
        }
    }
}

/// Tagged builder variants, exposing the capability set the daemon needs.
pub enum GraphBuilder {
    Sequential(SequentialBuilder),
}

impl GraphBuilder {
    pub fn interrupt(&self) {
        match self {
            GraphBuilder::Sequential(builder) => builder.interrupt(),
        }
    }

    /// Block until the running build completes.
    pub fn wait(&mut self) {
        match self {
            GraphBuilder::Sequential(builder) => builder.wait(),
        }
    }

    pub fn result(&self) -> BuildResult {
        match self {
            GraphBuilder::Sequential(builder) => builder.result(),
        }
    }
}
