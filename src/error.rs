use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DbError;
use crate::graph::GraphError;

/// Crate-level convenience error.
///
/// A thin wrapper over the per-subsystem errors; nothing in the daemon
/// matches on this directly, it exists so `falcon::Result` reads well at the
/// launcher boundary.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
