//! Persisted build records.
//!
//! Falcon stores what it knew at the end of the previous build — per-rule
//! command lines and completion timestamps, plus source file timestamps —
//! under `.falcon/state.json` in the working directory. The dependency scan
//! compares the world on disk against these records to seed the dirty set.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{Graph, Timestamp};

/// What a rule looked like when it last ran to completion. Records are keyed
/// by the rule's first output path, which the graph guarantees is unique.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleRecord {
    pub command: String,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildRecords {
    #[serde(default)]
    pub sources: HashMap<String, Timestamp>,
    #[serde(default)]
    pub rules: HashMap<String, RuleRecord>,
}

impl BuildRecords {
    /// Load records from `path`; a missing file is an empty record set
    /// (first run), any other failure is an error.
    pub fn load(path: &Path) -> Result<Self, DbError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(DbError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&contents).map_err(|source| DbError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn store(&self, path: &Path) -> Result<(), DbError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| DbError::Write {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let contents = serde_json::to_vec_pretty(self).map_err(|source| DbError::Encode {
            source,
        })?;
        std::fs::write(path, contents).map_err(|source| DbError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn rule_record(&self, first_output: &str) -> Option<&RuleRecord> {
        self.rules.get(first_output)
    }

    pub fn source_timestamp(&self, path: &str) -> Option<Timestamp> {
        self.sources.get(path).copied()
    }

    /// Snapshot the graph after a build: every rule's command and the newest
    /// timestamp among its outputs, and every source's current timestamp.
    pub fn snapshot(graph: &Graph) -> Self {
        let mut records = Self::default();
        for (_, rule) in graph.rules() {
            let first_output = graph.node(rule.outputs()[0]).path().to_string();
            let timestamp = rule
                .outputs()
                .iter()
                .map(|&out| graph.node(out).timestamp())
                .max()
                .unwrap_or(0);
            records.rules.insert(
                first_output,
                RuleRecord {
                    command: rule.command().to_string(),
                    timestamp,
                },
            );
        }
        for (_, node) in graph.nodes() {
            if node.is_source() {
                records
                    .sources
                    .insert(node.path().to_string(), node.timestamp());
            }
        }
        records
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse state file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode state file: {source}")]
    Encode { source: serde_json::Error },

    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}
