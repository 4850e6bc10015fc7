//! The dependency graph of nodes and rules.
//!
//! - A `Node` is a file path. It is produced by at most one rule (its
//!   producer) and may feed any number of rules (its consumers). A node with
//!   no producer is a *source*; a node no rule consumes is a *root*.
//! - A `Rule` links input nodes to output nodes through a shell command. An
//!   empty command marks the rule *phony*: nothing is spawned and its outputs
//!   take the state of its inputs.
//!
//! Nodes and rules live in arenas and reference each other by id, so state
//! propagation walks indices rather than pointers.

pub mod check;
pub mod depfile;
pub mod parser;
pub mod printers;
pub mod scan;

use std::collections::HashMap;

use thiserror::Error;

/// Seconds since the epoch; 0 means "missing on disk".
pub type Timestamp = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleId(pub(crate) usize);

/// Whether the file on disk matches the expected output of its producer.
///
/// This is a per-entity property, not reachability: a node can be up-to-date
/// while one of its consumers is out-of-date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    UpToDate,
    OutOfDate,
}

#[derive(Debug)]
pub struct Node {
    path: String,
    producer: Option<RuleId>,
    consumers: Vec<RuleId>,
    state: NodeState,
    timestamp: Timestamp,
    previous_timestamp: Timestamp,
}

impl Node {
    fn new(path: String) -> Self {
        // Everything starts clean; the dependency scan dirties what it finds
        // stale, and propagation only ever moves clean entities to dirty.
        Self {
            path,
            producer: None,
            consumers: Vec::new(),
            state: NodeState::UpToDate,
            timestamp: 0,
            previous_timestamp: 0,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn producer(&self) -> Option<RuleId> {
        self.producer
    }

    pub fn consumers(&self) -> &[RuleId] {
        &self.consumers
    }

    pub fn is_source(&self) -> bool {
        self.producer.is_none()
    }

    pub fn is_root(&self) -> bool {
        self.consumers.is_empty()
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.state == NodeState::OutOfDate
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn previous_timestamp(&self) -> Timestamp {
        self.previous_timestamp
    }

    pub fn update_timestamp(&mut self, stamp: Timestamp) {
        self.previous_timestamp = self.timestamp;
        self.timestamp = stamp;
    }
}

#[derive(Debug)]
pub struct Rule {
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
    command: String,
    depfile: Option<String>,
    state: NodeState,
}

impl Rule {
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// Empty command: the rule succeeds without spawning anything.
    pub fn is_phony(&self) -> bool {
        self.command.is_empty()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn depfile(&self) -> Option<&str> {
        self.depfile.as_deref()
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.state == NodeState::OutOfDate
    }
}

#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    rules: Vec<Rule>,
    by_path: HashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find-or-create the node for `path`.
    pub fn node_id(&mut self, path: &str) -> NodeId {
        if let Some(&id) = self.by_path.get(path) {
            return id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(path.to_string()));
        self.by_path.insert(path.to_string(), id);
        id
    }

    pub fn lookup(&self, path: &str) -> Option<NodeId> {
        self.by_path.get(path).copied()
    }

    pub fn add_rule(
        &mut self,
        inputs: Vec<NodeId>,
        outputs: Vec<NodeId>,
        command: String,
        depfile: Option<String>,
    ) -> Result<RuleId, GraphError> {
        let id = RuleId(self.rules.len());
        for &out in &outputs {
            if inputs.contains(&out) {
                return Err(GraphError::SelfDependency {
                    path: self.nodes[out.0].path.clone(),
                });
            }
            if self.nodes[out.0].producer.is_some() {
                return Err(GraphError::DuplicateOutput {
                    path: self.nodes[out.0].path.clone(),
                });
            }
            self.nodes[out.0].producer = Some(id);
        }
        for &input in &inputs {
            self.nodes[input.0].consumers.push(id);
        }
        self.rules.push(Rule {
            inputs,
            outputs,
            command,
            depfile,
            state: NodeState::UpToDate,
        });
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.0]
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn rule_ids(&self) -> impl Iterator<Item = RuleId> + '_ {
        (0..self.rules.len()).map(RuleId)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn rules(&self) -> impl Iterator<Item = (RuleId, &Rule)> {
        self.rules.iter().enumerate().map(|(i, r)| (RuleId(i), r))
    }

    /// Nodes no rule consumes; the build starts from these.
    pub fn roots(&self) -> Vec<NodeId> {
        self.node_ids()
            .filter(|&id| self.nodes[id.0].is_root())
            .collect()
    }

    /// Nodes no rule produces.
    pub fn sources(&self) -> Vec<NodeId> {
        self.node_ids()
            .filter(|&id| self.nodes[id.0].is_source())
            .collect()
    }

    /// Mark `id` out-of-date and propagate: the producing rule becomes
    /// out-of-date (a rule is dirty iff any output is), every consuming rule
    /// becomes dirty, and through those rules' outputs the transitive
    /// parents. Idempotent; terminates because the graph is a DAG.
    pub fn mark_dirty(&mut self, id: NodeId) {
        if self.nodes[id.0].state == NodeState::OutOfDate {
            return;
        }
        self.nodes[id.0].state = NodeState::OutOfDate;
        if let Some(producer) = self.nodes[id.0].producer {
            self.rules[producer.0].state = NodeState::OutOfDate;
        }
        let consumers = self.nodes[id.0].consumers.clone();
        for rule in consumers {
            self.mark_rule_dirty(rule);
        }
    }

    pub fn mark_rule_dirty(&mut self, id: RuleId) {
        if self.rules[id.0].state == NodeState::OutOfDate {
            return;
        }
        self.rules[id.0].state = NodeState::OutOfDate;
        let outputs = self.rules[id.0].outputs.clone();
        for out in outputs {
            self.mark_dirty(out);
        }
    }

    /// Mark `id` up-to-date. The producing rule follows only once all of its
    /// sibling outputs are up-to-date.
    pub fn mark_up_to_date(&mut self, id: NodeId) {
        self.nodes[id.0].state = NodeState::UpToDate;
        if let Some(producer) = self.nodes[id.0].producer {
            let clean = self.rules[producer.0]
                .outputs
                .iter()
                .all(|&out| self.nodes[out.0].state == NodeState::UpToDate);
            if clean {
                self.rules[producer.0].state = NodeState::UpToDate;
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("dependency cycle through '{node}'")]
    Cycle { node: String },

    #[error("'{path}' is an output of more than one rule")]
    DuplicateOutput { path: String },

    #[error("rule #{rule} has no inputs")]
    InputNotFound { rule: usize },

    #[error("rule #{rule} has no outputs")]
    OutputNotFound { rule: usize },

    #[error("'{path}' is both an input and an output of the same rule")]
    SelfDependency { path: String },

    #[error("failed to read graph file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse graph file {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        source: serde_json::Error,
    },
}
