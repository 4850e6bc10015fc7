//! Graph file parser.
//!
//! The graph file is a JSON document listing rules:
//!
//! ```json
//! {
//!   "rules": [
//!     { "inputs": ["a.c"], "outputs": ["a.o"], "cmd": "cc -c a.c -o a.o" },
//!     { "inputs": ["a.o"], "outputs": ["prog"], "cmd": "cc -o prog a.o",
//!       "depfile": "prog.d" }
//!   ]
//! }
//! ```
//!
//! Nodes are created implicitly from the paths; a path produced by no rule
//! is a source. An empty `cmd` makes the rule phony.

use std::path::Path;

use serde::Deserialize;

use super::{Graph, GraphError};

#[derive(Debug, Deserialize)]
struct GraphDoc {
    #[serde(default)]
    rules: Vec<RuleDoc>,
}

#[derive(Debug, Deserialize)]
struct RuleDoc {
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default)]
    cmd: String,
    #[serde(default)]
    depfile: Option<String>,
}

pub fn parse_file(path: &Path) -> Result<Graph, GraphError> {
    let contents = std::fs::read_to_string(path).map_err(|source| GraphError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_str(&contents).map_err(|err| match err {
        GraphError::Parse { source, .. } => GraphError::Parse {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

pub fn parse_str(contents: &str) -> Result<Graph, GraphError> {
    let doc: GraphDoc = serde_json::from_str(contents).map_err(|source| GraphError::Parse {
        path: std::path::PathBuf::new(),
        source,
    })?;

    let mut graph = Graph::new();
    for (index, rule) in doc.rules.into_iter().enumerate() {
        if rule.inputs.is_empty() {
            return Err(GraphError::InputNotFound { rule: index });
        }
        if rule.outputs.is_empty() {
            return Err(GraphError::OutputNotFound { rule: index });
        }
        let inputs = rule
            .inputs
            .iter()
            .map(|path| graph.node_id(path))
            .collect::<Vec<_>>();
        let outputs = rule
            .outputs
            .iter()
            .map(|path| graph.node_id(path))
            .collect::<Vec<_>>();
        graph.add_rule(inputs, outputs, rule.cmd, rule.depfile)?;
    }
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::check::check_cycles;

    const SAMPLE: &str = r#"{
        "rules": [
            { "inputs": ["a.c"], "outputs": ["a.o"], "cmd": "cc -c a.c -o a.o" },
            { "inputs": ["b.c"], "outputs": ["b.o"], "cmd": "cc -c b.c -o b.o",
              "depfile": "b.d" },
            { "inputs": ["a.o", "b.o"], "outputs": ["prog"], "cmd": "cc -o prog a.o b.o" },
            { "inputs": ["prog"], "outputs": ["all"], "cmd": "" }
        ]
    }"#;

    #[test]
    fn parses_the_sample_graph() {
        let graph = parse_str(SAMPLE).unwrap();
        assert_eq!(graph.rule_ids().count(), 4);
        assert_eq!(graph.node_ids().count(), 6);

        let a_c = graph.lookup("a.c").unwrap();
        assert!(graph.node(a_c).is_source());
        let all = graph.lookup("all").unwrap();
        assert!(graph.node(all).is_root());

        let phony = graph.node(all).producer().unwrap();
        assert!(graph.rule(phony).is_phony());

        let b_o = graph.lookup("b.o").unwrap();
        let compile_b = graph.node(b_o).producer().unwrap();
        assert_eq!(graph.rule(compile_b).depfile(), Some("b.d"));

        assert!(check_cycles(&graph).is_ok());
    }

    #[test]
    fn rejects_duplicate_outputs() {
        let doc = r#"{ "rules": [
            { "inputs": ["a"], "outputs": ["out"], "cmd": "one" },
            { "inputs": ["b"], "outputs": ["out"], "cmd": "two" }
        ]}"#;
        assert!(matches!(
            parse_str(doc),
            Err(GraphError::DuplicateOutput { path }) if path == "out"
        ));
    }

    #[test]
    fn rejects_a_rule_with_no_inputs() {
        let doc = r#"{ "rules": [ { "outputs": ["out"], "cmd": "gen" } ] }"#;
        assert!(matches!(
            parse_str(doc),
            Err(GraphError::InputNotFound { rule: 0 })
        ));
    }

    #[test]
    fn rejects_a_rule_with_no_outputs() {
        let doc = r#"{ "rules": [ { "inputs": ["a"], "cmd": "consume" } ] }"#;
        assert!(matches!(
            parse_str(doc),
            Err(GraphError::OutputNotFound { rule: 0 })
        ));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            parse_str("{ not json"),
            Err(GraphError::Parse { .. })
        ));
    }
}
