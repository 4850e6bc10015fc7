//! Graph dumps in DOT and Makefile formats.
//!
//! Plain functions onto a byte sink; the RPC surface renders into a string
//! and the `--module` launcher flag renders to stdout.

use std::io::Write;

use super::{Graph, NodeState};

fn colour(state: NodeState) -> &'static str {
    match state {
        NodeState::OutOfDate => "red",
        NodeState::UpToDate => "black",
    }
}

/// Graphviz rendition: file nodes are boxes, rules are points, everything
/// out-of-date in red.
pub fn write_graphviz(graph: &Graph, out: &mut dyn Write) -> std::io::Result<()> {
    writeln!(out, "digraph falcon {{")?;
    writeln!(out, "rankdir=\"LR\"")?;
    writeln!(out, "edge [fontsize=10, arrowhead=vee]")?;
    writeln!(out, "node [fontsize=10, shape=box, height=0.25]")?;

    for (id, node) in graph.nodes() {
        writeln!(
            out,
            "\"n{}\" [label=\"{}\" color=\"{}\"]",
            id.0,
            node.path(),
            colour(node.state()),
        )?;
    }

    for (id, rule) in graph.rules() {
        let c = colour(rule.state());
        writeln!(
            out,
            "\"r{}\" [label=\"rule\" shape=point color=\"{c}\"]",
            id.0
        )?;
        for &input in rule.inputs() {
            writeln!(out, "\"n{}\" -> \"r{}\" [color=\"{c}\"]", input.0, id.0)?;
        }
        for &output in rule.outputs() {
            writeln!(out, "\"r{}\" -> \"n{}\" [color=\"{c}\"]", id.0, output.0)?;
        }
    }

    writeln!(out, "}}")
}

/// Makefile rendition: one `outputs: inputs` stanza per rule.
pub fn write_makefile(graph: &Graph, out: &mut dyn Write) -> std::io::Result<()> {
    for (_, rule) in graph.rules() {
        for &output in rule.outputs() {
            write!(out, "{} ", graph.node(output).path())?;
        }
        write!(out, ": ")?;
        for &input in rule.inputs() {
            write!(out, "{} ", graph.node(input).path())?;
        }
        writeln!(out)?;
        writeln!(out, "\t{}", rule.command())?;
    }
    Ok(())
}

pub fn graphviz_string(graph: &Graph) -> String {
    let mut buf = Vec::new();
    // Writes to a Vec cannot fail.
    let _ = write_graphviz(graph, &mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}
