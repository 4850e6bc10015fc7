//! Cycle detection, run once before the daemon starts.

use super::{Graph, GraphError, NodeId, RuleId};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unseen,
    OnStack,
    Done,
}

struct Checker<'a> {
    graph: &'a Graph,
    nodes: Vec<Mark>,
    rules: Vec<Mark>,
}

/// Tri-colour DFS over every node. A back edge (reaching an on-stack entry)
/// is a cycle; the error names one node on it.
pub fn check_cycles(graph: &Graph) -> Result<(), GraphError> {
    let mut checker = Checker {
        graph,
        nodes: vec![Mark::Unseen; graph.node_ids().count()],
        rules: vec![Mark::Unseen; graph.rule_ids().count()],
    };
    for id in graph.node_ids() {
        checker.visit_node(id)?;
    }
    Ok(())
}

impl Checker<'_> {
    fn visit_node(&mut self, id: NodeId) -> Result<(), GraphError> {
        match self.nodes[id.0] {
            Mark::Done => return Ok(()),
            Mark::OnStack => {
                return Err(GraphError::Cycle {
                    node: self.graph.node(id).path().to_string(),
                });
            }
            Mark::Unseen => {}
        }
        self.nodes[id.0] = Mark::OnStack;
        if let Some(producer) = self.graph.node(id).producer() {
            self.visit_rule(producer)?;
        }
        self.nodes[id.0] = Mark::Done;
        Ok(())
    }

    fn visit_rule(&mut self, id: RuleId) -> Result<(), GraphError> {
        match self.rules[id.0] {
            Mark::Done => return Ok(()),
            Mark::OnStack => {
                let out = self.graph.rule(id).outputs()[0];
                return Err(GraphError::Cycle {
                    node: self.graph.node(out).path().to_string(),
                });
            }
            Mark::Unseen => {}
        }
        self.rules[id.0] = Mark::OnStack;
        for &input in self.graph.rule(id).inputs() {
            self.visit_node(input)?;
        }
        self.rules[id.0] = Mark::Done;
        Ok(())
    }
}
