use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use switchyard_core::error::{FlowError, Result};
use switchyard_core::graph::{FlowDefinition, GraphEdge, NeutralNode};

/// Checks graph well-formedness and computes the execution order.
pub struct GraphValidator;

impl GraphValidator {
    /// Validate a flow definition and return its nodes in execution order.
    pub fn validate_flow(flow: &FlowDefinition) -> Result<Vec<&NeutralNode>> {
        Self::validate(&flow.nodes, &flow.edges, &flow.entry, &flow.exits)
    }

    /// Validate a graph and return every declared node in topological order.
    ///
    /// Checks, in order: duplicate ids, the entry, each exit, each edge
    /// endpoint, then acyclicity. The order uses Kahn's algorithm; among
    /// nodes that become ready together, the one declared first goes first,
    /// so the same graph always yields the same order. Nodes unreachable
    /// from the entry are still part of the order.
    pub fn validate<'a>(
        nodes: &'a [NeutralNode],
        edges: &[GraphEdge],
        entry: &str,
        exits: &[String],
    ) -> Result<Vec<&'a NeutralNode>> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.as_str(), i).is_some() {
                return Err(FlowError::DuplicateNode(node.id.clone()));
            }
        }

        let unknown = |location: &str, node_id: &str| FlowError::UnknownNodeReference {
            location: location.to_string(),
            node_id: node_id.to_string(),
        };

        if !index.contains_key(entry) {
            return Err(unknown("entry", entry));
        }
        for exit in exits {
            if !index.contains_key(exit.as_str()) {
                return Err(unknown("exits", exit));
            }
        }

        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        let mut in_degree = vec![0usize; nodes.len()];
        for edge in edges {
            let from = *index
                .get(edge.source.as_str())
                .ok_or_else(|| unknown("edge source", &edge.source))?;
            let to = *index
                .get(edge.target.as_str())
                .ok_or_else(|| unknown("edge target", &edge.target))?;
            successors[from].push(to);
            in_degree[to] += 1;
        }

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(nodes.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(&nodes[i]);
            for &next in &successors[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() < nodes.len() {
            let remaining = nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, n)| n.id.clone())
                .collect();
            return Err(FlowError::CycleDetected { nodes: remaining });
        }

        Ok(order)
    }
}

/// Ids of the nodes reachable from `entry` by following edges forward,
/// `entry` included.
pub fn reachable_from(edges: &[GraphEdge], entry: &str) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([entry.to_string()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        for edge in edges.iter().filter(|e| e.source == id) {
            queue.push_back(edge.target.clone());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> Vec<NeutralNode> {
        ids.iter().map(|id| NeutralNode::new(*id, id.to_uppercase())).collect()
    }

    fn ids(order: &[&NeutralNode]) -> Vec<String> {
        order.iter().map(|n| n.id.clone()).collect()
    }

    fn assert_edges_respected(order: &[&NeutralNode], edges: &[GraphEdge]) {
        let pos: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();
        for e in edges {
            assert!(
                pos[e.source.as_str()] < pos[e.target.as_str()],
                "edge {} -> {} out of order",
                e.source,
                e.target
            );
        }
    }

    #[test]
    fn test_linear_chain() {
        let ns = nodes(&["a", "b", "c"]);
        let edges = vec![GraphEdge::new("a", "b"), GraphEdge::new("b", "c")];
        let order = GraphValidator::validate(&ns, &edges, "a", &["c".into()]).unwrap();
        assert_eq!(ids(&order), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_order_follows_edges_not_declaration() {
        let ns = nodes(&["c", "b", "a"]);
        let edges = vec![GraphEdge::new("a", "b"), GraphEdge::new("b", "c")];
        let order = GraphValidator::validate(&ns, &edges, "a", &[]).unwrap();
        assert_eq!(ids(&order), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ties_resolve_by_declaration_order() {
        // Diamond: both branches become ready together after the root.
        let ns = nodes(&["root", "right", "left", "join"]);
        let edges = vec![
            GraphEdge::new("root", "left"),
            GraphEdge::new("root", "right"),
            GraphEdge::new("left", "join"),
            GraphEdge::new("right", "join"),
        ];
        let order = GraphValidator::validate(&ns, &edges, "root", &["join".into()]).unwrap();
        assert_eq!(ids(&order), vec!["root", "right", "left", "join"]);

        // Same graph twice gives the same order.
        let again = GraphValidator::validate(&ns, &edges, "root", &["join".into()]).unwrap();
        assert_eq!(ids(&order), ids(&again));
    }

    #[test]
    fn test_order_spans_unreachable_nodes() {
        let ns = nodes(&["a", "b", "orphan"]);
        let edges = vec![GraphEdge::new("a", "b")];
        let order = GraphValidator::validate(&ns, &edges, "a", &[]).unwrap();
        assert_eq!(order.len(), 3);
        assert!(ids(&order).contains(&"orphan".to_string()));
    }

    #[test]
    fn test_wide_dag_respects_every_edge() {
        let ns = nodes(&["f", "e", "d", "c", "b", "a"]);
        let edges = vec![
            GraphEdge::new("a", "c"),
            GraphEdge::new("a", "d"),
            GraphEdge::new("b", "d"),
            GraphEdge::new("c", "e"),
            GraphEdge::new("d", "e"),
            GraphEdge::new("e", "f"),
            GraphEdge::new("b", "f"),
        ];
        let order = GraphValidator::validate(&ns, &edges, "a", &["f".into()]).unwrap();
        assert_eq!(order.len(), 6);
        assert_edges_respected(&order, &edges);
    }

    #[test]
    fn test_cycle_detected_names_remaining_nodes() {
        let ns = nodes(&["a", "b", "c", "d"]);
        let edges = vec![
            GraphEdge::new("a", "b"),
            GraphEdge::new("b", "c"),
            GraphEdge::new("c", "b"),
            GraphEdge::new("c", "d"),
        ];
        let err = GraphValidator::validate(&ns, &edges, "a", &[]).unwrap_err();
        match err {
            FlowError::CycleDetected { nodes } => assert_eq!(nodes, vec!["b", "c", "d"]),
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let ns = nodes(&["a"]);
        let edges = vec![GraphEdge::new("a", "a")];
        assert!(matches!(
            GraphValidator::validate(&ns, &edges, "a", &[]),
            Err(FlowError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_unknown_entry() {
        let ns = nodes(&["a"]);
        let err = GraphValidator::validate(&ns, &[], "missing", &[]).unwrap_err();
        assert!(matches!(
            err,
            FlowError::UnknownNodeReference { ref location, ref node_id }
                if location == "entry" && node_id == "missing"
        ));
    }

    #[test]
    fn test_unknown_exit() {
        let ns = nodes(&["a"]);
        let err = GraphValidator::validate(&ns, &[], "a", &["z".into()]).unwrap_err();
        assert!(matches!(err, FlowError::UnknownNodeReference { ref location, .. } if location == "exits"));
    }

    #[test]
    fn test_unknown_edge_endpoints() {
        let ns = nodes(&["a", "b"]);
        let err = GraphValidator::validate(&ns, &[GraphEdge::new("a", "x")], "a", &[]).unwrap_err();
        assert!(matches!(err, FlowError::UnknownNodeReference { ref node_id, .. } if node_id == "x"));

        let err = GraphValidator::validate(&ns, &[GraphEdge::new("y", "b")], "a", &[]).unwrap_err();
        assert!(matches!(err, FlowError::UnknownNodeReference { ref node_id, .. } if node_id == "y"));
    }

    #[test]
    fn test_duplicate_node() {
        let ns = nodes(&["a", "a"]);
        assert!(matches!(
            GraphValidator::validate(&ns, &[], "a", &[]),
            Err(FlowError::DuplicateNode(ref id)) if id == "a"
        ));
    }

    #[test]
    fn test_reachable_from() {
        let edges = vec![
            GraphEdge::new("a", "b"),
            GraphEdge::new("b", "c"),
            GraphEdge::new("x", "c"),
        ];
        let reach = reachable_from(&edges, "a");
        assert!(reach.contains("a") && reach.contains("b") && reach.contains("c"));
        assert!(!reach.contains("x"));
    }
}
