use crate::error::ValidationError;
use crate::types::{FlowDefinition, NodeId};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// Dependency graph of a flow, with one edge `dep -> node` per dependency
#[derive(Debug, Clone)]
pub struct FlowDag {
    graph: DiGraph<NodeId, ()>,
    node_indices: HashMap<NodeId, NodeIndex>,
    order: Vec<NodeId>,
}

impl FlowDag {
    /// Build the graph and compute its topological order.
    ///
    /// Fails on an empty flow, duplicate node ids, a dependency on an unknown
    /// node, or a cycle, in that order.
    pub fn from_definition(flow: &FlowDefinition) -> Result<Self, ValidationError> {
        if flow.nodes.is_empty() {
            return Err(ValidationError::EmptyFlow);
        }

        let mut graph = DiGraph::new();
        let mut node_indices = HashMap::new();

        for node in &flow.nodes {
            if node_indices.contains_key(&node.id) {
                return Err(ValidationError::DuplicateNode(node.id.clone()));
            }
            let idx = graph.add_node(node.id.clone());
            node_indices.insert(node.id.clone(), idx);
        }

        for node in &flow.nodes {
            let node_idx = node_indices[&node.id];
            for dep in &node.depends_on {
                let dep_idx = node_indices.get(dep).ok_or_else(|| {
                    ValidationError::UnknownDependency {
                        node: node.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;

                graph.add_edge(*dep_idx, node_idx, ());
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| ValidationError::CycleDetected {
            node: graph[cycle.node_id()].clone(),
        })?;
        let order = sorted.into_iter().map(|idx| graph[idx].clone()).collect();

        Ok(Self {
            graph,
            node_indices,
            order,
        })
    }

    /// Node ids in topological order (dependencies first)
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.node_indices.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Direct dependencies of a node (one entry per edge)
    pub fn dependencies(&self, node_id: &NodeId) -> Vec<NodeId> {
        self.neighbors(node_id, Direction::Incoming)
    }

    /// Nodes that directly depend on the given node (one entry per edge)
    pub fn dependents(&self, node_id: &NodeId) -> Vec<NodeId> {
        self.neighbors(node_id, Direction::Outgoing)
    }

    /// Number of incoming edges per node
    pub fn in_degrees(&self) -> HashMap<NodeId, usize> {
        self.node_indices
            .iter()
            .map(|(id, &idx)| {
                let degree = self
                    .graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count();
                (id.clone(), degree)
            })
            .collect()
    }

    /// Nodes with no dependencies, in topological order
    pub fn entry_nodes(&self) -> Vec<NodeId> {
        self.order
            .iter()
            .filter(|id| {
                self.graph
                    .neighbors_directed(self.node_indices[*id], Direction::Incoming)
                    .next()
                    .is_none()
            })
            .cloned()
            .collect()
    }

    fn neighbors(&self, node_id: &NodeId, direction: Direction) -> Vec<NodeId> {
        match self.node_indices.get(node_id) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, direction)
                .map(|n| self.graph[n].clone())
                .collect(),
            None => Vec::new(),
        }
    }
}
