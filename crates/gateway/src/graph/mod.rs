//! The compiled deployment topology: an immutable DAG between the `start`
//! and `end` sentinels, with per-node filter conditions, call metadata,
//! and fan-in reduction policy.

use crate::{Error, GatewayConfig, Result};
use std::collections::{HashMap, VecDeque};

mod condition;
pub use condition::Condition;

mod reduce;
pub use reduce::reduce;

/// Name of the synthetic source node.
pub const START: &str = "start";
/// Name of the synthetic sink node.
pub const END: &str = "end";

pub type NodeId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Start,
    Exec,
    End,
}

#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    /// Incoming edges, in insertion order. This order is the tie-breaker
    /// of the fan-in merge.
    pub preds: Vec<NodeId>,
    /// Outgoing edges, in insertion order.
    pub succs: Vec<NodeId>,
    /// Documents entering this node must match, or they are withheld.
    pub condition: Option<Condition>,
    /// Attached as call metadata on every dispatch to this deployment.
    pub metadata: HashMap<String, String>,
    /// Concatenate fan-in inputs rather than merging by id.
    pub no_reduce: bool,
    /// A floating node has no path to `end`: it is dispatched for side
    /// effects and never awaited on the response path.
    pub floating: bool,
    /// Topological rank, used to order surfaced errors.
    pub rank: usize,
}

#[derive(Debug)]
pub struct Topology {
    nodes: Vec<Node>,
    start: NodeId,
    end: NodeId,
    // Executable nodes grouped by depth: all predecessors of a node in
    // layer N are in layers < N.
    layers: Vec<Vec<NodeId>>,
}

impl Topology {
    /// Compile and validate the topology of `config`.
    pub fn build(config: &GatewayConfig) -> Result<Self> {
        let mut builder = Builder::default();
        let start = builder.intern(START);
        let end = builder.intern(END);

        for (source, targets) in &config.graph {
            if source == END && !targets.is_empty() {
                return Err(Error::Graph(
                    "'end' must not have outgoing edges".to_string(),
                ));
            }
            let from = builder.intern(source);
            for target in targets {
                if target == START {
                    return Err(Error::Graph(
                        "'start' must not have incoming edges".to_string(),
                    ));
                }
                let to = builder.intern(target);
                if builder.nodes[from].succs.contains(&to) {
                    return Err(Error::Graph(format!(
                        "duplicate edge '{source}' -> '{target}'"
                    )));
                }
                builder.nodes[from].succs.push(to);
                builder.nodes[to].preds.push(from);
            }
        }

        if builder.nodes[start].succs.is_empty() {
            return Err(Error::Graph("'start' has no outgoing edges".to_string()));
        }

        for (name, condition) in &config.graph_conditions {
            let id = builder.exec_node(name, "graph_conditions")?;
            builder.nodes[id].condition = Some(Condition::parse(condition)?);
        }
        for (name, metadata) in &config.deployments_metadata {
            let id = builder.exec_node(name, "deployments_metadata")?;
            builder.nodes[id].metadata = metadata.clone();
        }
        for name in &config.deployments_no_reduce {
            let id = builder.exec_node(name, "deployments_no_reduce")?;
            builder.nodes[id].no_reduce = true;
        }

        builder.finish(start, end)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn start(&self) -> NodeId {
        self.start
    }

    pub fn end(&self) -> NodeId {
        self.end
    }

    pub fn layers(&self) -> &[Vec<NodeId>] {
        &self.layers
    }

    /// Names of all executor deployments of the topology.
    pub fn deployments(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Exec)
            .map(|n| n.name.as_str())
    }
}

#[derive(Default)]
struct Builder {
    nodes: Vec<Node>,
    by_name: HashMap<String, NodeId>,
}

impl Builder {
    fn intern(&mut self, name: &str) -> NodeId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let kind = match name {
            START => NodeKind::Start,
            END => NodeKind::End,
            _ => NodeKind::Exec,
        };
        let id = self.nodes.len();
        self.nodes.push(Node {
            name: name.to_string(),
            kind,
            preds: Vec::new(),
            succs: Vec::new(),
            condition: None,
            metadata: HashMap::new(),
            no_reduce: false,
            floating: false,
            rank: 0,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    // Resolve `name` to an existing executor node, for the parallel
    // configuration maps.
    fn exec_node(&self, name: &str, section: &str) -> Result<NodeId> {
        match self.by_name.get(name) {
            Some(&id) if self.nodes[id].kind == NodeKind::Exec => Ok(id),
            Some(_) => Err(Error::Graph(format!(
                "{section} must not reference the '{name}' sentinel"
            ))),
            None => Err(Error::Graph(format!("unknown node '{name}' in {section}"))),
        }
    }

    fn finish(mut self, start: NodeId, end: NodeId) -> Result<Topology> {
        let count = self.nodes.len();

        // Kahn's algorithm: assigns ranks and depths, and detects cycles.
        let mut indegree: Vec<usize> = self.nodes.iter().map(|n| n.preds.len()).collect();
        let mut depth = vec![0usize; count];
        let mut queue: VecDeque<NodeId> =
            (0..count).filter(|&id| indegree[id] == 0).collect();
        let mut processed = 0;

        while let Some(id) = queue.pop_front() {
            self.nodes[id].rank = processed;
            processed += 1;
            for k in 0..self.nodes[id].succs.len() {
                let succ = self.nodes[id].succs[k];
                depth[succ] = depth[succ].max(depth[id] + 1);
                indegree[succ] -= 1;
                if indegree[succ] == 0 {
                    queue.push_back(succ);
                }
            }
        }
        if processed < count {
            return Err(Error::Graph("topology contains a cycle".to_string()));
        }

        let from_start = self.reachable(start, |node| &node.succs);
        let to_end = self.reachable(end, |node| &node.preds);

        for (id, node) in self.nodes.iter_mut().enumerate() {
            if node.kind != NodeKind::Exec {
                continue;
            }
            node.floating = !to_end[id];
            if to_end[id] && !from_start[id] {
                return Err(Error::Graph(format!(
                    "node '{}' is not reachable from 'start'",
                    node.name
                )));
            }
        }

        // Group executable nodes into depth layers. Depth-zero executor
        // nodes are unreachable and can never receive input: leave them out.
        let max_depth = depth.iter().copied().max().unwrap_or(0);
        let mut layers = vec![Vec::new(); max_depth];
        for (id, node) in self.nodes.iter().enumerate() {
            if node.kind == NodeKind::Exec && depth[id] > 0 {
                layers[depth[id] - 1].push(id);
            }
        }
        layers.retain(|layer| !layer.is_empty());

        Ok(Topology {
            nodes: self.nodes,
            start,
            end,
            layers,
        })
    }

    fn reachable(&self, from: NodeId, edges: impl Fn(&Node) -> &Vec<NodeId>) -> Vec<bool> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![from];
        seen[from] = true;
        while let Some(id) = stack.pop() {
            for &next in edges(&self.nodes[id]) {
                if !seen[next] {
                    seen[next] = true;
                    stack.push(next);
                }
            }
        }
        seen
    }
}
