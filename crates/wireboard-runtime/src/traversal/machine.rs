use std::collections::{BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use wireboard_core::error::Result;
use wireboard_core::types::*;

use super::state::QueuedValueState;

/// Adjacency lookup built once per run.
#[derive(Debug, Clone)]
struct GraphIndex {
    nodes: HashMap<NodeId, NodeDescriptor>,
    /// Incoming edges per node.
    heads: HashMap<NodeId, Vec<Edge>>,
    /// Outgoing edges per node.
    tails: HashMap<NodeId, Vec<Edge>>,
    /// Nodes with no incoming edges, in declaration order.
    entries: Vec<NodeId>,
}

impl GraphIndex {
    fn build(graph: &GraphDescriptor) -> Result<Self> {
        graph.validate()?;
        let mut heads: HashMap<NodeId, Vec<Edge>> = HashMap::new();
        let mut tails: HashMap<NodeId, Vec<Edge>> = HashMap::new();
        for edge in &graph.edges {
            heads.entry(edge.to.clone()).or_default().push(edge.clone());
            tails.entry(edge.from.clone()).or_default().push(edge.clone());
        }
        let entries = graph
            .nodes
            .iter()
            .filter(|n| !heads.contains_key(&n.id))
            .map(|n| n.id.clone())
            .collect();
        let nodes = graph
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.clone()))
            .collect();
        Ok(Self {
            nodes,
            heads,
            tails,
            entries,
        })
    }

    fn heads(&self, id: &str) -> &[Edge] {
        self.heads.get(id).map_or(&[], Vec::as_slice)
    }

    fn tails(&self, id: &str) -> &[Edge] {
        self.tails.get(id).map_or(&[], Vec::as_slice)
    }
}

/// Whether the values `edge` delivered were already consumed by an earlier
/// firing of its destination.
///
/// Two edges from one producer into one node queue two opportunities; the
/// first firing takes both values and the second has nothing left to offer.
fn is_spent(edge: &Edge, available: &InputValues) -> bool {
    match edge.out.as_deref() {
        None => false,
        Some(STAR_PORT) => available.is_empty(),
        Some(_) => edge
            .in_port
            .as_deref()
            .filter(|p| !p.is_empty())
            .is_some_and(|port| !available.contains_key(port)),
    }
}

/// One node taken off the opportunity queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Firing {
    pub descriptor: NodeDescriptor,
    /// Configuration merged under the queued values.
    pub inputs: InputValues,
    /// Required ports still empty. Non-empty means the node was deferred.
    #[serde(default)]
    pub missing_inputs: Vec<String>,
}

impl Firing {
    pub fn is_ready(&self) -> bool {
        self.missing_inputs.is_empty()
    }

    pub fn node_id(&self) -> &str {
        &self.descriptor.id
    }
}

/// Resumable continuation of a traversal.
///
/// Holds the node about to run and everything needed to carry on from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraversalResult {
    pub descriptor: NodeDescriptor,
    pub inputs: InputValues,
    #[serde(default)]
    pub missing_inputs: Vec<String>,
    pub opportunities: VecDeque<Edge>,
    #[serde(default)]
    pub deferred: BTreeSet<NodeId>,
    pub state: QueuedValueState,
}

/// Opportunity-queue traversal over a board.
///
/// Firing is iterative: each completed node appends its outgoing edges to
/// the queue, so cycles never grow the call stack and a node may fire many
/// times in one run.
#[derive(Debug, Clone)]
pub struct TraversalMachine {
    graph: GraphIndex,
    state: QueuedValueState,
    opportunities: VecDeque<Edge>,
    deferred: BTreeSet<NodeId>,
    resumed: Option<Firing>,
}

impl TraversalMachine {
    /// Start a traversal seeded with the graph's entry nodes.
    pub fn new(graph: &GraphDescriptor) -> Result<Self> {
        let index = GraphIndex::build(graph)?;
        if index.entries.is_empty() && !index.nodes.is_empty() {
            warn!("Graph has no entry nodes; nothing will fire");
        }
        let opportunities = index.entries.iter().map(Edge::entry).collect();
        Ok(Self {
            graph: index,
            state: QueuedValueState::new(),
            opportunities,
            deferred: BTreeSet::new(),
            resumed: None,
        })
    }

    /// Continue from a snapshot. The snapshot's node is yielded first.
    pub fn resume(graph: &GraphDescriptor, result: TraversalResult) -> Result<Self> {
        let index = GraphIndex::build(graph)?;
        Ok(Self {
            graph: index,
            state: result.state,
            opportunities: result.opportunities,
            deferred: result.deferred,
            resumed: Some(Firing {
                descriptor: result.descriptor,
                inputs: result.inputs,
                missing_inputs: result.missing_inputs,
            }),
        })
    }

    /// Snapshot the traversal as of `firing`.
    pub fn snapshot(&self, firing: &Firing) -> TraversalResult {
        TraversalResult {
            descriptor: firing.descriptor.clone(),
            inputs: firing.inputs.clone(),
            missing_inputs: firing.missing_inputs.clone(),
            opportunities: self.opportunities.clone(),
            deferred: self.deferred.clone(),
            state: self.state.clone(),
        }
    }

    /// Take the next opportunity.
    ///
    /// A ready firing has already consumed its queued inputs. A deferred one
    /// leaves state untouched; a later arrival on one of its ports brings the
    /// node back.
    pub fn next_firing(&mut self) -> Option<Firing> {
        if let Some(firing) = self.resumed.take() {
            return Some(firing);
        }
        loop {
            let opportunity = self.opportunities.pop_front()?;
            let Some(descriptor) = self.graph.nodes.get(&opportunity.to) else {
                warn!(node_id = %opportunity.to, "Opportunity for unknown node dropped");
                continue;
            };

            let available = self.state.get_available_inputs(&descriptor.id);
            let mut inputs = descriptor.configuration.clone();
            inputs.extend(available.clone());
            let missing_inputs = self.missing_inputs(&descriptor.id, &inputs);

            if missing_inputs.is_empty() {
                self.state.use_inputs(&descriptor.id, &available);
                self.deferred.remove(&descriptor.id);
            } else if is_spent(&opportunity, &available) {
                debug!(node_id = %descriptor.id, "Dropping spent opportunity");
                continue;
            } else {
                debug!(node_id = %descriptor.id, missing = ?missing_inputs, "Deferring node");
                self.deferred.insert(descriptor.id.clone());
            }

            return Some(Firing {
                descriptor: descriptor.clone(),
                inputs,
                missing_inputs,
            });
        }
    }

    fn missing_inputs(&self, node_id: &str, inputs: &InputValues) -> Vec<String> {
        let mut missing: Vec<String> = Vec::new();
        for port in self.graph.heads(node_id).iter().filter_map(Edge::required_port) {
            if !inputs.contains_key(port) && !missing.iter().any(|m| m == port) {
                missing.push(port.to_string());
            }
        }
        missing
    }

    /// Record that `node_id` produced `outputs`.
    ///
    /// Outgoing edges become opportunities when they are control-only, `*`,
    /// or name an output that was produced. Returns the new opportunities.
    pub fn complete(&mut self, node_id: &str, outputs: &OutputValues) -> Vec<Edge> {
        let new_opportunities: Vec<Edge> = self
            .graph
            .tails(node_id)
            .iter()
            .filter(|edge| match edge.out.as_deref() {
                None | Some(STAR_PORT) => true,
                Some(out) => outputs.contains_key(out),
            })
            .cloned()
            .collect();
        self.state.wire_outputs(&new_opportunities, outputs);
        self.opportunities.extend(new_opportunities.iter().cloned());
        new_opportunities
    }

    /// Whether `node_id` has an outgoing `$error` edge.
    pub fn routes_errors(&self, node_id: &str) -> bool {
        self.graph
            .tails(node_id)
            .iter()
            .any(|e| e.out.as_deref() == Some(ERROR_PORT))
    }

    pub fn has_opportunities(&self) -> bool {
        self.resumed.is_some() || !self.opportunities.is_empty()
    }

    /// Deferred nodes whose required ports are still empty.
    pub fn stranded(&self) -> Vec<NodeId> {
        self.deferred
            .iter()
            .filter(|id| {
                let Some(descriptor) = self.graph.nodes.get(*id) else {
                    return false;
                };
                let mut inputs = descriptor.configuration.clone();
                inputs.extend(self.state.get_available_inputs(id));
                !self.missing_inputs(id, &inputs).is_empty()
            })
            .cloned()
            .collect()
    }

    pub fn state(&self) -> &QueuedValueState {
        &self.state
    }

    pub fn node(&self, id: &str) -> Option<&NodeDescriptor> {
        self.graph.nodes.get(id)
    }
}
