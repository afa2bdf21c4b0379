use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WireboardError};

/// Any JSON value flowing along an edge.
pub type NodeValue = serde_json::Value;

/// Named values delivered to a node's input ports.
pub type InputValues = serde_json::Map<String, NodeValue>;

/// Named values produced on a node's output ports.
pub type OutputValues = serde_json::Map<String, NodeValue>;

/// Unique id of a node within one graph.
pub type NodeId = String;

/// Output key that forwards every produced value.
pub const STAR_PORT: &str = "*";

/// Output key carrying a routed handler failure.
pub const ERROR_PORT: &str = "$error";

/// Reserved node types intercepted before kit lookup.
pub mod reserved {
    pub const INPUT: &str = "input";
    pub const OUTPUT: &str = "output";
    pub const SECRETS: &str = "secrets";
}

/// A node in a board.
///
/// Immutable once the graph is loaded; `id` is unique within the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub configuration: InputValues,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<NodeValue>,
}

impl NodeDescriptor {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            configuration: InputValues::new(),
            metadata: None,
        }
    }

    /// Add a configuration value.
    pub fn with_config(mut self, key: impl Into<String>, value: NodeValue) -> Self {
        self.configuration.insert(key.into(), value);
        self
    }
}

/// A wire between two nodes.
///
/// An edge with neither `out` nor `in` is control-only: it triggers the
/// destination without carrying data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out: Option<String>,
    #[serde(rename = "in", default, skip_serializing_if = "Option::is_none")]
    pub in_port: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub constant: bool,
}

impl Edge {
    /// Data edge wiring output `out` of `from` into input `in_port` of `to`.
    pub fn wire(
        from: impl Into<String>,
        out: impl Into<String>,
        to: impl Into<String>,
        in_port: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            out: Some(out.into()),
            in_port: Some(in_port.into()),
            optional: false,
            constant: false,
        }
    }

    /// Edge forwarding every output of `from` to `to`.
    pub fn star(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            out: Some(STAR_PORT.to_string()),
            in_port: None,
            optional: false,
            constant: false,
        }
    }

    /// Dataless edge that only triggers `to`.
    pub fn control(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            out: None,
            in_port: None,
            optional: false,
            constant: false,
        }
    }

    /// Synthetic opportunity used to seed entry nodes.
    pub fn entry(to: impl Into<String>) -> Self {
        Self::control("$entry", to)
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn constant(mut self) -> Self {
        self.constant = true;
        self
    }

    pub fn is_star(&self) -> bool {
        self.out.as_deref() == Some(STAR_PORT)
    }

    pub fn is_control(&self) -> bool {
        self.out.is_none()
    }

    /// Input port this edge makes mandatory for its destination, if any.
    pub fn required_port(&self) -> Option<&str> {
        if self.optional || self.is_star() {
            return None;
        }
        self.in_port.as_deref().filter(|p| !p.is_empty())
    }
}

/// Discovery metadata about a kit referenced by a board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KitReference {
    pub url: String,
}

/// A serialized board.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeDescriptor>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kits: Vec<KitReference>,
}

impl GraphDescriptor {
    pub fn new(nodes: Vec<NodeDescriptor>, edges: Vec<Edge>) -> Self {
        Self {
            nodes,
            edges,
            ..Self::default()
        }
    }

    /// Parse a board from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Check node id uniqueness and that every edge endpoint exists.
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashSet<&str> = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(WireboardError::InvalidGraph(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }
        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !seen.contains(end.as_str()) {
                    return Err(WireboardError::InvalidGraph(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.from, edge.to, end
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&NodeDescriptor> {
        self.nodes.iter().find(|n| n.id == id)
    }
}
