use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::*;

/// A run event as seen by the caller of a harness.
///
/// Serializes as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum RunEvent {
    GraphStart(GraphStartData),
    NodeStart(NodeStartData),
    Input(InputRequest),
    Secret(SecretRequest),
    Output(OutputData),
    NodeEnd(NodeEndData),
    GraphEnd(GraphEndData),
    Proxy(ProxyEventData),
    Error(ErrorData),
    End(EndData),
}

impl RunEvent {
    /// The wire name of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GraphStart(_) => "graphstart",
            Self::NodeStart(_) => "nodestart",
            Self::Input(_) => "input",
            Self::Secret(_) => "secret",
            Self::Output(_) => "output",
            Self::NodeEnd(_) => "nodeend",
            Self::GraphEnd(_) => "graphend",
            Self::Proxy(_) => "proxy",
            Self::Error(_) => "error",
            Self::End(_) => "end",
        }
    }

    /// Whether the event ends the run stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::End(_))
    }

    /// Whether progress past this event requires a reply.
    pub fn is_suspension(&self) -> bool {
        matches!(self, Self::Input(_) | Self::Secret(_) | Self::Proxy(_))
    }

    /// Whether the event is a diagnostics-only lifecycle event.
    pub fn is_diagnostic(&self) -> bool {
        matches!(
            self,
            Self::GraphStart(_) | Self::NodeStart(_) | Self::NodeEnd(_) | Self::GraphEnd(_)
        )
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorData {
            error: message.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn end() -> Self {
        Self::End(EndData {
            timestamp: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStartData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStartData {
    pub node: NodeDescriptor,
    pub inputs: InputValues,
    /// Monotonic firing number within the run.
    pub firing: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
    pub node: NodeDescriptor,
    pub input_arguments: InputArguments,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputArguments {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<NodeValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRequest {
    pub keys: Vec<String>,
    /// The `secrets` node asking, absent when the request comes from a
    /// proxy revealing tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputData {
    pub node: NodeDescriptor,
    pub outputs: OutputValues,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEndData {
    pub node: NodeDescriptor,
    pub inputs: InputValues,
    pub outputs: OutputValues,
    pub firing: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEndData {
    pub firings: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEventData {
    pub node: NodeDescriptor,
    pub inputs: InputValues,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndData {
    pub timestamp: DateTime<Utc>,
}
