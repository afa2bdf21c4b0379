use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::*;

/// Input and output schemas reported by [`NodeHandler::describe`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescription {
    pub input_schema: NodeValue,
    pub output_schema: NodeValue,
}

impl NodeDescription {
    /// Open schemas accepting any properties.
    pub fn open() -> Self {
        let open = serde_json::json!({ "type": "object", "additionalProperties": true });
        Self {
            input_schema: open.clone(),
            output_schema: open,
        }
    }
}

/// Context passed to a handler for one firing.
#[derive(Debug, Clone)]
pub struct NodeHandlerContext {
    /// The node being fired.
    pub descriptor: NodeDescriptor,
    /// URL of the board the node belongs to, used to resolve relative paths.
    pub base: Option<String>,
    /// Identifier of the harness session the firing belongs to.
    pub run_id: String,
    /// Cooperative cancellation signal for the whole run.
    pub cancel: CancellationToken,
}

impl NodeHandlerContext {
    pub fn new(descriptor: NodeDescriptor) -> Self {
        Self {
            descriptor,
            base: None,
            run_id: String::new(),
            cancel: CancellationToken::new(),
        }
    }
}

/// The behavior behind one node type.
pub trait NodeHandler: Send + Sync + 'static {
    /// Run the node with resolved inputs.
    fn invoke(
        &self,
        inputs: InputValues,
        ctx: NodeHandlerContext,
    ) -> BoxFuture<'_, Result<OutputValues>>;

    /// Report the node's schemas, optionally specialised to known inputs.
    fn describe(&self, inputs: Option<&InputValues>) -> BoxFuture<'_, Result<NodeDescription>> {
        let _ = inputs;
        Box::pin(async { Ok(NodeDescription::open()) })
    }

    /// Timeout in seconds for one invocation, overriding the run default.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }
}

/// Resolves a board URL into a descriptor.
pub trait GraphLoader: Send + Sync + 'static {
    fn load(&self, url: &str) -> BoxFuture<'_, Result<GraphDescriptor>>;
}
