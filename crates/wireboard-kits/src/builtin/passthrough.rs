use futures::future::BoxFuture;

use wireboard_core::error::Result;
use wireboard_core::traits::{NodeHandler, NodeHandlerContext};
use wireboard_core::types::{InputValues, OutputValues};

/// Emits its inputs unchanged.
pub struct PassthroughHandler;

impl NodeHandler for PassthroughHandler {
    fn invoke(
        &self,
        inputs: InputValues,
        _ctx: NodeHandlerContext,
    ) -> BoxFuture<'_, Result<OutputValues>> {
        Box::pin(async move { Ok(inputs) })
    }
}
