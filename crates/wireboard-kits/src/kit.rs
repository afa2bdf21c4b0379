use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use wireboard_core::error::{Result, WireboardError};
use wireboard_core::traits::{NodeDescription, NodeHandler, NodeHandlerContext};
use wireboard_core::types::{InputValues, OutputValues};

/// A named bundle of node handlers.
///
/// `url`, `title`, `tags` and friends are discovery metadata only; they have
/// no effect on traversal.
#[derive(Clone, Default)]
pub struct Kit {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub tags: Vec<String>,
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl Kit {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Register a handler, replacing any earlier one for the same type
    /// within this kit.
    pub fn register(&mut self, node_type: impl Into<String>, handler: impl NodeHandler) {
        self.handlers.insert(node_type.into(), Arc::new(handler));
    }

    pub fn with_handler(mut self, node_type: impl Into<String>, handler: impl NodeHandler) -> Self {
        self.register(node_type, handler);
        self
    }

    pub fn handler(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(node_type).cloned()
    }

    pub fn provides(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    /// Node types handled by this kit, sorted.
    pub fn node_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for Kit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kit")
            .field("url", &self.url)
            .field("title", &self.title)
            .field("version", &self.version)
            .field("tags", &self.tags)
            .field("handlers", &self.node_types())
            .finish()
    }
}

/// Flat node type to handler map used by the engine and the proxy receiver.
#[derive(Clone, Default)]
pub struct NodeHandlers {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl NodeHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any existing one.
    pub fn insert(&mut self, node_type: impl Into<String>, handler: impl NodeHandler) {
        self.handlers.insert(node_type.into(), Arc::new(handler));
    }

    pub fn insert_arc(&mut self, node_type: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(node_type.into(), handler);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    /// Registered node types, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Copy of this map with the given node types removed.
    pub fn without<S: AsRef<str>>(&self, node_types: &[S]) -> Self {
        let mut handlers = self.handlers.clone();
        for t in node_types {
            handlers.remove(t.as_ref());
        }
        Self { handlers }
    }

    /// Copy of this map restricted to the given node types.
    pub fn only<S: AsRef<str>>(&self, node_types: &[S]) -> Self {
        let handlers = self
            .handlers
            .iter()
            .filter(|(t, _)| node_types.iter().any(|allowed| allowed.as_ref() == t.as_str()))
            .map(|(t, h)| (t.clone(), h.clone()))
            .collect();
        Self { handlers }
    }

    /// Invoke the handler for `ctx.descriptor`, bounded by the handler's own
    /// timeout or `default_timeout_secs`.
    pub async fn invoke(
        &self,
        inputs: InputValues,
        ctx: NodeHandlerContext,
        default_timeout_secs: u64,
    ) -> Result<OutputValues> {
        let node_id = ctx.descriptor.id.clone();
        let node_type = ctx.descriptor.node_type.clone();
        let handler = self
            .get(&node_type)
            .ok_or_else(|| WireboardError::NoHandler(node_type.clone()))?;

        let timeout_secs = handler.timeout_secs().unwrap_or(default_timeout_secs);
        let timeout = Duration::from_secs(timeout_secs);

        match tokio::time::timeout(timeout, handler.invoke(inputs, ctx)).await {
            Ok(Ok(outputs)) => Ok(outputs),
            Ok(Err(e)) => Err(WireboardError::invocation(node_id, node_type, e)),
            Err(_) => Err(WireboardError::HandlerTimeout {
                node: node_id,
                timeout_secs,
            }),
        }
    }
}

impl fmt::Debug for NodeHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.types()).finish()
    }
}

/// Merge kit handler maps in list order.
///
/// When several kits define the same node type, the kit registered first
/// wins. [`KitRegistry::kit_for`] applies the same rule.
pub fn handlers_from_kits(kits: &[Kit]) -> NodeHandlers {
    let mut merged = NodeHandlers::new();
    for kit in kits {
        merge_kit(&mut merged, kit);
    }
    merged
}

fn merge_kit(merged: &mut NodeHandlers, kit: &Kit) {
    for (node_type, handler) in &kit.handlers {
        if merged.contains(node_type) {
            debug!(node_type = %node_type, kit = %kit.url, "Handler shadowed by earlier kit");
            continue;
        }
        merged.insert_arc(node_type.clone(), handler.clone());
    }
}

/// Ordered set of kits plus their merged handler map.
#[derive(Debug, Clone, Default)]
pub struct KitRegistry {
    kits: Vec<Kit>,
    handlers: NodeHandlers,
}

impl KitRegistry {
    pub fn new(kits: Vec<Kit>) -> Self {
        let handlers = handlers_from_kits(&kits);
        Self { kits, handlers }
    }

    /// Registry holding only the built-in `core` kit.
    pub fn with_builtins() -> Self {
        Self::new(vec![crate::builtin::core_kit()])
    }

    /// Append a kit. Types it shares with earlier kits stay with those kits.
    pub fn register_kit(&mut self, kit: Kit) {
        merge_kit(&mut self.handlers, &kit);
        self.kits.push(kit);
    }

    pub fn kits(&self) -> &[Kit] {
        &self.kits
    }

    pub fn handlers(&self) -> &NodeHandlers {
        &self.handlers
    }

    /// The kit whose handler resolves `node_type`.
    pub fn kit_for(&self, node_type: &str) -> Option<&Kit> {
        self.kits.iter().find(|k| k.provides(node_type))
    }

    /// Ask the resolved handler for its schemas.
    pub async fn describe(
        &self,
        node_type: &str,
        inputs: Option<&InputValues>,
    ) -> Result<NodeDescription> {
        let handler = self
            .handlers
            .get(node_type)
            .ok_or_else(|| WireboardError::NoHandler(node_type.to_string()))?;
        handler.describe(inputs).await
    }
}
