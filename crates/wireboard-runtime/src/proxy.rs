use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use wireboard_core::config::TunnelConfig;
use wireboard_core::error::{Result, WireboardError};
use wireboard_core::protocol::{ProxyRequest, ProxyResponse};
use wireboard_core::traits::NodeHandlerContext;
use wireboard_core::types::{reserved, InputValues, NodeDescriptor};
use wireboard_kits::NodeHandlers;

use crate::secrets::SecretKeeper;

/// Rejection message for node types outside the proxy list.
pub const NOT_PROXIABLE: &str = "Can't proxy a node of this node type.";

/// Rejection message when the `allowed` hook vetoes a request.
pub const NOT_ALLOWED: &str = "This proxy request is not allowed";

/// What a destination outside a secret's tunnel sees in place of plaintext.
pub const BLOCKED_SECRET: &str = "VALUE_BLOCKED";

/// Veto over individual proxy requests, consulted after the type check.
pub type AllowedFn = Arc<dyn Fn(&NodeDescriptor, &InputValues) -> bool + Send + Sync>;

/// Anything that can execute a proxied node: a local receiver, or a client
/// for a remote one.
pub trait ProxyEndpoint: Send + Sync + 'static {
    fn handle(&self, request: ProxyRequest) -> BoxFuture<'_, Result<ProxyResponse>>;
}

/// One-shot callback to whoever can supply secret values.
pub trait SecretResolver: Send + Sync + 'static {
    /// Values for `names`. Every requested name must be present.
    fn resolve(&self, names: Vec<String>) -> BoxFuture<'_, Result<HashMap<String, String>>>;
}

/// Resolver backed by a fixed table, used by the proxy server.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    values: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }
}

impl SecretResolver for StaticSecrets {
    fn resolve(&self, names: Vec<String>) -> BoxFuture<'_, Result<HashMap<String, String>>> {
        Box::pin(async move {
            names
                .into_iter()
                .map(|name| match self.values.get(&name) {
                    Some(value) => Ok((name, value.clone())),
                    None => Err(WireboardError::MissingSecret(name)),
                })
                .collect()
        })
    }
}

/// Compiled destination rule for one secret.
#[derive(Debug, Clone)]
pub struct SecretTunnel {
    to: Vec<String>,
    when: Vec<(String, Regex)>,
}

impl SecretTunnel {
    pub fn compile(config: &TunnelConfig) -> Result<Self> {
        let when = config
            .when
            .iter()
            .map(|(input, pattern)| {
                Regex::new(pattern)
                    .map(|re| (input.clone(), re))
                    .map_err(|e| {
                        WireboardError::Config(format!("tunnel pattern for {}: {}", input, e))
                    })
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            to: config.to.clone(),
            when,
        })
    }

    /// Compile every entry of a `tunnels` table.
    pub fn compile_all(configs: &HashMap<String, TunnelConfig>) -> Result<HashMap<String, Self>> {
        configs
            .iter()
            .map(|(name, config)| Ok((name.clone(), Self::compile(config)?)))
            .collect()
    }

    /// Whether a node of `node_type` with `inputs` may see the plaintext.
    ///
    /// Every `when` input must be a string matching its pattern.
    pub fn matches(&self, node_type: &str, inputs: &InputValues) -> bool {
        self.to.iter().any(|t| t == node_type)
            && self.when.iter().all(|(input, re)| {
                inputs
                    .get(input)
                    .and_then(Value::as_str)
                    .is_some_and(|value| re.is_match(value))
            })
    }
}

/// Executes a designated subset of node types on the trusted side.
///
/// Stateless across calls apart from the shared keeper, whose resolved
/// secrets stay cached for the rest of the session.
pub struct ProxyReceiver {
    handlers: Arc<NodeHandlers>,
    proxy_nodes: Vec<String>,
    keeper: Arc<SecretKeeper>,
    resolver: Option<Arc<dyn SecretResolver>>,
    tunnels: HashMap<String, SecretTunnel>,
    allowed: Option<AllowedFn>,
    timeout_secs: u64,
}

impl ProxyReceiver {
    pub fn new(handlers: Arc<NodeHandlers>, proxy_nodes: Vec<String>) -> Self {
        Self {
            handlers,
            proxy_nodes,
            keeper: Arc::new(SecretKeeper::new()),
            resolver: None,
            tunnels: HashMap::new(),
            allowed: None,
            timeout_secs: 300,
        }
    }

    pub fn with_keeper(mut self, keeper: Arc<SecretKeeper>) -> Self {
        self.keeper = keeper;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn SecretResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Restrict where the named secrets may be revealed. Secrets without a
    /// tunnel reach every proxied type.
    pub fn with_tunnels(mut self, tunnels: HashMap<String, SecretTunnel>) -> Self {
        self.tunnels = tunnels;
        self
    }

    pub fn with_allowed(mut self, allowed: AllowedFn) -> Self {
        self.allowed = Some(allowed);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn keeper(&self) -> &Arc<SecretKeeper> {
        &self.keeper
    }

    fn accepts(&self, node_type: &str) -> bool {
        self.proxy_nodes.iter().any(|t| t == node_type)
    }

    /// Run `request.node` with secrets revealed, returning concealed outputs.
    pub async fn handle(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        let ProxyRequest { node, inputs } = request;
        let node_type = node.node_type.clone();

        if !self.accepts(&node_type) {
            debug!(node_id = %node.id, node_type = %node_type, "Rejected proxy request");
            return Err(WireboardError::ProxyRejected(NOT_PROXIABLE.to_string()));
        }

        if node_type == reserved::SECRETS {
            let names = secret_names(&inputs);
            let tokens = self.keeper.add_secret_tokens(&names).await;
            info!(node_id = %node.id, count = tokens.len(), "Issued secret tokens");
            return Ok(ProxyResponse {
                node_type,
                value: tokens.into_iter().map(|(k, v)| (k, Value::String(v))).collect(),
            });
        }

        if !self.handlers.contains(&node_type) {
            return Err(WireboardError::ProxyRejected(NOT_PROXIABLE.to_string()));
        }

        if let Some(allowed) = &self.allowed {
            if !allowed(&node, &inputs) {
                debug!(node_id = %node.id, node_type = %node_type, "Proxy request vetoed");
                return Err(WireboardError::ProxyRejected(NOT_ALLOWED.to_string()));
            }
        }

        let value = Value::Object(inputs);
        let (tokens, blocked) = self.route_tokens(&node_type, &value).await;
        let value = SecretKeeper::block(value, &blocked, BLOCKED_SECRET);
        if !tokens.is_empty() {
            self.resolve_pending(&tokens).await?;
        }
        let revealed = match self.keeper.reveal_secrets(value, &tokens).await? {
            Value::Object(map) => map,
            _ => InputValues::new(),
        };

        info!(node_id = %node.id, node_type = %node_type, secrets = tokens.len(), "Proxying node");
        let ctx = NodeHandlerContext::new(node);
        let outputs = self.handlers.invoke(revealed, ctx, self.timeout_secs).await?;

        let value = match self.keeper.conceal(Value::Object(outputs)).await {
            Value::Object(map) => map,
            _ => InputValues::new(),
        };
        Ok(ProxyResponse { node_type, value })
    }

    /// Split the tokens in `value` into those the destination may see and
    /// those its secrets' tunnels block.
    async fn route_tokens(&self, node_type: &str, value: &Value) -> (Vec<String>, Vec<String>) {
        let tokens = SecretKeeper::find_secrets(value);
        if self.tunnels.is_empty() {
            return (tokens, vec![]);
        }
        let empty = InputValues::new();
        let inputs = value.as_object().unwrap_or(&empty);
        let mut allowed = vec![];
        let mut blocked = vec![];
        for token in tokens {
            let tunnel = match self.keeper.name_for(&token).await {
                Some(name) => self.tunnels.get(&name).map(|t| (name, t)),
                None => None,
            };
            match tunnel {
                Some((name, tunnel)) if !tunnel.matches(node_type, inputs) => {
                    warn!(secret = %name, node_type, "Secret blocked outside its tunnel");
                    blocked.push(token);
                }
                _ => allowed.push(token),
            }
        }
        (allowed, blocked)
    }

    async fn resolve_pending(&self, tokens: &[String]) -> Result<()> {
        let names = self.keeper.unresolved(tokens).await?;
        if names.is_empty() {
            return Ok(());
        }
        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| WireboardError::MissingSecret(names.join(", ")))?;
        debug!(secrets = ?names, "Resolving secrets");
        let mut values = resolver.resolve(names.clone()).await?;
        for name in names {
            let value = values
                .remove(&name)
                .ok_or_else(|| WireboardError::MissingSecret(name.clone()))?;
            self.keeper.resolve(&name, value).await;
        }
        Ok(())
    }
}

impl ProxyEndpoint for ProxyReceiver {
    fn handle(&self, request: ProxyRequest) -> BoxFuture<'_, Result<ProxyResponse>> {
        Box::pin(ProxyReceiver::handle(self, request))
    }
}

/// Names listed in a `secrets` node's `keys` input.
pub fn secret_names(inputs: &InputValues) -> Vec<String> {
    match inputs.get("keys") {
        Some(Value::Array(keys)) => keys
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(key)) => vec![key.clone()],
        _ => vec![],
    }
}
